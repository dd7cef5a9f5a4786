//! # Recovery Engine - Fault Tolerance for Service Dependencies
//!
//! This crate wraps calls to unreliable dependencies (databases, caches,
//! remote APIs) with layered fault tolerance and coordinates automatic
//! recovery when they fail.
//!
//! ## Key Components
//!
//! - [`breaker`]: Per-service circuit breakers (closed / open / half-open)
//! - [`health`]: Polled health probes with streak-based classification
//! - [`retry`]: Bounded retries with pluggable backoff and error classification
//! - [`degradation`]: Degradation levels gating features, rate limits and a response cache
//! - [`orchestrator`]: The composition root running recovery plans
//!
//! Every component publishes typed events on a shared [`EventBus`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use recovery_engine::{
//!     orchestrator::{ExecuteOptions, RecoveryOrchestrator, ServiceRegistration},
//!     RecoveryConfig,
//! };
//! use recovery_types::ServiceId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let orchestrator = Arc::new(RecoveryOrchestrator::new(RecoveryConfig::default())?);
//! orchestrator.start();
//!
//! let db = ServiceId::new("database");
//! orchestrator.register_service(&db, ServiceRegistration::new())?;
//!
//! let rows = orchestrator
//!     .execute_with_recovery(
//!         &db,
//!         "load_users",
//!         || async { Ok::<_, std::io::Error>(vec!["alice", "bob"]) },
//!         ExecuteOptions::new().with_fallback(|| async { Ok::<_, std::io::Error>(vec![]) }),
//!     )
//!     .await?;
//! println!("{} rows", rows.len());
//!
//! orchestrator.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Layering
//!
//! A guarded call passes the degradation controller's admission check, then
//! the circuit breaker, then the retry executor. The breaker sees one outcome
//! per retry sequence. Failures are recorded, offered to the fallback and
//! handed to a recovery plan.

#![deny(unsafe_code)]

pub mod breaker;
pub mod config;
pub mod degradation;
pub mod error;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod retry;
pub mod task;

// Re-export main types
pub use breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerRegistry};
pub use config::{
    CircuitBreakerConfig, DegradationConfig, HealthCheckConfig, OrchestratorConfig,
    RecoveryConfig, RetryConfig, ServiceConfig, ServiceOverrides,
};
pub use degradation::{DegradationController, DegradationRegistry, DegradationState, Fallback};
pub use error::{BoxError, RecoveryError, RecoveryResult};
pub use events::EventBus;
pub use health::{HealthCheckManager, HealthCheckResult, HealthProbe, ServiceHealthTracker};
pub use orchestrator::{
    ExecuteOptions, RecoveryAction, RecoveryOrchestrator, RecoveryPlan, ServiceRegistration,
    SystemHealthSummary,
};
pub use retry::{BackoffStrategy, RetryExecutor, RetryExecutorRegistry};
pub use task::MonitorHandle;

#[cfg(test)]
mod tests {
    use super::*;
    use recovery_types::{DegradationLevel, ServiceId};
    use std::sync::Arc;

    #[test]
    fn test_default_config_is_valid() {
        let config = RecoveryConfig::default().validate().unwrap();
        assert!(config.orchestrator.auto_recovery_enabled);
        assert!(
            config.orchestrator.minimal_unhealthy_ratio
                < config.orchestrator.emergency_unhealthy_ratio
        );
    }

    #[tokio::test]
    async fn test_orchestrator_integration() {
        let orchestrator = Arc::new(RecoveryOrchestrator::new(RecoveryConfig::default()).unwrap());
        let id = ServiceId::new("database");
        orchestrator
            .register_service(&id, ServiceRegistration::new())
            .unwrap();

        let value = orchestrator
            .execute_with_recovery(
                &id,
                "ping",
                || async { Ok::<_, BoxError>("pong") },
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, "pong");

        let summary = orchestrator.get_system_health_summary();
        assert_eq!(summary.total_services, 1);
        assert_eq!(summary.degradation_level, DegradationLevel::None);
        assert_eq!(summary.open_circuit_breakers, 0);
    }
}
