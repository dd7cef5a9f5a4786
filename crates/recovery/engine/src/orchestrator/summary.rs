//! System health summary.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use recovery_types::{DegradationLevel, HealthStatus, ServiceId};
use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreakerMetrics;
use crate::config::OrchestratorConfig;
use crate::degradation::DegradationState;
use crate::health::{HealthSummary, ServiceHealth};
use crate::retry::RetryMetrics;

/// Metrics bundle of one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub circuit_breaker: Option<CircuitBreakerMetrics>,
    pub health: Option<ServiceHealth>,
    pub retry: Option<RetryMetrics>,
    pub degradation: Option<DegradationState>,
    pub error_count: u64,
    pub recovery_attempts: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Aggregate view across every known service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthSummary {
    pub overall_status: HealthStatus,
    pub degradation_level: DegradationLevel,
    pub active_recovery_plans: usize,

    pub total_services: usize,
    pub healthy_services: usize,
    pub degraded_services: usize,
    pub unhealthy_services: usize,
    pub open_circuit_breakers: usize,
    pub active_retry_executors: usize,

    pub services: HashMap<ServiceId, ServiceMetrics>,
    pub checked_at: DateTime<Utc>,
}

/// Global level implied by the health of the registered services.
pub fn target_degradation_level(
    health: &HealthSummary,
    config: &OrchestratorConfig,
) -> DegradationLevel {
    let ratio = health.unhealthy_ratio();
    if ratio > config.emergency_unhealthy_ratio {
        DegradationLevel::Emergency
    } else if ratio > config.minimal_unhealthy_ratio {
        DegradationLevel::Minimal
    } else if health.degraded > 0 {
        DegradationLevel::Partial
    } else {
        DegradationLevel::None
    }
}
