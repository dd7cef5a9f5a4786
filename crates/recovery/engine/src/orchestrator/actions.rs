//! Recovery actions.
//!
//! An action pairs a predicate over [`RecoveryContext`] with an async
//! effect applied to the failing service's components.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recovery_types::{
    CircuitState, DegradationLevel, EventSeverity, HealthStatus, OrchestratorEvent, ServiceId,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::breaker::{CircuitBreaker, CircuitBreakerMetrics};
use crate::degradation::DegradationController;
use crate::error::BoxError;
use crate::events::EventBus;
use crate::health::{ServiceHealth, ServiceHealthTracker};
use crate::retry::RetryMetrics;

/// Category of a recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    Restart,
    Reconnect,
    Degrade,
    Alert,
    Custom,
}

/// What was known about a service when recovery was triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub service_id: ServiceId,

    /// Machine-readable error classification.
    pub error_type: String,
    pub error: String,

    pub circuit_breaker: Option<CircuitBreakerMetrics>,
    pub health: Option<ServiceHealth>,
    pub retry: Option<RetryMetrics>,

    pub timestamp: DateTime<Utc>,

    /// Actions applied by earlier plans for this service, oldest first.
    pub previous_actions: Vec<String>,
}

impl RecoveryContext {
    pub fn breaker_state(&self) -> Option<CircuitState> {
        self.circuit_breaker.as_ref().map(|m| m.state)
    }

    pub fn health_status(&self) -> Option<HealthStatus> {
        self.health.as_ref().map(|h| h.status)
    }

    pub fn failed_retry_attempts(&self) -> u64 {
        self.retry.as_ref().map(|r| r.failed_attempts).unwrap_or(0)
    }
}

/// Components of the service a plan is recovering.
#[derive(Clone)]
pub struct RecoveryTarget {
    pub service_id: ServiceId,
    pub breaker: Arc<CircuitBreaker>,

    /// Present only for services registered with a probe.
    pub health: Option<Arc<ServiceHealthTracker>>,

    pub degradation: Arc<DegradationController>,
    pub events: EventBus,
    pub context: RecoveryContext,
}

/// Effect of a recovery action.
#[async_trait]
pub trait ActionEffect: Send + Sync {
    async fn apply(&self, target: &RecoveryTarget) -> Result<(), BoxError>;
}

/// Effect backed by a closure receiving an owned target.
pub struct FnEffect<F> {
    effect_fn: F,
}

#[async_trait]
impl<F, Fut> ActionEffect for FnEffect<F>
where
    F: Fn(RecoveryTarget) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn apply(&self, target: &RecoveryTarget) -> Result<(), BoxError> {
        (self.effect_fn)(target.clone()).await
    }
}

/// Create an effect from a closure.
pub fn effect_fn<F, Fut>(effect_fn: F) -> FnEffect<F>
where
    F: Fn(RecoveryTarget) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    FnEffect { effect_fn }
}

type Condition = Arc<dyn Fn(&RecoveryContext) -> bool + Send + Sync>;

/// One step of a recovery plan.
#[derive(Clone)]
pub struct RecoveryAction {
    pub id: String,
    pub kind: RecoveryActionKind,

    /// Higher runs first.
    pub priority: u8,

    /// Per-action timeout; the orchestrator default applies when unset.
    pub timeout: Option<Duration>,

    /// Re-attempt once after a failure.
    pub retryable: bool,

    condition: Condition,
    effect: Arc<dyn ActionEffect>,
}

impl RecoveryAction {
    /// Create an always-applicable action.
    pub fn new(
        id: impl Into<String>,
        kind: RecoveryActionKind,
        priority: u8,
        effect: impl ActionEffect + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            priority,
            timeout: None,
            retryable: false,
            condition: Arc::new(|_| true),
            effect: Arc::new(effect),
        }
    }

    /// Restrict the action to contexts matching `condition`.
    pub fn when<C>(mut self, condition: C) -> Self
    where
        C: Fn(&RecoveryContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Arc::new(condition);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn applies_to(&self, context: &RecoveryContext) -> bool {
        (self.condition)(context)
    }

    pub async fn apply(&self, target: &RecoveryTarget) -> Result<(), BoxError> {
        self.effect.apply(target).await
    }
}

impl fmt::Debug for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryAction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("retryable", &self.retryable)
            .finish_non_exhaustive()
    }
}

/// Reset the breaker and the health tracker.
struct RestartEffect;

#[async_trait]
impl ActionEffect for RestartEffect {
    async fn apply(&self, target: &RecoveryTarget) -> Result<(), BoxError> {
        target.breaker.reset();
        if let Some(health) = &target.health {
            health.reset();
        }
        info!(service_id = %target.service_id, "Service components restarted");
        Ok(())
    }
}

/// Force one immediate probe.
struct ReconnectEffect;

#[async_trait]
impl ActionEffect for ReconnectEffect {
    async fn apply(&self, target: &RecoveryTarget) -> Result<(), BoxError> {
        let Some(health) = &target.health else {
            return Err(format!("no health tracker for service {}", target.service_id).into());
        };
        let result = health.check().await;
        info!(
            service_id = %target.service_id,
            healthy = result.healthy,
            "Reconnect probe completed"
        );
        Ok(())
    }
}

/// Escalate the service to partial degradation.
struct DegradeEffect;

#[async_trait]
impl ActionEffect for DegradeEffect {
    async fn apply(&self, target: &RecoveryTarget) -> Result<(), BoxError> {
        if target.degradation.level() < DegradationLevel::Partial {
            target.degradation.set_degradation_level(
                DegradationLevel::Partial,
                format!(
                    "repeated retry failures ({} failed attempts)",
                    target.context.failed_retry_attempts()
                ),
                vec![target.service_id.clone()],
            );
        }
        Ok(())
    }
}

/// Notify operators.
struct AlertEffect;

#[async_trait]
impl ActionEffect for AlertEffect {
    async fn apply(&self, target: &RecoveryTarget) -> Result<(), BoxError> {
        let message = format!(
            "Recovery triggered for service {} ({})",
            target.service_id, target.context.error_type
        );
        warn!(service_id = %target.service_id, error = %target.context.error, "{}", message);
        target.events.publish_with_severity(
            &target.service_id,
            EventSeverity::Critical,
            OrchestratorEvent::OperatorAlert {
                message,
                error: Some(target.context.error.clone()),
            },
        );
        Ok(())
    }
}

/// Built-in actions, highest priority first.
///
/// `degrade_after` is the number of failed retry attempts above which the
/// degrade action applies.
pub fn default_actions(degrade_after: u64) -> Vec<RecoveryAction> {
    vec![
        RecoveryAction::new("restart", RecoveryActionKind::Restart, 8, RestartEffect)
            .when(|ctx| ctx.breaker_state() == Some(CircuitState::Open)),
        RecoveryAction::new("reconnect", RecoveryActionKind::Reconnect, 7, ReconnectEffect)
            .when(|ctx| ctx.health_status() == Some(HealthStatus::Unhealthy)),
        RecoveryAction::new("degrade", RecoveryActionKind::Degrade, 6, DegradeEffect)
            .when(move |ctx| ctx.failed_retry_attempts() > degrade_after),
        RecoveryAction::new("alert", RecoveryActionKind::Alert, 5, AlertEffect),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, DegradationConfig};

    fn context() -> RecoveryContext {
        RecoveryContext {
            service_id: ServiceId::new("db"),
            error_type: "operation".to_string(),
            error: "boom".to_string(),
            circuit_breaker: None,
            health: None,
            retry: None,
            timestamp: Utc::now(),
            previous_actions: Vec::new(),
        }
    }

    fn target(context: RecoveryContext) -> RecoveryTarget {
        let events = EventBus::new();
        let id = context.service_id.clone();
        RecoveryTarget {
            service_id: id.clone(),
            breaker: Arc::new(CircuitBreaker::new(
                id.clone(),
                CircuitBreakerConfig::default(),
                events.clone(),
            )),
            health: None,
            degradation: Arc::new(DegradationController::new(
                id,
                DegradationConfig::default(),
                events.clone(),
            )),
            events,
            context,
        }
    }

    fn applicable(context: &RecoveryContext) -> Vec<String> {
        default_actions(5)
            .into_iter()
            .filter(|a| a.applies_to(context))
            .map(|a| a.id)
            .collect()
    }

    fn retry_metrics(failed_attempts: u64) -> RetryMetrics {
        RetryMetrics {
            service_id: ServiceId::new("db"),
            total_attempts: failed_attempts,
            successful_attempts: 0,
            failed_attempts,
            average_attempts: 2.0,
            average_delay: Duration::from_millis(10),
            history_len: failed_attempts as usize,
            last_attempt_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_only_alert_applies_without_metrics() {
        assert_eq!(applicable(&context()), vec!["alert"]);
    }

    #[tokio::test]
    async fn test_restart_applies_to_open_breaker() {
        let target = target(context());
        target.breaker.force_open();

        let mut ctx = context();
        ctx.circuit_breaker = Some(target.breaker.metrics());
        assert_eq!(applicable(&ctx), vec!["restart", "alert"]);

        let restart = default_actions(5).remove(0);
        restart.apply(&target).await.unwrap();
        assert_eq!(target.breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_degrade_requires_more_than_threshold_failures() {
        let mut ctx = context();
        ctx.retry = Some(retry_metrics(5));
        assert_eq!(applicable(&ctx), vec!["alert"]);

        ctx.retry = Some(retry_metrics(6));
        assert_eq!(applicable(&ctx), vec!["degrade", "alert"]);
    }

    #[tokio::test]
    async fn test_degrade_escalates_to_partial_only() {
        let target = target(context());
        let degrade = default_actions(5).remove(2);

        degrade.apply(&target).await.unwrap();
        assert_eq!(target.degradation.level(), DegradationLevel::Partial);

        target
            .degradation
            .set_degradation_level(DegradationLevel::Minimal, "load", vec![]);
        degrade.apply(&target).await.unwrap();
        assert_eq!(target.degradation.level(), DegradationLevel::Minimal);
    }

    #[tokio::test]
    async fn test_alert_publishes_critical_event() {
        let target = target(context());
        let mut rx = target.events.subscribe();

        default_actions(5).remove(3).apply(&target).await.unwrap();

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.event_type(), "operator_alert");
        assert_eq!(envelope.severity, EventSeverity::Critical);
    }

    #[tokio::test]
    async fn test_reconnect_without_tracker_fails() {
        let target = target(context());
        assert!(default_actions(5).remove(1).apply(&target).await.is_err());
    }

    #[tokio::test]
    async fn test_custom_effect_fn() {
        let action = RecoveryAction::new(
            "flush",
            RecoveryActionKind::Custom,
            9,
            effect_fn(|target: RecoveryTarget| async move {
                target.degradation.clear_cache();
                Ok(())
            }),
        )
        .retryable(true)
        .with_timeout(Duration::from_secs(1));

        assert!(action.applies_to(&context()));
        action.apply(&target(context())).await.unwrap();
        assert!(format!("{:?}", action).contains("flush"));
    }
}
