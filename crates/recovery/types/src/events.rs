//! Event types emitted by the recovery engine
//!
//! Every component publishes into one envelope shape: identifier, type tag,
//! owning service, timestamp, severity and a typed payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CircuitState, DegradationLevel, EventId, HealthStatus, RecoveryPlanId, ServiceId};

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSeverity::Low => write!(f, "low"),
            EventSeverity::Medium => write!(f, "medium"),
            EventSeverity::High => write!(f, "high"),
            EventSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Envelope wrapping all recovery events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEventEnvelope {
    /// Unique event ID
    pub id: EventId,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Service the event belongs to
    pub service_id: ServiceId,

    /// Event severity
    pub severity: EventSeverity,

    /// The actual event
    pub event: RecoveryEvent,
}

impl RecoveryEventEnvelope {
    /// Wrap an event, deriving its severity from the payload.
    pub fn new(service_id: ServiceId, event: RecoveryEvent) -> Self {
        let severity = event.severity();
        Self::with_severity(service_id, severity, event)
    }

    pub fn with_severity(
        service_id: ServiceId,
        severity: EventSeverity,
        event: RecoveryEvent,
    ) -> Self {
        Self {
            id: EventId::generate(),
            timestamp: Utc::now(),
            service_id,
            severity,
            event,
        }
    }

    /// Stable type tag, e.g. `circuit_breaker_opened`.
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}

/// Counters captured at the moment a breaker changes state.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub error_rate: f64,
}

/// Circuit breaker lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BreakerEvent {
    Opened {
        previous: CircuitState,
        snapshot: BreakerSnapshot,
        next_attempt_at: DateTime<Utc>,
    },
    HalfOpened {
        previous: CircuitState,
        snapshot: BreakerSnapshot,
    },
    Closed {
        previous: CircuitState,
        snapshot: BreakerSnapshot,
    },
    /// Administrative override (`reset`, `force_open`, `force_closed`).
    Forced {
        previous: CircuitState,
        current: CircuitState,
        snapshot: BreakerSnapshot,
    },
}

impl BreakerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            BreakerEvent::Opened { .. } => "circuit_breaker_opened",
            BreakerEvent::HalfOpened { .. } => "circuit_breaker_half_opened",
            BreakerEvent::Closed { .. } => "circuit_breaker_closed",
            BreakerEvent::Forced { .. } => "circuit_breaker_reset",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            BreakerEvent::Opened { .. } => EventSeverity::High,
            BreakerEvent::HalfOpened { .. } => EventSeverity::Medium,
            BreakerEvent::Closed { .. } | BreakerEvent::Forced { .. } => EventSeverity::Low,
        }
    }
}

/// Health status transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthEvent {
    /// Status moved to `Degraded` or `Unhealthy`.
    CheckFailed {
        previous: HealthStatus,
        current: HealthStatus,
        consecutive_failures: u32,
        consecutive_successes: u32,
        error: Option<String>,
    },
    /// Status moved to `Healthy`.
    Recovered {
        previous: HealthStatus,
        current: HealthStatus,
        consecutive_failures: u32,
        consecutive_successes: u32,
    },
}

impl HealthEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            HealthEvent::CheckFailed { .. } => "health_check_failed",
            HealthEvent::Recovered { .. } => "health_check_recovered",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            HealthEvent::CheckFailed {
                current: HealthStatus::Unhealthy,
                ..
            } => EventSeverity::High,
            HealthEvent::CheckFailed { .. } => EventSeverity::Medium,
            HealthEvent::Recovered { .. } => EventSeverity::Low,
        }
    }
}

/// Retry lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryEvent {
    /// An attempt failed and another one is scheduled after `delay_ms`.
    AttemptFailed {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error: String,
    },
    Succeeded {
        attempts: u32,
    },
    NonRetryable {
        attempt: u32,
        error: String,
    },
    Exhausted {
        attempts: u32,
        error: String,
    },
}

impl RetryEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RetryEvent::AttemptFailed { .. } => "retry_attempt",
            RetryEvent::Succeeded { .. } => "retry_success",
            RetryEvent::NonRetryable { .. } => "retry_non_retryable",
            RetryEvent::Exhausted { .. } => "retry_exhausted",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            RetryEvent::AttemptFailed { .. } | RetryEvent::Succeeded { .. } => EventSeverity::Low,
            RetryEvent::NonRetryable { .. } => EventSeverity::Medium,
            RetryEvent::Exhausted { .. } => EventSeverity::High,
        }
    }
}

/// Degradation lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradationEvent {
    Activated {
        previous: DegradationLevel,
        level: DegradationLevel,
        reason: String,
        affected_services: Vec<ServiceId>,
    },
    Deactivated {
        previous: DegradationLevel,
        reason: String,
    },
    CacheHit {
        operation: String,
        cache_key: String,
    },
    CacheMiss {
        operation: String,
        cache_key: String,
    },
    FallbackUsed {
        operation: String,
        reason: String,
    },
    FallbackFailed {
        operation: String,
        error: String,
    },
}

impl DegradationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DegradationEvent::Activated { .. } => "degradation_activated",
            DegradationEvent::Deactivated { .. } => "degradation_deactivated",
            DegradationEvent::CacheHit { .. } => "cache_hit",
            DegradationEvent::CacheMiss { .. } => "cache_miss",
            DegradationEvent::FallbackUsed { .. } => "fallback_used",
            DegradationEvent::FallbackFailed { .. } => "fallback_failed",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            DegradationEvent::Activated { level, .. } => match level {
                DegradationLevel::Emergency => EventSeverity::Critical,
                DegradationLevel::Minimal => EventSeverity::High,
                _ => EventSeverity::Medium,
            },
            DegradationEvent::Deactivated { .. } => EventSeverity::Low,
            DegradationEvent::CacheHit { .. } | DegradationEvent::CacheMiss { .. } => {
                EventSeverity::Low
            }
            DegradationEvent::FallbackUsed { .. } => EventSeverity::Medium,
            DegradationEvent::FallbackFailed { .. } => EventSeverity::High,
        }
    }
}

/// Orchestrator lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrchestratorEvent {
    ServiceRegistered,
    ServiceUnregistered,
    RecoveryPlanCreated {
        plan_id: RecoveryPlanId,
        actions: Vec<String>,
        error: String,
    },
    RecoveryPlanStarted {
        plan_id: RecoveryPlanId,
    },
    RecoveryPlanCompleted {
        plan_id: RecoveryPlanId,
        succeeded: usize,
        failed: usize,
    },
    RecoveryActionSucceeded {
        plan_id: RecoveryPlanId,
        action_id: String,
        duration_ms: u64,
    },
    RecoveryActionFailed {
        plan_id: RecoveryPlanId,
        action_id: String,
        error: String,
    },
    SystemHealthChecked {
        total_services: usize,
        healthy: usize,
        degraded: usize,
        unhealthy: usize,
        degradation_level: DegradationLevel,
    },
    OperatorAlert {
        message: String,
        error: Option<String>,
    },
}

impl OrchestratorEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            OrchestratorEvent::ServiceRegistered => "service_registered",
            OrchestratorEvent::ServiceUnregistered => "service_unregistered",
            OrchestratorEvent::RecoveryPlanCreated { .. } => "recovery_plan_created",
            OrchestratorEvent::RecoveryPlanStarted { .. } => "recovery_plan_started",
            OrchestratorEvent::RecoveryPlanCompleted { .. } => "recovery_plan_completed",
            OrchestratorEvent::RecoveryActionSucceeded { .. } => "recovery_action_success",
            OrchestratorEvent::RecoveryActionFailed { .. } => "recovery_action_failed",
            OrchestratorEvent::SystemHealthChecked { .. } => "system_health_check",
            OrchestratorEvent::OperatorAlert { .. } => "operator_alert",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            OrchestratorEvent::ServiceRegistered
            | OrchestratorEvent::ServiceUnregistered
            | OrchestratorEvent::RecoveryPlanStarted { .. }
            | OrchestratorEvent::RecoveryActionSucceeded { .. }
            | OrchestratorEvent::SystemHealthChecked { .. } => EventSeverity::Low,
            OrchestratorEvent::RecoveryPlanCreated { .. } => EventSeverity::Medium,
            OrchestratorEvent::RecoveryPlanCompleted { failed, .. } => {
                if *failed > 0 {
                    EventSeverity::Medium
                } else {
                    EventSeverity::Low
                }
            }
            OrchestratorEvent::RecoveryActionFailed { .. } => EventSeverity::High,
            OrchestratorEvent::OperatorAlert { .. } => EventSeverity::Critical,
        }
    }
}

/// Any event the engine can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecoveryEvent {
    Breaker(BreakerEvent),
    Health(HealthEvent),
    Retry(RetryEvent),
    Degradation(DegradationEvent),
    Orchestrator(OrchestratorEvent),
}

impl RecoveryEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RecoveryEvent::Breaker(e) => e.event_type(),
            RecoveryEvent::Health(e) => e.event_type(),
            RecoveryEvent::Retry(e) => e.event_type(),
            RecoveryEvent::Degradation(e) => e.event_type(),
            RecoveryEvent::Orchestrator(e) => e.event_type(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            RecoveryEvent::Breaker(e) => e.severity(),
            RecoveryEvent::Health(e) => e.severity(),
            RecoveryEvent::Retry(e) => e.severity(),
            RecoveryEvent::Degradation(e) => e.severity(),
            RecoveryEvent::Orchestrator(e) => e.severity(),
        }
    }
}

impl From<BreakerEvent> for RecoveryEvent {
    fn from(event: BreakerEvent) -> Self {
        RecoveryEvent::Breaker(event)
    }
}

impl From<HealthEvent> for RecoveryEvent {
    fn from(event: HealthEvent) -> Self {
        RecoveryEvent::Health(event)
    }
}

impl From<RetryEvent> for RecoveryEvent {
    fn from(event: RetryEvent) -> Self {
        RecoveryEvent::Retry(event)
    }
}

impl From<DegradationEvent> for RecoveryEvent {
    fn from(event: DegradationEvent) -> Self {
        RecoveryEvent::Degradation(event)
    }
}

impl From<OrchestratorEvent> for RecoveryEvent {
    fn from(event: OrchestratorEvent) -> Self {
        RecoveryEvent::Orchestrator(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_derives_severity_and_tag() {
        let envelope = RecoveryEventEnvelope::new(
            ServiceId::new("search"),
            HealthEvent::CheckFailed {
                previous: HealthStatus::Degraded,
                current: HealthStatus::Unhealthy,
                consecutive_failures: 3,
                consecutive_successes: 0,
                error: None,
            }
            .into(),
        );

        assert_eq!(envelope.event_type(), "health_check_failed");
        assert_eq!(envelope.severity, EventSeverity::High);
        assert_eq!(envelope.service_id.as_str(), "search");
    }

    #[test]
    fn test_emergency_activation_is_critical() {
        let event: RecoveryEvent = DegradationEvent::Activated {
            previous: DegradationLevel::None,
            level: DegradationLevel::Emergency,
            reason: "outage".to_string(),
            affected_services: vec![],
        }
        .into();
        assert_eq!(event.severity(), EventSeverity::Critical);
        assert_eq!(event.event_type(), "degradation_activated");
    }

    #[test]
    fn test_envelope_serializes() {
        let envelope = RecoveryEventEnvelope::new(
            ServiceId::system(),
            OrchestratorEvent::OperatorAlert {
                message: "check the database".to_string(),
                error: Some("connection reset".to_string()),
            }
            .into(),
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["service_id"], "system");
        assert_eq!(json["severity"], "critical");
    }
}
