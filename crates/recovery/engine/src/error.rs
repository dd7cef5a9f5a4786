//! Error types for the recovery engine.
//!
//! Admission rejections, wrapped operation failures, probe and recovery
//! action failures all surface as [`RecoveryError`].

use chrono::{DateTime, Utc};
use recovery_types::{DegradationLevel, ServiceId};
use thiserror::Error;

/// Boxed error produced by a caller-supplied operation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while executing guarded operations.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Circuit breaker is open, rejecting requests.
    #[error("circuit breaker open for service {service_id}, next attempt at {next_attempt_at}")]
    CircuitOpen {
        service_id: ServiceId,
        next_attempt_at: DateTime<Utc>,
    },

    /// All half-open trial calls have already been issued.
    #[error("circuit breaker half-open for service {service_id}: trial quota of {max_calls} exhausted")]
    HalfOpenExhausted { service_id: ServiceId, max_calls: u32 },

    /// Operation is disabled at the current degradation level.
    #[error("operation {operation} is disabled at degradation level {level}")]
    FeatureDisabled {
        operation: String,
        level: DegradationLevel,
    },

    /// Per-operation rate limit exceeded.
    #[error("rate limit exceeded for operation {operation} ({limit} requests per minute)")]
    RateLimited { operation: String, limit: u32 },

    /// Attempt did not finish within its timeout.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Error raised by the wrapped operation itself, displayed unchanged.
    #[error("{0}")]
    Operation(BoxError),

    /// Service is not registered.
    #[error("service not found: {0}")]
    ServiceNotFound(ServiceId),

    /// Health probe raised an error.
    #[error("health probe failed for service {service_id}: {reason}")]
    ProbeFailed {
        service_id: ServiceId,
        reason: String,
    },

    /// Recovery action failed to execute.
    #[error("recovery action {action_id} failed for service {service_id}: {reason}")]
    RecoveryActionFailed {
        service_id: ServiceId,
        action_id: String,
        reason: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RecoveryError {
    /// Convert a caller error into a `RecoveryError`.
    ///
    /// Errors that already are `RecoveryError`s (for example a breaker
    /// wrapping a retry executor) pass through without another layer.
    pub fn from_operation<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        match err.into().downcast::<RecoveryError>() {
            Ok(inner) => *inner,
            Err(other) => RecoveryError::Operation(other),
        }
    }

    /// Build an operation error from a plain message.
    pub fn operation(message: impl Into<String>) -> Self {
        let message: String = message.into();
        RecoveryError::Operation(message.into())
    }

    /// Synchronous rejections raised before the operation ran.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            RecoveryError::CircuitOpen { .. }
                | RecoveryError::HalfOpenExhausted { .. }
                | RecoveryError::FeatureDisabled { .. }
                | RecoveryError::RateLimited { .. }
        )
    }

    /// Short machine-readable classification used in recovery contexts.
    pub fn kind(&self) -> &'static str {
        match self {
            RecoveryError::CircuitOpen { .. } => "circuit_open",
            RecoveryError::HalfOpenExhausted { .. } => "half_open_exhausted",
            RecoveryError::FeatureDisabled { .. } => "feature_disabled",
            RecoveryError::RateLimited { .. } => "rate_limited",
            RecoveryError::Timeout { .. } => "timeout",
            RecoveryError::Operation(_) => "operation",
            RecoveryError::ServiceNotFound(_) => "service_not_found",
            RecoveryError::ProbeFailed { .. } => "probe_failed",
            RecoveryError::RecoveryActionFailed { .. } => "recovery_action_failed",
            RecoveryError::Configuration(_) => "configuration",
        }
    }
}

/// Result type for recovery operations.
pub type RecoveryResult<T> = Result<T, RecoveryError>;
