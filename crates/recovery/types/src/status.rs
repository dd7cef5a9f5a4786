//! State vocabularies shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Operations pass through.
    Closed,

    /// Operations are rejected immediately.
    Open,

    /// A bounded number of trial operations is allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Health classification of a monitored service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Enough consecutive successful probes.
    Healthy,

    /// Early warning: a probe failed while the service was healthy.
    Degraded,

    /// Enough consecutive failed probes.
    Unhealthy,

    /// No check has completed yet.
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Ordered degradation tiers, strictly increasing in severity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    #[default]
    None,
    Partial,
    Minimal,
    Emergency,
}

impl DegradationLevel {
    /// All levels in ascending severity.
    pub const ALL: [DegradationLevel; 4] = [
        DegradationLevel::None,
        DegradationLevel::Partial,
        DegradationLevel::Minimal,
        DegradationLevel::Emergency,
    ];

    /// Fraction of the base request rate allowed at this level.
    pub fn rate_factor(&self) -> f64 {
        match self {
            DegradationLevel::None => 1.0,
            DegradationLevel::Partial => 0.8,
            DegradationLevel::Minimal => 0.5,
            DegradationLevel::Emergency => 0.2,
        }
    }

    pub fn is_degraded(&self) -> bool {
        *self != DegradationLevel::None
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradationLevel::None => write!(f, "none"),
            DegradationLevel::Partial => write!(f, "partial"),
            DegradationLevel::Minimal => write!(f, "minimal"),
            DegradationLevel::Emergency => write!(f, "emergency"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degradation_levels_are_ordered() {
        assert!(DegradationLevel::None < DegradationLevel::Partial);
        assert!(DegradationLevel::Partial < DegradationLevel::Minimal);
        assert!(DegradationLevel::Minimal < DegradationLevel::Emergency);

        let mut sorted = DegradationLevel::ALL;
        sorted.sort();
        assert_eq!(sorted, DegradationLevel::ALL);
    }

    #[test]
    fn test_rate_factor_shrinks_with_severity() {
        let factors: Vec<f64> = DegradationLevel::ALL.iter().map(|l| l.rate_factor()).collect();
        assert!(factors.windows(2).all(|w| w[0] > w[1]));
    }
}
