//! Recovery engine configuration.
//!
//! Defines configuration for circuit breakers, health tracking, retries,
//! degradation and the orchestrator, plus per-service overrides.

use std::collections::BTreeMap;
use std::time::Duration;

use recovery_types::DegradationLevel;
use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, RecoveryResult};
use crate::health::ProbeOverride;
use crate::retry::{BackoffStrategy, DelayFn, RetryPredicate};

/// Process-wide defaults for every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Circuit breaker defaults.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Health check defaults.
    pub health: HealthCheckConfig,

    /// Retry defaults.
    pub retry: RetryConfig,

    /// Degradation defaults.
    pub degradation: DegradationConfig,

    /// Orchestrator settings.
    pub orchestrator: OrchestratorConfig,
}

impl RecoveryConfig {
    /// Parse defaults from JSON; missing sections keep their defaults.
    pub fn from_json_str(json: &str) -> RecoveryResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RecoveryError::Configuration(format!("invalid JSON config: {}", e)))?;
        config.validate()
    }

    /// Validate every section.
    pub fn validate(self) -> RecoveryResult<Self> {
        Ok(Self {
            circuit_breaker: self.circuit_breaker.validate()?,
            health: self.health.validate()?,
            retry: self.retry.validate()?,
            degradation: self.degradation.validate()?,
            orchestrator: self.orchestrator.validate()?,
        })
    }

    /// Merge per-service overrides over these defaults and validate the result.
    pub fn service_config(&self, overrides: &ServiceOverrides) -> RecoveryResult<ServiceConfig> {
        let merged = ServiceConfig {
            circuit_breaker: overrides
                .circuit_breaker
                .clone()
                .unwrap_or_else(|| self.circuit_breaker.clone()),
            health: overrides
                .health
                .clone()
                .unwrap_or_else(|| self.health.clone()),
            retry: overrides.retry.clone().unwrap_or_else(|| self.retry.clone()),
            degradation: overrides
                .degradation
                .clone()
                .unwrap_or_else(|| self.degradation.clone()),
        };
        merged.validate()
    }
}

/// Optional per-service replacements for the process-wide defaults.
///
/// Build partial overrides with struct update syntax:
/// `CircuitBreakerConfig { failure_threshold: 3, ..defaults.circuit_breaker.clone() }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOverrides {
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub health: Option<HealthCheckConfig>,
    pub retry: Option<RetryConfig>,
    pub degradation: Option<DegradationConfig>,
}

/// Effective configuration of one service after merging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub health: HealthCheckConfig,
    pub retry: RetryConfig,
    pub degradation: DegradationConfig,
}

impl ServiceConfig {
    pub fn validate(self) -> RecoveryResult<Self> {
        Ok(Self {
            circuit_breaker: self.circuit_breaker.validate()?,
            health: self.health.validate()?,
            retry: self.retry.validate()?,
            degradation: self.degradation.validate()?,
        })
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Time to wait before transitioning from open to half-open.
    pub reset_timeout: Duration,

    /// Window over which throughput and error rate are measured.
    pub monitoring_window: Duration,

    /// Requests required inside the window before the circuit may open.
    pub minimum_throughput: u32,

    /// Error rate (0.0-1.0) that opens the circuit.
    pub error_rate_threshold: f64,

    /// Trial calls allowed in half-open; that many successes close the circuit.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(60),
            minimum_throughput: 10,
            error_rate_threshold: 0.5,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(self) -> RecoveryResult<Self> {
        if self.failure_threshold < 1 {
            return Err(config_error("circuit_breaker.failure_threshold must be >= 1"));
        }
        if self.minimum_throughput < 1 {
            return Err(config_error("circuit_breaker.minimum_throughput must be >= 1"));
        }
        if self.half_open_max_calls < 1 {
            return Err(config_error("circuit_breaker.half_open_max_calls must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err(config_error(
                "circuit_breaker.error_rate_threshold must be within 0.0..=1.0",
            ));
        }
        if self.monitoring_window.is_zero() {
            return Err(config_error("circuit_breaker.monitoring_window must be > 0"));
        }
        Ok(self)
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Interval between polls.
    pub interval: Duration,

    /// Per-check timeout; a timed out check counts as unhealthy.
    pub timeout: Duration,

    /// Consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Consecutive successes before marking healthy.
    pub healthy_threshold: u32,

    /// Probe used instead of the one supplied at registration.
    #[serde(skip)]
    pub custom_probe: Option<ProbeOverride>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            custom_probe: None,
        }
    }
}

impl HealthCheckConfig {
    pub fn validate(self) -> RecoveryResult<Self> {
        if self.interval.is_zero() {
            return Err(config_error("health.interval must be > 0"));
        }
        if self.timeout.is_zero() {
            return Err(config_error("health.timeout must be > 0"));
        }
        if self.unhealthy_threshold < 1 || self.healthy_threshold < 1 {
            return Err(config_error(
                "health.unhealthy_threshold and health.healthy_threshold must be >= 1",
            ));
        }
        Ok(self)
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Base delay fed into the backoff strategy.
    pub base_delay: Duration,

    /// Upper bound for any computed delay.
    pub max_delay: Duration,

    /// Backoff strategy.
    pub strategy: BackoffStrategy,

    /// Growth factor for exponential strategies.
    pub backoff_multiplier: f64,

    /// Jitter proportion (0.0-1.0) for `ExponentialJitter`.
    pub jitter_factor: f64,

    /// Timeout applied to every attempt.
    pub attempt_timeout: Duration,

    /// Delay function used by `BackoffStrategy::Custom`.
    #[serde(skip)]
    pub custom_delay: Option<DelayFn>,

    /// Replaces the built-in retryability classification.
    #[serde(skip)]
    pub retry_predicate: Option<RetryPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::ExponentialJitter,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            attempt_timeout: Duration::from_secs(30),
            custom_delay: None,
            retry_predicate: None,
        }
    }
}

impl RetryConfig {
    pub fn validate(self) -> RecoveryResult<Self> {
        if self.max_attempts < 1 {
            return Err(config_error("retry.max_attempts must be >= 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(config_error("retry.base_delay must not exceed retry.max_delay"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(config_error("retry.jitter_factor must be within 0.0..=1.0"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(config_error("retry.backoff_multiplier must be >= 1.0"));
        }
        if self.attempt_timeout.is_zero() {
            return Err(config_error("retry.attempt_timeout must be > 0"));
        }
        if self.strategy == BackoffStrategy::Custom && self.custom_delay.is_none() {
            return Err(config_error(
                "retry.strategy is custom but no custom_delay function was supplied",
            ));
        }
        Ok(self)
    }
}

/// Degradation controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    /// Base per-operation rate, scaled down by the degradation level.
    pub requests_per_minute: u32,

    /// Rate limiting at level `None`; always on while degraded.
    pub rate_limiting_enabled: bool,

    /// Write-through caching at level `None`; always on while degraded.
    pub cache_enabled: bool,

    /// Default cache entry lifetime.
    pub cache_ttl: Duration,

    /// Maximum cache entries; the oldest entry is evicted first.
    pub max_cache_size: usize,

    /// Interval of the expired-entry sweep.
    pub cache_cleanup_interval: Duration,

    /// Interval of the rate-limit window sweep.
    pub rate_limit_cleanup_interval: Duration,

    /// Operations disabled at each level. A level also disables everything
    /// listed for the lower levels.
    pub disabled_features: BTreeMap<DegradationLevel, Vec<String>>,

    /// Fallback names, in activation order.
    pub fallbacks: Vec<String>,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 1000,
            rate_limiting_enabled: false,
            cache_enabled: true,
            cache_ttl: Duration::from_secs(300),
            max_cache_size: 1000,
            cache_cleanup_interval: Duration::from_secs(300),
            rate_limit_cleanup_interval: Duration::from_secs(60),
            disabled_features: BTreeMap::new(),
            fallbacks: vec![
                "cached_responses".to_string(),
                "simplified_processing".to_string(),
                "static_content".to_string(),
                "queue_requests".to_string(),
                "read_only_mode".to_string(),
            ],
        }
    }
}

impl DegradationConfig {
    pub fn validate(self) -> RecoveryResult<Self> {
        if self.requests_per_minute < 1 {
            return Err(config_error("degradation.requests_per_minute must be >= 1"));
        }
        if self.max_cache_size < 1 {
            return Err(config_error("degradation.max_cache_size must be >= 1"));
        }
        if self.cache_ttl.is_zero() {
            return Err(config_error("degradation.cache_ttl must be > 0"));
        }
        if self.cache_cleanup_interval.is_zero() || self.rate_limit_cleanup_interval.is_zero() {
            return Err(config_error("degradation cleanup intervals must be > 0"));
        }
        Ok(self)
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Interval of the system-wide monitor loop.
    pub monitor_interval: Duration,

    /// Default interval of the health manager's shared summary loop.
    pub health_summary_interval: Duration,

    /// Timeout applied to every recovery action.
    pub action_timeout: Duration,

    /// Number of finished plans kept for inspection.
    pub plan_history_size: usize,

    /// Build and run recovery plans on failures.
    pub auto_recovery_enabled: bool,

    /// Failed retry attempts above which the degrade action applies.
    pub degrade_after_failed_attempts: u64,

    /// Unhealthy share above which the system goes to `Emergency`.
    pub emergency_unhealthy_ratio: f64,

    /// Unhealthy share above which the system goes to `Minimal`.
    pub minimal_unhealthy_ratio: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            health_summary_interval: Duration::from_secs(60),
            action_timeout: Duration::from_secs(10),
            plan_history_size: 100,
            auto_recovery_enabled: true,
            degrade_after_failed_attempts: 5,
            emergency_unhealthy_ratio: 0.5,
            minimal_unhealthy_ratio: 0.3,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(self) -> RecoveryResult<Self> {
        if self.monitor_interval.is_zero() || self.health_summary_interval.is_zero() {
            return Err(config_error("orchestrator intervals must be > 0"));
        }
        if self.action_timeout.is_zero() {
            return Err(config_error("orchestrator.action_timeout must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.minimal_unhealthy_ratio)
            || !(0.0..=1.0).contains(&self.emergency_unhealthy_ratio)
            || self.minimal_unhealthy_ratio > self.emergency_unhealthy_ratio
        {
            return Err(config_error(
                "orchestrator unhealthy ratios must be within 0.0..=1.0 and minimal <= emergency",
            ));
        }
        Ok(self)
    }
}

fn config_error(message: &str) -> RecoveryError {
    RecoveryError::Configuration(message.to_string())
}
