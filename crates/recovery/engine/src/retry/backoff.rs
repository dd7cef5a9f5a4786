//! Backoff strategies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base_delay`.
    Fixed,
    /// `base_delay * attempt`.
    Linear,
    /// `base_delay * multiplier^(attempt - 1)`.
    Exponential,
    /// Exponential plus up to `jitter_factor` of itself at random.
    ExponentialJitter,
    /// Delegates to [`RetryConfig::custom_delay`].
    Custom,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::ExponentialJitter
    }
}

/// Caller-supplied delay function, called with the 1-based attempt that failed.
#[derive(Clone)]
pub struct DelayFn(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl DelayFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        (self.0)(attempt)
    }
}

impl fmt::Debug for DelayFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DelayFn(..)")
    }
}

/// Delay to wait after `attempt` (1-based) failed, clamped to `max_delay`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let base = config.base_delay.as_secs_f64();

    let secs = match config.strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base * f64::from(attempt),
        BackoffStrategy::Exponential => exponential(config, base, attempt),
        BackoffStrategy::ExponentialJitter => {
            let exp = exponential(config, base, attempt);
            exp + exp * config.jitter_factor * rand::random::<f64>()
        }
        BackoffStrategy::Custom => match &config.custom_delay {
            Some(delay_fn) => delay_fn.delay(attempt).as_secs_f64(),
            None => base,
        },
    };

    clamp(secs, config.max_delay)
}

fn exponential(config: &RetryConfig, base: f64, attempt: u32) -> f64 {
    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    base * config.backoff_multiplier.powi(exponent)
}

fn clamp(secs: f64, max: Duration) -> Duration {
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs.max(0.0))
    }
}
