//! Health probes.
//!
//! A probe is a zero-argument async check answering "is this service
//! healthy?". Errors and timeouts count as unhealthy results.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BoxError;

/// Trait for health probes.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Run the check. `Ok(false)` and `Err(_)` are both unhealthy.
    async fn check(&self) -> Result<bool, BoxError>;

    /// Probe name for logging.
    fn name(&self) -> &str {
        "probe"
    }
}

/// Probe that always reports the same answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe {
    healthy: bool,
}

impl StaticProbe {
    pub fn healthy() -> Self {
        Self { healthy: true }
    }

    pub fn unhealthy() -> Self {
        Self { healthy: false }
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn check(&self) -> Result<bool, BoxError> {
        Ok(self.healthy)
    }

    fn name(&self) -> &str {
        if self.healthy {
            "static-healthy"
        } else {
            "static-unhealthy"
        }
    }
}

/// Probe backed by a closure.
pub struct FnProbe<F> {
    name: String,
    check_fn: F,
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, BoxError>> + Send,
{
    async fn check(&self) -> Result<bool, BoxError> {
        (self.check_fn)().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Create a shared probe from a closure.
pub fn probe_fn<F, Fut>(name: impl Into<String>, check_fn: F) -> Arc<dyn HealthProbe>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, BoxError>> + Send + 'static,
{
    Arc::new(FnProbe {
        name: name.into(),
        check_fn,
    })
}

/// Probe supplied through configuration, replacing the registered one.
#[derive(Clone)]
pub struct ProbeOverride(pub Arc<dyn HealthProbe>);

impl fmt::Debug for ProbeOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProbeOverride").field(&self.0.name()).finish()
    }
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub response_time: Duration,
    pub timestamp: DateTime<Utc>,

    /// Probe error or timeout message.
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(response_time: Duration) -> Self {
        Self {
            healthy: true,
            response_time,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn unhealthy(response_time: Duration, error: Option<String>) -> Self {
        Self {
            healthy: false,
            response_time,
            timestamp: Utc::now(),
            error,
        }
    }
}
