//! Degradation controller.
//!
//! Holds a discrete degradation level, gates operations on it, rate limits
//! per operation name and serves cached results when the primary path is
//! unavailable.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use recovery_types::{DegradationEvent, DegradationLevel, ServiceId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::cache::{CacheStats, ResponseCache};
use super::rate_limit::{RateLimitStatus, RateLimiter};
use crate::config::DegradationConfig;
use crate::error::{BoxError, RecoveryError, RecoveryResult};
use crate::events::EventBus;
use crate::task::MonitorHandle;

/// Deferred fallback producing a replacement result.
pub type Fallback<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, BoxError>> + Send>;

/// Box an async closure as a [`Fallback`].
pub fn fallback_fn<T, E, F, Fut>(f: F) -> Fallback<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError>,
    T: 'static,
{
    Box::new(move || -> BoxFuture<'static, Result<T, BoxError>> {
        Box::pin(async move { f().await.map_err(Into::into) })
    })
}

/// Cumulative counters; carried across level changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationMetrics {
    pub requests_served: u64,
    pub fallbacks_used: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Current degradation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationState {
    pub level: DegradationLevel,
    pub active_since: DateTime<Utc>,
    pub reason: String,
    pub affected_services: Vec<ServiceId>,

    /// Fallback names exposed at this level.
    pub active_fallbacks: Vec<String>,

    pub metrics: DegradationMetrics,
}

/// Cache and rate settings in force for the current level.
#[derive(Debug, Clone, Copy)]
struct Effective {
    cache_enabled: bool,
    rate_limiting_enabled: bool,
    requests_per_minute: u32,
}

struct ControllerInner {
    state: DegradationState,
    effective: Effective,
    cache: ResponseCache,
    limiter: RateLimiter,
}

/// Degradation controller for one service, or for the whole system.
pub struct DegradationController {
    service_id: ServiceId,
    config: DegradationConfig,
    inner: Mutex<ControllerInner>,
    events: EventBus,
}

impl DegradationController {
    pub fn new(service_id: ServiceId, config: DegradationConfig, events: EventBus) -> Self {
        let inner = ControllerInner {
            state: DegradationState {
                level: DegradationLevel::None,
                active_since: Utc::now(),
                reason: "initial".to_string(),
                affected_services: Vec::new(),
                active_fallbacks: Vec::new(),
                metrics: DegradationMetrics::default(),
            },
            effective: Self::effective_for(&config, DegradationLevel::None),
            cache: ResponseCache::new(config.max_cache_size),
            limiter: RateLimiter::default(),
        };

        Self {
            service_id,
            config,
            inner: Mutex::new(inner),
            events,
        }
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn config(&self) -> &DegradationConfig {
        &self.config
    }

    pub fn level(&self) -> DegradationLevel {
        self.inner.lock().state.level
    }

    pub fn is_degraded(&self) -> bool {
        self.level().is_degraded()
    }

    pub fn state(&self) -> DegradationState {
        self.inner.lock().state.clone()
    }

    /// Whether `operation` is allowed at the current level.
    pub fn is_feature_enabled(&self, operation: &str) -> bool {
        let level = self.level();
        !self.is_disabled_at(operation, level)
    }

    fn is_disabled_at(&self, operation: &str, level: DegradationLevel) -> bool {
        level.is_degraded()
            && self
                .config
                .disabled_features
                .range(DegradationLevel::Partial..=level)
                .any(|(_, ops)| ops.iter().any(|op| op == operation))
    }

    fn effective_for(config: &DegradationConfig, level: DegradationLevel) -> Effective {
        if !level.is_degraded() {
            return Effective {
                cache_enabled: config.cache_enabled,
                rate_limiting_enabled: config.rate_limiting_enabled,
                requests_per_minute: config.requests_per_minute,
            };
        }
        let scaled = (f64::from(config.requests_per_minute) * level.rate_factor()).floor();
        Effective {
            cache_enabled: true,
            rate_limiting_enabled: true,
            requests_per_minute: (scaled as u32).max(1),
        }
    }

    fn fallbacks_for(&self, level: DegradationLevel) -> Vec<String> {
        let count = match level {
            DegradationLevel::None => 0,
            DegradationLevel::Partial => 2,
            DegradationLevel::Minimal => 4,
            DegradationLevel::Emergency => self.config.fallbacks.len(),
        };
        self.config.fallbacks.iter().take(count).cloned().collect()
    }

    /// Move to `level`, returning whether anything changed.
    ///
    /// Setting the current level again is a no-op. Otherwise the state is
    /// replaced and cache and rate settings are retuned for the new level.
    pub fn set_degradation_level(
        &self,
        level: DegradationLevel,
        reason: impl Into<String>,
        affected_services: Vec<ServiceId>,
    ) -> bool {
        let reason = reason.into();
        let mut inner = self.inner.lock();
        let previous = inner.state.level;
        if previous == level {
            return false;
        }

        let metrics = inner.state.metrics;
        inner.state = DegradationState {
            level,
            active_since: Utc::now(),
            reason: reason.clone(),
            affected_services: affected_services.clone(),
            active_fallbacks: self.fallbacks_for(level),
            metrics,
        };
        inner.effective = Self::effective_for(&self.config, level);
        let rpm = inner.effective.requests_per_minute;
        drop(inner);

        if level.is_degraded() {
            warn!(
                service_id = %self.service_id,
                previous = %previous,
                level = %level,
                requests_per_minute = rpm,
                reason = %reason,
                "Degradation activated"
            );
            self.events.publish(
                &self.service_id,
                DegradationEvent::Activated {
                    previous,
                    level,
                    reason,
                    affected_services,
                },
            );
        } else {
            info!(
                service_id = %self.service_id,
                previous = %previous,
                reason = %reason,
                "Degradation deactivated"
            );
            self.events
                .publish(&self.service_id, DegradationEvent::Deactivated { previous, reason });
        }
        true
    }

    /// Return to `None`, dropping rate windows.
    pub fn reset(&self) {
        self.set_degradation_level(DegradationLevel::None, "reset", Vec::new());
        self.inner.lock().limiter.clear();
    }

    /// Feature gate and rate limit, checked and counted atomically.
    ///
    /// An admitted call consumes one slot of the operation's rate window.
    pub fn admit(&self, operation: &str) -> RecoveryResult<()> {
        let mut inner = self.inner.lock();
        let level = inner.state.level;
        if self.is_disabled_at(operation, level) {
            return Err(RecoveryError::FeatureDisabled {
                operation: operation.to_string(),
                level,
            });
        }

        let effective = inner.effective;
        if effective.rate_limiting_enabled
            && !inner
                .limiter
                .try_acquire(operation, effective.requests_per_minute, Instant::now())
        {
            return Err(RecoveryError::RateLimited {
                operation: operation.to_string(),
                limit: effective.requests_per_minute,
            });
        }
        Ok(())
    }

    /// Run `primary` unless the operation is disabled or rate limited.
    ///
    /// Rejections and primary failures are routed to `fallback` when one is
    /// given; otherwise the error is returned.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: &str,
        primary: F,
        fallback: Option<Fallback<T>>,
    ) -> RecoveryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if let Err(rejection) = self.admit(operation) {
            debug!(
                service_id = %self.service_id,
                operation,
                reason = rejection.kind(),
                "Operation rejected by degradation controller"
            );
            return match fallback {
                Some(fallback) => self.run_fallback(operation, fallback, &rejection).await,
                None => Err(rejection),
            };
        }

        match primary().await {
            Ok(value) => {
                self.inner.lock().state.metrics.requests_served += 1;
                Ok(value)
            }
            Err(e) => {
                let error = RecoveryError::from_operation(e);
                match fallback {
                    Some(fallback) => self.run_fallback(operation, fallback, &error).await,
                    None => Err(error),
                }
            }
        }
    }

    /// Run a fallback in place of a failed or rejected operation.
    ///
    /// A failing fallback yields its own error; `cause` is only reported.
    pub async fn run_fallback<T>(
        &self,
        operation: &str,
        fallback: Fallback<T>,
        cause: &RecoveryError,
    ) -> RecoveryResult<T> {
        match fallback().await {
            Ok(value) => {
                self.inner.lock().state.metrics.fallbacks_used += 1;
                info!(
                    service_id = %self.service_id,
                    operation,
                    cause = %cause,
                    "Fallback served"
                );
                self.events.publish(
                    &self.service_id,
                    DegradationEvent::FallbackUsed {
                        operation: operation.to_string(),
                        reason: cause.to_string(),
                    },
                );
                Ok(value)
            }
            Err(e) => {
                let error = RecoveryError::from_operation(e);
                warn!(
                    service_id = %self.service_id,
                    operation,
                    error = %error,
                    "Fallback failed"
                );
                self.events.publish(
                    &self.service_id,
                    DegradationEvent::FallbackFailed {
                        operation: operation.to_string(),
                        error: error.to_string(),
                    },
                );
                Err(error)
            }
        }
    }

    /// Run `primary` with write-through caching under `cache_key`.
    ///
    /// While degraded a live cache entry answers without calling `primary`.
    /// When `primary` fails, any live entry is served regardless of level.
    pub async fn execute_with_cache<T, E, F, Fut>(
        &self,
        operation: &str,
        cache_key: &str,
        ttl: Option<Duration>,
        primary: F,
    ) -> RecoveryResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if self.is_degraded() {
            if let Some(value) = self.cached::<T>(operation, cache_key) {
                return Ok(value);
            }
        }

        match primary().await {
            Ok(value) => {
                let mut inner = self.inner.lock();
                inner.state.metrics.requests_served += 1;
                if inner.effective.cache_enabled {
                    match serde_json::to_value(&value) {
                        Ok(json) => inner.cache.insert(
                            cache_key.to_string(),
                            json,
                            ttl.unwrap_or(self.config.cache_ttl),
                            Instant::now(),
                        ),
                        Err(e) => debug!(
                            service_id = %self.service_id,
                            cache_key,
                            error = %e,
                            "Result not cacheable"
                        ),
                    }
                }
                Ok(value)
            }
            Err(e) => {
                let error = RecoveryError::from_operation(e);
                match self.cached::<T>(operation, cache_key) {
                    Some(value) => {
                        self.inner.lock().state.metrics.fallbacks_used += 1;
                        self.events.publish(
                            &self.service_id,
                            DegradationEvent::FallbackUsed {
                                operation: operation.to_string(),
                                reason: error.to_string(),
                            },
                        );
                        Ok(value)
                    }
                    None => Err(error),
                }
            }
        }
    }

    /// Look up and decode a cache entry, counting the hit or miss.
    fn cached<T: DeserializeOwned>(&self, operation: &str, cache_key: &str) -> Option<T> {
        let value = {
            let mut inner = self.inner.lock();
            let value = inner
                .cache
                .get(cache_key, Instant::now())
                .and_then(|json| serde_json::from_value::<T>(json).ok());
            if value.is_some() {
                inner.state.metrics.cache_hits += 1;
            } else {
                inner.state.metrics.cache_misses += 1;
            }
            value
        };

        let event = if value.is_some() {
            debug!(service_id = %self.service_id, cache_key, "Cache hit");
            DegradationEvent::CacheHit {
                operation: operation.to_string(),
                cache_key: cache_key.to_string(),
            }
        } else {
            DegradationEvent::CacheMiss {
                operation: operation.to_string(),
                cache_key: cache_key.to_string(),
            }
        };
        self.events.publish(&self.service_id, event);
        value
    }

    pub fn cache_stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let metrics = inner.state.metrics;
        let lookups = metrics.cache_hits + metrics.cache_misses;
        CacheStats {
            entries: inner.cache.len(),
            max_entries: inner.cache.max_size(),
            hits: metrics.cache_hits,
            misses: metrics.cache_misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                metrics.cache_hits as f64 / lookups as f64
            },
        }
    }

    pub fn clear_cache(&self) {
        self.inner.lock().cache.clear();
        debug!(service_id = %self.service_id, "Cache cleared");
    }

    /// Remove one cache entry.
    pub fn invalidate(&self, cache_key: &str) -> bool {
        self.inner.lock().cache.remove(cache_key)
    }

    /// Usage of the current rate window of `operation`.
    pub fn rate_limit_status(&self, operation: &str) -> RateLimitStatus {
        let inner = self.inner.lock();
        inner
            .limiter
            .status(operation, inner.effective.requests_per_minute, Instant::now())
    }

    /// Start the cache and rate-window sweeps.
    pub fn start_maintenance(self: &Arc<Self>) -> MonitorHandle {
        let cache_task = Self::spawn_sweep(
            Arc::downgrade(self),
            self.config.cache_cleanup_interval,
            |inner, now| inner.cache.sweep(now),
            "Expired cache entries removed",
        );
        let rate_task = Self::spawn_sweep(
            Arc::downgrade(self),
            self.config.rate_limit_cleanup_interval,
            |inner, now| inner.limiter.sweep(now),
            "Ended rate windows removed",
        );

        MonitorHandle::from_tasks(
            format!("degradation:{}", self.service_id),
            vec![cache_task, rate_task],
        )
    }

    fn spawn_sweep(
        controller: std::sync::Weak<Self>,
        interval: Duration,
        sweep: fn(&mut ControllerInner, Instant) -> usize,
        message: &'static str,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                let removed = sweep(&mut controller.inner.lock(), Instant::now());
                if removed > 0 {
                    debug!(service_id = %controller.service_id, removed, "{}", message);
                }
            }
        })
    }
}
