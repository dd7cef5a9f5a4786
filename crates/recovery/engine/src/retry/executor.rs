//! Retry executor.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use recovery_types::{RetryEvent, ServiceId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backoff::backoff_delay;
use super::classify::is_transient;
use crate::config::RetryConfig;
use crate::error::{BoxError, RecoveryError, RecoveryResult};
use crate::events::EventBus;

/// Attempt records kept per executor.
const HISTORY_LIMIT: usize = 1000;

/// Records used for the rolling averages.
const AVERAGE_WINDOW: usize = 100;

/// One finished attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number within its call.
    pub attempt: u32,
    pub success: bool,

    /// Backoff scheduled after this attempt (zero when none followed).
    pub delay: Duration,

    pub duration: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Retry metrics for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryMetrics {
    pub service_id: ServiceId,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,

    /// Mean attempt number over the most recent records.
    pub average_attempts: f64,

    /// Mean scheduled delay over the most recent records.
    pub average_delay: Duration,

    pub history_len: usize,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct RetryState {
    history: VecDeque<AttemptRecord>,
    total_attempts: u64,
    successful_attempts: u64,
    failed_attempts: u64,
}

/// Runs operations with bounded attempts and backoff.
pub struct RetryExecutor {
    service_id: ServiceId,
    config: RetryConfig,
    state: Mutex<RetryState>,
    events: EventBus,
}

impl RetryExecutor {
    pub fn new(service_id: ServiceId, config: RetryConfig, events: EventBus) -> Self {
        Self {
            service_id,
            config,
            state: Mutex::new(RetryState::default()),
            events,
        }
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` with this executor's configuration.
    ///
    /// Non-retryable failures are returned after the first attempt; when
    /// every attempt fails the last error is returned as is.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.execute_with(&self.config, operation).await
    }

    /// Run `operation` with a per-call configuration; history is shared.
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        config: &RetryConfig,
        mut operation: F,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(config.attempt_timeout, operation()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(RecoveryError::from_operation(e)),
                Err(_) => Err(RecoveryError::Timeout {
                    timeout_ms: config.attempt_timeout.as_millis() as u64,
                }),
            };
            let elapsed = started.elapsed();

            let error = match outcome {
                Ok(value) => {
                    self.record(attempt, true, Duration::ZERO, elapsed, None);
                    if attempt > 1 {
                        debug!(
                            service_id = %self.service_id,
                            attempts = attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    self.events
                        .publish(&self.service_id, RetryEvent::Succeeded { attempts: attempt });
                    return Ok(value);
                }
                Err(error) => error,
            };

            let retryable = match &config.retry_predicate {
                Some(predicate) => predicate.is_retryable(&error),
                None => is_transient(&error),
            };

            if !retryable {
                self.record(attempt, false, Duration::ZERO, elapsed, Some(error.to_string()));
                debug!(
                    service_id = %self.service_id,
                    attempt,
                    error = %error,
                    "Non-retryable error"
                );
                self.events.publish(
                    &self.service_id,
                    RetryEvent::NonRetryable {
                        attempt,
                        error: error.to_string(),
                    },
                );
                return Err(error);
            }

            if attempt >= max_attempts {
                self.record(attempt, false, Duration::ZERO, elapsed, Some(error.to_string()));
                warn!(
                    service_id = %self.service_id,
                    attempts = attempt,
                    error = %error,
                    "Retry attempts exhausted"
                );
                self.events.publish(
                    &self.service_id,
                    RetryEvent::Exhausted {
                        attempts: attempt,
                        error: error.to_string(),
                    },
                );
                return Err(error);
            }

            let delay = backoff_delay(config, attempt);
            self.record(attempt, false, delay, elapsed, Some(error.to_string()));
            debug!(
                service_id = %self.service_id,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );
            self.events.publish(
                &self.service_id,
                RetryEvent::AttemptFailed {
                    attempt,
                    max_attempts,
                    delay_ms: delay.as_millis() as u64,
                    error: error.to_string(),
                },
            );

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn record(
        &self,
        attempt: u32,
        success: bool,
        delay: Duration,
        duration: Duration,
        error: Option<String>,
    ) {
        let mut state = self.state.lock();
        state.total_attempts += 1;
        if success {
            state.successful_attempts += 1;
        } else {
            state.failed_attempts += 1;
        }

        if state.history.len() >= HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(AttemptRecord {
            attempt,
            success,
            delay,
            duration,
            error,
            timestamp: Utc::now(),
        });
    }

    pub fn metrics(&self) -> RetryMetrics {
        let state = self.state.lock();
        let recent: Vec<&AttemptRecord> = state.history.iter().rev().take(AVERAGE_WINDOW).collect();

        let (average_attempts, average_delay) = if recent.is_empty() {
            (0.0, Duration::ZERO)
        } else {
            let n = recent.len();
            let attempts: u64 = recent.iter().map(|r| u64::from(r.attempt)).sum();
            let delay: Duration = recent.iter().map(|r| r.delay).sum();
            (attempts as f64 / n as f64, delay / n as u32)
        };

        RetryMetrics {
            service_id: self.service_id.clone(),
            total_attempts: state.total_attempts,
            successful_attempts: state.successful_attempts,
            failed_attempts: state.failed_attempts,
            average_attempts,
            average_delay,
            history_len: state.history.len(),
            last_attempt_at: state.history.back().map(|r| r.timestamp),
        }
    }

    /// Most recent attempt records, oldest first.
    pub fn history(&self) -> Vec<AttemptRecord> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Drop history and counters.
    pub fn clear_history(&self) {
        *self.state.lock() = RetryState::default();
        debug!(service_id = %self.service_id, "Retry history cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{BackoffStrategy, RetryPredicate};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fixed(max_attempts: u32, base_ms: u64) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(5),
            strategy: BackoffStrategy::Fixed,
            attempt_timeout: Duration::from_secs(1),
            ..RetryConfig::default()
        }
    }

    fn executor(config: RetryConfig) -> RetryExecutor {
        RetryExecutor::new(ServiceId::new("api"), config, EventBus::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_after_backoff() {
        let executor = executor(fixed(3, 100));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = executor
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err("503 service unavailable")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert!(started.elapsed() >= Duration::from_millis(200));

        let metrics = executor.metrics();
        assert_eq!(metrics.total_attempts, 3);
        assert_eq!(metrics.successful_attempts, 1);
        assert_eq!(metrics.failed_attempts, 2);
    }

    #[tokio::test]
    async fn test_non_retryable_invoked_once_and_propagated_unchanged() {
        let executor = executor(fixed(5, 1));
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("invalid credentials") }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RecoveryError::Operation(_)));
        assert_eq!(err.to_string(), "invalid credentials");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let executor = RetryExecutor::new(ServiceId::new("api"), fixed(3, 10), events);
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err::<(), _>(format!("network error #{n}")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "network error #3");
        let tags: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.event_type())
            .collect();
        assert_eq!(tags, vec!["retry_attempt", "retry_attempt", "retry_exhausted"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        let config = RetryConfig {
            attempt_timeout: Duration::from_millis(50),
            ..fixed(2, 10)
        };
        let executor = executor(config);
        let calls = Arc::new(AtomicU32::new(0));

        let result = executor
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok::<_, BoxError>("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.history()[0].error.as_deref(), Some("operation timed out after 50ms"));
    }

    #[tokio::test]
    async fn test_custom_predicate_overrides_patterns() {
        let config = RetryConfig {
            retry_predicate: Some(RetryPredicate::new(|_| false)),
            ..fixed(3, 1)
        };
        let executor = executor(config);
        let calls = AtomicU32::new(0);

        let _ = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("timeout") }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_history() {
        let executor = executor(fixed(1, 1));
        let _ = executor.execute(|| async { Ok::<_, BoxError>(()) }).await;
        assert_eq!(executor.metrics().total_attempts, 1);

        executor.clear_history();
        let metrics = executor.metrics();
        assert_eq!(metrics.total_attempts, 0);
        assert_eq!(metrics.history_len, 0);
    }
}
