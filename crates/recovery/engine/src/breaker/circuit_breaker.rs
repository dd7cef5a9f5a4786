//! Circuit breaker pattern for resilience.
//!
//! Prevents cascading failures by tracking consecutive failures and the
//! rolling error rate, and temporarily rejecting calls to a failing service.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use recovery_types::{BreakerEvent, BreakerSnapshot, CircuitState, ServiceId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{BoxError, RecoveryError, RecoveryResult};
use crate::events::EventBus;

/// Response-time samples kept for the rolling average.
const RESPONSE_TIME_SAMPLES: usize = 100;

/// Circuit breaker for a single service.
///
/// Tracks failures and successes, transitioning between states:
/// - Closed: Normal operation, requests allowed
/// - Open: Too many failures, requests rejected until the reset timeout
/// - Half-Open: Testing if the service recovered, limited trial calls allowed
pub struct CircuitBreaker {
    /// Service this breaker guards.
    service_id: ServiceId,

    /// All mutable state; admission check-and-increment happens under this lock.
    inner: Mutex<BreakerInner>,

    /// Event sink.
    events: EventBus,
}

struct BreakerInner {
    config: CircuitBreakerConfig,
    state: CircuitState,

    /// Consecutive failures, reset by any success.
    failure_count: u32,
    success_count: u32,
    total_failures: u64,
    total_requests: u64,

    /// Trial calls admitted since entering half-open.
    half_open_calls: u32,
    half_open_successes: u32,

    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_transition: DateTime<Utc>,

    /// Earliest half-open attempt; only set while open.
    next_attempt: Option<(Instant, DateTime<Utc>)>,

    /// Outcomes inside the monitoring window (`true` = failure).
    window: VecDeque<(Instant, bool)>,
    response_times: VecDeque<Duration>,
    concurrent_requests: u32,
}

impl BreakerInner {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_failures: 0,
            total_requests: 0,
            half_open_calls: 0,
            half_open_successes: 0,
            last_failure_at: None,
            last_success_at: None,
            last_transition: Utc::now(),
            next_attempt: None,
            window: VecDeque::new(),
            response_times: VecDeque::with_capacity(RESPONSE_TIME_SAMPLES),
            concurrent_requests: 0,
        }
    }

    fn prune_window(&mut self, now: Instant) {
        let window = self.config.monitoring_window;
        while let Some((at, _)) = self.window.front() {
            if now.saturating_duration_since(*at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|(_, failed)| *failed).count();
        failures as f64 / self.window.len() as f64
    }

    fn record_outcome(&mut self, now: Instant, failed: bool, elapsed: Duration) {
        self.total_requests += 1;
        self.window.push_back((now, failed));
        self.prune_window(now);

        if self.response_times.len() >= RESPONSE_TIME_SAMPLES {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
    }

    fn should_open(&mut self, now: Instant) -> bool {
        self.prune_window(now);
        if (self.window.len() as u64) < u64::from(self.config.minimum_throughput) {
            return false;
        }
        self.failure_count >= self.config.failure_threshold
            || self.error_rate() >= self.config.error_rate_threshold
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            failure_count: self.failure_count,
            success_count: self.success_count,
            total_requests: self.total_requests,
            error_rate: self.error_rate(),
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker for a service.
    pub fn new(service_id: ServiceId, config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            service_id,
            inner: Mutex::new(BreakerInner::new(config)),
            events,
        }
    }

    /// Get the service ID.
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Current state, without applying the reset-timeout transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.inner.lock().config.clone()
    }

    /// Replace the configuration wholesale; counters are kept.
    pub fn update_config(&self, config: CircuitBreakerConfig) {
        self.inner.lock().config = config;
    }

    /// Run an operation through the breaker.
    ///
    /// Rejects immediately with [`RecoveryError::CircuitOpen`] while open, or
    /// [`RecoveryError::HalfOpenExhausted`] once every half-open trial call
    /// has been issued.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> RecoveryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.admit()?;
        let _in_flight = InFlight { breaker: self };

        let started = Instant::now();
        let result = operation().await;
        let elapsed = started.elapsed();

        match result {
            Ok(value) => {
                self.on_success(elapsed);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(elapsed);
                Err(RecoveryError::from_operation(e))
            }
        }
    }

    /// Non-mutating mirror of the admission logic in [`execute`](Self::execute).
    pub fn can_execute(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .next_attempt
                .map(|(at, _)| Instant::now() >= at)
                .unwrap_or(true),
            CircuitState::HalfOpen => inner.half_open_calls < inner.config.half_open_max_calls,
        }
    }

    /// Record a success observed outside of [`execute`](Self::execute).
    pub fn record_success(&self, elapsed: Duration) {
        self.on_success(elapsed);
    }

    /// Record a failure observed outside of [`execute`](Self::execute).
    pub fn record_failure(&self, elapsed: Duration) {
        self.on_failure(elapsed);
    }

    /// Reset to closed, clearing every counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        let config = inner.config.clone();
        *inner = BreakerInner::new(config);

        info!(
            service_id = %self.service_id,
            previous_state = %previous,
            "Circuit breaker reset"
        );
        self.emit_forced(&inner, previous);
    }

    /// Force the circuit open for one reset timeout.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        self.enter_open(&mut inner);

        warn!(
            service_id = %self.service_id,
            previous_state = %previous,
            "Circuit breaker forced open"
        );
        self.emit_forced(&inner, previous);
    }

    /// Force the circuit closed, keeping totals.
    pub fn force_closed(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        Self::enter_closed(&mut inner);

        info!(
            service_id = %self.service_id,
            previous_state = %previous,
            "Circuit breaker forced closed"
        );
        self.emit_forced(&inner, previous);
    }

    /// Read-only metrics snapshot.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock();
        inner.prune_window(Instant::now());

        let average_response_time = if inner.response_times.is_empty() {
            Duration::ZERO
        } else {
            inner.response_times.iter().sum::<Duration>() / inner.response_times.len() as u32
        };

        CircuitBreakerMetrics {
            service_id: self.service_id.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_failures: inner.total_failures,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            next_attempt_at: inner.next_attempt.map(|(_, at)| at),
            total_requests: inner.total_requests,
            error_rate: inner.error_rate(),
            average_response_time,
            concurrent_requests: inner.concurrent_requests,
            last_transition: inner.last_transition,
        }
    }

    fn admit(&self) -> RecoveryResult<()> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.state == CircuitState::Open {
            match inner.next_attempt {
                Some((at, at_utc)) if now < at => {
                    debug!(service_id = %self.service_id, "Circuit open, rejecting call");
                    return Err(RecoveryError::CircuitOpen {
                        service_id: self.service_id.clone(),
                        next_attempt_at: at_utc,
                    });
                }
                _ => self.enter_half_open(&mut inner),
            }
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_calls >= inner.config.half_open_max_calls {
                return Err(RecoveryError::HalfOpenExhausted {
                    service_id: self.service_id.clone(),
                    max_calls: inner.config.half_open_max_calls,
                });
            }
            inner.half_open_calls += 1;
        }

        inner.concurrent_requests += 1;
        Ok(())
    }

    fn on_success(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.record_outcome(now, false, elapsed);
        inner.success_count += 1;
        inner.failure_count = 0;
        inner.last_success_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= inner.config.half_open_max_calls {
                    info!(
                        service_id = %self.service_id,
                        successes = inner.half_open_successes,
                        "Circuit breaker closing after successful trial calls"
                    );
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                // Only reachable when forced open while a call was in flight.
                warn!(
                    service_id = %self.service_id,
                    "Success recorded while circuit open, closing"
                );
                self.transition(&mut inner, CircuitState::Closed);
            }
        }
    }

    fn on_failure(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.record_outcome(now, true, elapsed);
        inner.failure_count += 1;
        inner.total_failures += 1;
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.should_open(now) {
                    warn!(
                        service_id = %self.service_id,
                        failures = inner.failure_count,
                        error_rate = inner.error_rate(),
                        "Circuit breaker opening"
                    );
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    service_id = %self.service_id,
                    "Circuit breaker re-opening after half-open failure"
                );
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Natural transition: updates state and emits the matching event.
    fn transition(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        let previous = inner.state;
        match new_state {
            CircuitState::Closed => {
                let snapshot = inner.snapshot();
                Self::enter_closed(inner);
                self.events
                    .publish(&self.service_id, BreakerEvent::Closed { previous, snapshot });
            }
            CircuitState::Open => self.enter_open(inner),
            CircuitState::HalfOpen => self.enter_half_open(inner),
        }
    }

    fn enter_open(&self, inner: &mut BreakerInner) {
        let previous = inner.state;
        let reset_timeout = inner.config.reset_timeout;
        let next_attempt_utc = Utc::now()
            + chrono::Duration::from_std(reset_timeout).unwrap_or_else(|_| chrono::Duration::zero());

        inner.state = CircuitState::Open;
        inner.last_transition = Utc::now();
        inner.half_open_calls = 0;
        inner.half_open_successes = 0;
        inner.next_attempt = Some((Instant::now() + reset_timeout, next_attempt_utc));

        if previous != CircuitState::Open {
            self.events.publish(
                &self.service_id,
                BreakerEvent::Opened {
                    previous,
                    snapshot: inner.snapshot(),
                    next_attempt_at: next_attempt_utc,
                },
            );
        }
    }

    fn enter_half_open(&self, inner: &mut BreakerInner) {
        let previous = inner.state;
        info!(
            service_id = %self.service_id,
            "Circuit breaker transitioning to half-open after reset timeout"
        );

        inner.state = CircuitState::HalfOpen;
        inner.last_transition = Utc::now();
        inner.half_open_calls = 0;
        inner.half_open_successes = 0;
        inner.next_attempt = None;

        self.events.publish(
            &self.service_id,
            BreakerEvent::HalfOpened {
                previous,
                snapshot: inner.snapshot(),
            },
        );
    }

    fn enter_closed(inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.last_transition = Utc::now();
        inner.failure_count = 0;
        inner.half_open_calls = 0;
        inner.half_open_successes = 0;
        inner.next_attempt = None;
        inner.window.clear();
    }

    fn emit_forced(&self, inner: &BreakerInner, previous: CircuitState) {
        self.events.publish(
            &self.service_id,
            BreakerEvent::Forced {
                previous,
                current: inner.state,
                snapshot: inner.snapshot(),
            },
        );
    }
}

/// Decrements the in-flight gauge even if the caller drops the future.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut inner = self.breaker.inner.lock();
        inner.concurrent_requests = inner.concurrent_requests.saturating_sub(1);
    }
}

/// Metrics snapshot for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub service_id: ServiceId,
    pub state: CircuitState,

    /// Consecutive failures.
    pub failure_count: u32,
    pub success_count: u32,
    pub total_failures: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,

    /// Set only while open.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub total_requests: u64,

    /// Failure share inside the monitoring window.
    pub error_rate: f64,

    /// Rolling average over the last 100 calls.
    pub average_response_time: Duration,
    pub concurrent_requests: u32,
    pub last_transition: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(100),
            monitoring_window: Duration::from_secs(60),
            minimum_throughput: 1,
            error_rate_threshold: 1.0,
            half_open_max_calls: 2,
        }
    }

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new(ServiceId::new("test"), config, EventBus::new())
    }

    async fn fail(breaker: &CircuitBreaker) -> RecoveryResult<()> {
        breaker
            .execute(|| async { Err::<(), _>("boom") })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> RecoveryResult<u32> {
        breaker.execute(|| async { Ok::<_, BoxError>(7) }).await
    }

    #[tokio::test]
    async fn test_update_config_keeps_counters() {
        let breaker = breaker(CircuitBreakerConfig {
            minimum_throughput: 10,
            ..test_config()
        });
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.update_config(CircuitBreakerConfig {
            failure_threshold: 3,
            minimum_throughput: 3,
            reset_timeout: Duration::from_secs(5),
            ..test_config()
        });
        let config = breaker.config();
        assert_eq!(config.minimum_throughput, 3);
        assert_eq!(config.reset_timeout, Duration::from_secs(5));
        assert_eq!(breaker.metrics().failure_count, 2);
        assert_eq!(breaker.metrics().total_requests, 2);

        // Third failure meets the new throughput with the carried-over streak.
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_consecutive_failures_open_the_circuit() {
        let breaker = breaker(CircuitBreakerConfig {
            error_rate_threshold: 0.9,
            ..test_config()
        });

        for _ in 0..7 {
            succeed(&breaker).await.unwrap();
        }
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let breaker = breaker(CircuitBreakerConfig {
            error_rate_threshold: 0.9,
            ..test_config()
        });

        for _ in 0..5 {
            succeed(&breaker).await.unwrap();
        }
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().failure_count, 2);
    }

    #[tokio::test]
    async fn test_minimum_throughput_prevents_opening() {
        let breaker = breaker(CircuitBreakerConfig {
            minimum_throughput: 10,
            ..test_config()
        });

        for _ in 0..5 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_error_rate_opens_the_circuit() {
        let breaker = breaker(CircuitBreakerConfig {
            failure_threshold: 100,
            minimum_throughput: 4,
            error_rate_threshold: 0.5,
            ..test_config()
        });

        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking_operation() {
        let breaker = breaker(test_config());
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            })
            .await;

        assert!(matches!(result, Err(RecoveryError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(breaker.metrics().next_attempt_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_trial_quota() {
        let breaker = breaker(test_config());
        fail(&breaker).await.unwrap_err();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(breaker.can_execute());

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.metrics().next_attempt_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(test_config());
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(150)).await;

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            succeed(&breaker).await,
            Err(RecoveryError::CircuitOpen { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_at_most_max_calls() {
        let breaker = std::sync::Arc::new(breaker(test_config()));
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(150)).await;

        // Two slow trial calls occupy the whole quota.
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let mut trials = Vec::new();
        for _ in 0..2 {
            let breaker = breaker.clone();
            let mut release = release_rx.clone();
            trials.push(tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = release.wait_for(|go| *go).await;
                        Ok::<_, BoxError>(())
                    })
                    .await
            }));
        }
        tokio::task::yield_now().await;

        assert!(!breaker.can_execute());
        assert!(matches!(
            succeed(&breaker).await,
            Err(RecoveryError::HalfOpenExhausted { max_calls: 2, .. })
        ));
        assert_eq!(breaker.metrics().concurrent_requests, 2);

        release_tx.send(true).unwrap();
        for trial in trials {
            trial.await.unwrap().unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().concurrent_requests, 0);
    }

    #[tokio::test]
    async fn test_administrative_overrides_emit_events() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let breaker = CircuitBreaker::new(ServiceId::new("svc"), test_config(), events);

        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.force_closed();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.reset();

        let mut forced = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if let recovery_types::RecoveryEvent::Breaker(BreakerEvent::Forced {
                previous,
                current,
                ..
            }) = envelope.event
            {
                forced.push((previous, current));
            }
        }
        assert_eq!(
            forced,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed),
                (CircuitState::Closed, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_success_while_forced_open_closes() {
        let breaker = breaker(test_config());
        breaker.force_open();
        breaker.record_success(Duration::from_millis(1));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_metrics_track_requests() {
        let breaker = breaker(CircuitBreakerConfig {
            minimum_throughput: 100,
            ..test_config()
        });
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.total_failures, 1);
        assert!((metrics.error_rate - 0.5).abs() < f64::EPSILON);
        assert!(metrics.last_failure_at.is_some());
        assert_eq!(metrics.concurrent_requests, 0);
    }
}
