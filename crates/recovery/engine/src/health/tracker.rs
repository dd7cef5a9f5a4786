//! Per-service health tracker.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use recovery_types::{HealthEvent, HealthStatus, ServiceId};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::probe::{HealthCheckResult, HealthProbe};
use crate::config::HealthCheckConfig;
use crate::error::RecoveryError;
use crate::events::EventBus;
use crate::task::MonitorHandle;

/// Check results kept per service.
const HISTORY_LIMIT: usize = 100;

/// Polls one service's probe and classifies its health.
pub struct ServiceHealthTracker {
    service_id: ServiceId,
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    state: Mutex<TrackerState>,
    created_at: Instant,
    paused: AtomicBool,
    events: EventBus,
}

#[derive(Debug)]
struct TrackerState {
    status: HealthStatus,
    last_check: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    history: VecDeque<HealthCheckResult>,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }
}

impl ServiceHealthTracker {
    /// Create a tracker. A probe set in `config.custom_probe` takes precedence.
    pub fn new(
        service_id: ServiceId,
        probe: Arc<dyn HealthProbe>,
        config: HealthCheckConfig,
        events: EventBus,
    ) -> Self {
        let probe = config
            .custom_probe
            .as_ref()
            .map(|p| p.0.clone())
            .unwrap_or(probe);

        Self {
            service_id,
            config,
            probe,
            state: Mutex::new(TrackerState::new()),
            created_at: Instant::now(),
            paused: AtomicBool::new(false),
            events,
        }
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    pub fn status(&self) -> HealthStatus {
        self.state.lock().status
    }

    /// Run the probe once, racing it against the configured timeout.
    pub async fn check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let timeout = self.config.timeout;

        // A panicking probe is treated like one returning an error.
        let outcome = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(self.probe.check()).catch_unwind(),
        )
        .await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(Ok(true))) => HealthCheckResult::healthy(elapsed),
            Ok(Ok(Ok(false))) => HealthCheckResult::unhealthy(elapsed, None),
            Ok(Ok(Err(e))) => HealthCheckResult::unhealthy(elapsed, self.failure(e.to_string())),
            Ok(Err(_)) => HealthCheckResult::unhealthy(elapsed, self.failure("panicked")),
            Err(_) => HealthCheckResult::unhealthy(
                elapsed,
                self.failure(format!("timed out after {}ms", timeout.as_millis())),
            ),
        };

        self.apply(result.clone());
        result
    }

    fn failure(&self, reason: impl Into<String>) -> Option<String> {
        Some(
            RecoveryError::ProbeFailed {
                service_id: self.service_id.clone(),
                reason: reason.into(),
            }
            .to_string(),
        )
    }

    /// Fold one check result into the streak counters and status.
    fn apply(&self, result: HealthCheckResult) {
        let mut state = self.state.lock();
        let previous = state.status;

        state.last_check = Some(result.timestamp);
        if result.healthy {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
            if state.consecutive_successes >= self.config.healthy_threshold {
                state.status = HealthStatus::Healthy;
            }
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
            if state.consecutive_failures >= self.config.unhealthy_threshold {
                state.status = HealthStatus::Unhealthy;
            } else if state.status == HealthStatus::Healthy {
                state.status = HealthStatus::Degraded;
            }
        }

        let error = result.error.clone();
        if state.history.len() >= HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(result);

        if state.status == previous {
            debug!(
                service_id = %self.service_id,
                status = %state.status,
                failures = state.consecutive_failures,
                successes = state.consecutive_successes,
                "Health check completed"
            );
            return;
        }

        let current = state.status;
        if current == HealthStatus::Healthy {
            info!(
                service_id = %self.service_id,
                old_status = %previous,
                new_status = %current,
                "Service health recovered"
            );
            self.events.publish(
                &self.service_id,
                HealthEvent::Recovered {
                    previous,
                    current,
                    consecutive_failures: state.consecutive_failures,
                    consecutive_successes: state.consecutive_successes,
                },
            );
        } else {
            warn!(
                service_id = %self.service_id,
                old_status = %previous,
                new_status = %current,
                failures = state.consecutive_failures,
                "Service health check failed"
            );
            self.events.publish(
                &self.service_id,
                HealthEvent::CheckFailed {
                    previous,
                    current,
                    consecutive_failures: state.consecutive_failures,
                    consecutive_successes: state.consecutive_successes,
                    error,
                },
            );
        }
    }

    /// Forget all results and return to `Unknown`.
    pub fn reset(&self) {
        *self.state.lock() = TrackerState::new();
        debug!(service_id = %self.service_id, "Health tracker reset");
    }

    /// Skip scheduled checks until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Snapshot of the tracked health.
    pub fn health(&self) -> ServiceHealth {
        let state = self.state.lock();
        let total = state.history.len();
        let availability = if total == 0 {
            0.0
        } else {
            state.history.iter().filter(|r| r.healthy).count() as f64 / total as f64
        };

        ServiceHealth {
            service_id: self.service_id.clone(),
            status: state.status,
            last_check: state.last_check,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            uptime: self.created_at.elapsed(),
            availability,
            history: state.history.iter().cloned().collect(),
        }
    }

    /// Start polling the probe every `config.interval`.
    ///
    /// The first check runs one interval after the call. The loop exits
    /// when the handle is stopped or the tracker is dropped.
    pub fn start_monitoring(self: &Arc<Self>) -> MonitorHandle {
        let interval = self.config.interval;
        let tracker = Arc::downgrade(self);
        let service_id = self.service_id.clone();

        debug!(
            service_id = %service_id,
            interval_ms = interval.as_millis() as u64,
            "Starting health polling"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                if tracker.is_paused() {
                    continue;
                }
                tracker.check().await;
            }
        });

        MonitorHandle::new(format!("health:{}", service_id), task)
    }
}

/// Health snapshot of one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_id: ServiceId,
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,

    /// Time since the tracker was created.
    pub uptime: Duration,

    /// Share of healthy results in the history.
    pub availability: f64,

    /// Most recent results, oldest first.
    pub history: Vec<HealthCheckResult>,
}
