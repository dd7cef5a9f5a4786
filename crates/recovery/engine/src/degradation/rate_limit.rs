//! Fixed-window per-operation rate limiting.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Length of one rate window.
pub(crate) const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Request counters per operation name; callers provide synchronization.
#[derive(Debug, Default)]
pub(crate) struct RateLimiter {
    windows: HashMap<String, Window>,
}

impl RateLimiter {
    /// Count one request against `operation` unless `limit` is reached.
    pub(crate) fn try_acquire(&mut self, operation: &str, limit: u32, now: Instant) -> bool {
        let window = self
            .windows
            .entry(operation.to_string())
            .or_insert(Window {
                started: now,
                count: 0,
            });

        if now.saturating_duration_since(window.started) >= RATE_WINDOW {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= limit {
            return false;
        }
        window.count += 1;
        true
    }

    pub(crate) fn status(&self, operation: &str, limit: u32, now: Instant) -> RateLimitStatus {
        let (used, resets_in) = match self.windows.get(operation) {
            Some(w) if now.saturating_duration_since(w.started) < RATE_WINDOW => {
                (w.count, RATE_WINDOW - now.saturating_duration_since(w.started))
            }
            _ => (0, Duration::ZERO),
        };

        RateLimitStatus {
            operation: operation.to_string(),
            limit,
            used,
            remaining: limit.saturating_sub(used),
            resets_in,
        }
    }

    /// Drop windows that have ended.
    pub(crate) fn sweep(&mut self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < RATE_WINDOW);
        before - self.windows.len()
    }

    pub(crate) fn clear(&mut self) {
        self.windows.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.windows.len()
    }
}

/// Rate window usage of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub operation: String,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,

    /// Time until the current window ends; zero when no window is open.
    pub resets_in: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_within_window() {
        let mut limiter = RateLimiter::default();
        let now = Instant::now();

        assert!(limiter.try_acquire("search", 2, now));
        assert!(limiter.try_acquire("search", 2, now));
        assert!(!limiter.try_acquire("search", 2, now));
        assert!(limiter.try_acquire("other", 2, now));

        let status = limiter.status("search", 2, now + Duration::from_secs(10));
        assert_eq!(status.used, 2);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.resets_in, Duration::from_secs(50));
    }

    #[test]
    fn test_new_window_resets_count() {
        let mut limiter = RateLimiter::default();
        let now = Instant::now();
        assert!(limiter.try_acquire("search", 1, now));
        assert!(!limiter.try_acquire("search", 1, now + Duration::from_secs(59)));
        assert!(limiter.try_acquire("search", 1, now + RATE_WINDOW));
    }

    #[test]
    fn test_sweep_drops_ended_windows() {
        let mut limiter = RateLimiter::default();
        let now = Instant::now();
        limiter.try_acquire("a", 10, now);
        limiter.try_acquire("b", 10, now + Duration::from_secs(30));

        assert_eq!(limiter.sweep(now + Duration::from_secs(61)), 1);
        assert_eq!(limiter.len(), 1);
    }
}
