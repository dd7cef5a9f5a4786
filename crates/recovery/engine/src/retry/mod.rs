//! Retry with backoff.
//!
//! Bounded attempts, per-attempt timeouts, pluggable backoff strategies and
//! pattern-based retryability classification.

mod backoff;
mod classify;
mod executor;
mod registry;

pub use backoff::{backoff_delay, BackoffStrategy, DelayFn};
pub use classify::{is_transient, RetryPredicate};
pub use executor::{AttemptRecord, RetryExecutor, RetryMetrics};
pub use registry::RetryExecutorRegistry;
