//! Graceful degradation.
//!
//! A controller per service plus one global controller. Each holds a
//! degradation level that disables operations, scales the per-operation
//! rate limit and switches on the response cache.

mod cache;
mod controller;
mod rate_limit;
mod registry;

pub use cache::CacheStats;
pub use controller::{
    fallback_fn, DegradationController, DegradationMetrics, DegradationState, Fallback,
};
pub use rate_limit::RateLimitStatus;
pub use registry::DegradationRegistry;
