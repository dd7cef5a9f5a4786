//! Circuit breaking.
//!
//! One breaker per service guards whether an operation may be attempted at
//! all, moving between closed, open and half-open states.

mod circuit_breaker;
mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics};
pub use registry::CircuitBreakerRegistry;
