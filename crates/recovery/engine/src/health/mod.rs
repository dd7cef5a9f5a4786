//! Health tracking.
//!
//! Each registered service gets a tracker that polls its probe and derives a
//! four-state classification from consecutive-result streaks. The manager
//! owns the trackers, their polling handles and a system-wide summary loop.

mod manager;
mod probe;
mod tracker;

pub use manager::{HealthCheckManager, HealthSummary};
pub use probe::{probe_fn, FnProbe, HealthCheckResult, HealthProbe, ProbeOverride, StaticProbe};
pub use tracker::{ServiceHealth, ServiceHealthTracker};
