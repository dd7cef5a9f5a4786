//! Recovery Types - shared vocabulary for the error-recovery engine
//!
//! These types are consumed by the engine crate and by event sinks that
//! subscribe to it (logging, metrics, alerting).
//!
//! ## Key Concepts
//!
//! - **ServiceId**: the guarded dependency every component is keyed by
//! - **CircuitState / HealthStatus / DegradationLevel**: per-service state machines
//! - **Events**: one envelope, typed payload per component

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod events;
pub mod ids;
pub mod status;

// Re-export main types
pub use events::{
    BreakerEvent, BreakerSnapshot, DegradationEvent, EventSeverity, HealthEvent,
    OrchestratorEvent, RecoveryEvent, RecoveryEventEnvelope, RetryEvent,
};
pub use ids::{EventId, RecoveryPlanId, ServiceId};
pub use status::{CircuitState, DegradationLevel, HealthStatus};
