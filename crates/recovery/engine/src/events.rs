//! In-process event bus.
//!
//! Components publish typed events; sinks (logging, metrics, alerting and
//! the orchestrator itself) subscribe to a broadcast receiver.

use recovery_types::{EventSeverity, RecoveryEvent, RecoveryEventEnvelope, ServiceId};
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

/// Cloneable publish/subscribe handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RecoveryEventEnvelope>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEventEnvelope> {
        self.tx.subscribe()
    }

    /// Publish an event with the severity derived from its payload.
    pub fn publish(&self, service_id: &ServiceId, event: impl Into<RecoveryEvent>) {
        self.send(RecoveryEventEnvelope::new(service_id.clone(), event.into()));
    }

    /// Publish an event with an explicit severity.
    pub fn publish_with_severity(
        &self,
        service_id: &ServiceId,
        severity: EventSeverity,
        event: impl Into<RecoveryEvent>,
    ) {
        self.send(RecoveryEventEnvelope::with_severity(
            service_id.clone(),
            severity,
            event.into(),
        ));
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn send(&self, envelope: RecoveryEventEnvelope) {
        trace!(
            service_id = %envelope.service_id,
            event_type = envelope.event_type(),
            severity = %envelope.severity,
            "Publishing event"
        );
        // No receivers is not an error: events are fire-and-forget.
        let _ = self.tx.send(envelope);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
