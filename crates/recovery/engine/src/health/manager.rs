//! Health check manager.
//!
//! Owns one [`ServiceHealthTracker`] per registered service together with
//! its polling handle, and maintains a system-wide summary on a shared loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use recovery_types::{HealthStatus, ServiceId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::probe::{HealthCheckResult, HealthProbe};
use super::tracker::{ServiceHealth, ServiceHealthTracker};
use crate::config::HealthCheckConfig;
use crate::error::{RecoveryError, RecoveryResult};
use crate::events::EventBus;
use crate::task::MonitorHandle;

/// Registry of health trackers.
pub struct HealthCheckManager {
    /// Trackers per service.
    trackers: DashMap<ServiceId, Arc<ServiceHealthTracker>>,

    /// Polling handles per service; dropping one stops its polling.
    monitors: DashMap<ServiceId, MonitorHandle>,

    /// Configuration for services registered without one.
    default_config: HealthCheckConfig,

    /// Summary loop interval when no tracker polls faster.
    summary_interval: Duration,

    latest_summary: Mutex<Option<HealthSummary>>,

    events: EventBus,
}

impl HealthCheckManager {
    pub fn new(
        default_config: HealthCheckConfig,
        summary_interval: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            trackers: DashMap::new(),
            monitors: DashMap::new(),
            default_config,
            summary_interval,
            latest_summary: Mutex::new(None),
            events,
        }
    }

    pub fn default_config(&self) -> &HealthCheckConfig {
        &self.default_config
    }

    /// Register a service and start polling its probe.
    ///
    /// Registering an already known service returns the existing tracker
    /// unchanged, restarting its polling if it was stopped. Must be called
    /// from within a Tokio runtime.
    #[instrument(skip(self, probe, config), fields(service_id = %service_id))]
    pub fn register_service(
        &self,
        service_id: &ServiceId,
        probe: Arc<dyn HealthProbe>,
        config: Option<HealthCheckConfig>,
    ) -> Arc<ServiceHealthTracker> {
        let mut created = false;
        let tracker = self
            .trackers
            .entry(service_id.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(ServiceHealthTracker::new(
                    service_id.clone(),
                    probe,
                    config.unwrap_or_else(|| self.default_config.clone()),
                    self.events.clone(),
                ))
            })
            .clone();

        if created {
            info!(
                service_id = %service_id,
                interval_ms = tracker.config().interval.as_millis() as u64,
                "Registering service for health checks"
            );
        }
        if let Entry::Vacant(slot) = self.monitors.entry(service_id.clone()) {
            slot.insert(tracker.start_monitoring());
        }

        tracker
    }

    /// Restart polling for every tracker whose polling was stopped.
    ///
    /// Returns the number of trackers re-armed.
    pub fn resume_polling(&self) -> usize {
        let mut resumed = 0;
        for item in self.trackers.iter() {
            if let Entry::Vacant(slot) = self.monitors.entry(item.key().clone()) {
                slot.insert(item.value().start_monitoring());
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(count = resumed, "Resumed health polling");
        }
        resumed
    }

    /// Whether a service currently has a polling task.
    pub fn is_polling(&self, service_id: &ServiceId) -> bool {
        self.monitors.contains_key(service_id)
    }

    /// Smallest of the summary interval and every registered tracker interval.
    fn summary_tick(&self) -> Duration {
        self.trackers
            .iter()
            .map(|r| r.value().config().interval)
            .fold(self.summary_interval, Duration::min)
    }

    /// Stop polling a service and forget its tracker.
    #[instrument(skip(self), fields(service_id = %service_id))]
    pub fn unregister_service(&self, service_id: &ServiceId) -> bool {
        if let Some((_, handle)) = self.monitors.remove(service_id) {
            handle.stop();
        }
        let removed = self.trackers.remove(service_id).is_some();
        if removed {
            info!(service_id = %service_id, "Unregistered service from health checks");
        }
        removed
    }

    pub fn get(&self, service_id: &ServiceId) -> Option<Arc<ServiceHealthTracker>> {
        self.trackers.get(service_id).map(|t| t.clone())
    }

    pub fn contains(&self, service_id: &ServiceId) -> bool {
        self.trackers.contains_key(service_id)
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.trackers.iter().map(|r| r.key().clone()).collect()
    }

    /// Run one probe for a service immediately.
    #[instrument(skip(self), fields(service_id = %service_id))]
    pub async fn check_service(&self, service_id: &ServiceId) -> RecoveryResult<HealthCheckResult> {
        let tracker = self
            .get(service_id)
            .ok_or_else(|| RecoveryError::ServiceNotFound(service_id.clone()))?;
        Ok(tracker.check().await)
    }

    /// Probe every registered service concurrently.
    #[instrument(skip(self))]
    pub async fn check_all(&self) -> HashMap<ServiceId, HealthCheckResult> {
        let trackers: Vec<_> = self.trackers.iter().map(|r| r.value().clone()).collect();
        let checks = trackers.into_iter().map(|tracker| async move {
            let result = tracker.check().await;
            (tracker.service_id().clone(), result)
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }

    pub fn get_service_health(&self, service_id: &ServiceId) -> Option<ServiceHealth> {
        self.get(service_id).map(|t| t.health())
    }

    pub fn all_health(&self) -> HashMap<ServiceId, ServiceHealth> {
        self.trackers
            .iter()
            .map(|r| (r.key().clone(), r.value().health()))
            .collect()
    }

    /// Compute the system-wide summary from the current tracker states.
    pub fn system_summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::empty();
        let mut availability = 0.0;

        for item in self.trackers.iter() {
            let health = item.value().health();
            summary.total += 1;
            availability += health.availability;
            match health.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
        }

        if summary.total > 0 {
            summary.average_availability = availability / summary.total as f64;
        }
        summary
    }

    /// Summary computed by the last tick of the shared loop.
    pub fn latest_summary(&self) -> Option<HealthSummary> {
        self.latest_summary.lock().clone()
    }

    /// Start the shared summary loop.
    ///
    /// The interval is recomputed before every tick, so services registered
    /// after the call can make the loop faster.
    pub fn start(self: &Arc<Self>) -> MonitorHandle {
        info!(
            interval_ms = self.summary_tick().as_millis() as u64,
            "Starting health summary loop"
        );
        let manager = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            loop {
                let Some(interval) = manager.upgrade().map(|m| m.summary_tick()) else {
                    break;
                };
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let summary = manager.system_summary();
                debug!(
                    total = summary.total,
                    healthy = summary.healthy,
                    degraded = summary.degraded,
                    unhealthy = summary.unhealthy,
                    interval_ms = interval.as_millis() as u64,
                    "Health summary updated"
                );
                *manager.latest_summary.lock() = Some(summary);
            }
        });

        MonitorHandle::new("health:summary", task)
    }

    /// Stop polling every service; trackers stay registered.
    pub fn stop_all(&self) {
        info!(count = self.monitors.len(), "Stopping all health polling");
        self.monitors.clear();
    }

    /// Reset every tracker to `Unknown`.
    pub fn reset_all(&self) {
        for item in self.trackers.iter() {
            item.value().reset();
        }
    }
}

/// Aggregate health across all registered services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,

    /// Mean of the per-service availability ratios.
    pub average_availability: f64,

    pub checked_at: DateTime<Utc>,
}

impl HealthSummary {
    fn empty() -> Self {
        Self {
            total: 0,
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            unknown: 0,
            average_availability: 0.0,
            checked_at: Utc::now(),
        }
    }

    /// Worst status present, or `Unknown` when nothing has been classified.
    pub fn overall_status(&self) -> HealthStatus {
        if self.unhealthy > 0 {
            HealthStatus::Unhealthy
        } else if self.degraded > 0 {
            HealthStatus::Degraded
        } else if self.healthy > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        }
    }

    /// Share of services classified unhealthy.
    pub fn unhealthy_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.unhealthy as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::probe::StaticProbe;

    fn fast_config(unhealthy_threshold: u32) -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(20),
            unhealthy_threshold,
            healthy_threshold: 1,
            custom_probe: None,
        }
    }

    fn manager(events: EventBus) -> Arc<HealthCheckManager> {
        Arc::new(HealthCheckManager::new(
            fast_config(2),
            Duration::from_secs(60),
            events,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_probe_becomes_unhealthy_after_two_cycles() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let manager = manager(events);
        let id = ServiceId::new("db");

        manager.register_service(&id, Arc::new(StaticProbe::unhealthy()), None);
        assert_eq!(
            manager.get_service_health(&id).unwrap().status,
            HealthStatus::Unknown
        );

        tokio::time::sleep(Duration::from_millis(250)).await;

        let health = manager.get_service_health(&id).unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.consecutive_failures, 2);

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.event_type(), "health_check_failed");
        assert_eq!(envelope.service_id, id);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let manager = manager(EventBus::new());
        let id = ServiceId::new("db");

        let a = manager.register_service(&id, Arc::new(StaticProbe::healthy()), None);
        let b = manager.register_service(&id, Arc::new(StaticProbe::unhealthy()), None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_check_unknown_service_fails() {
        let manager = manager(EventBus::new());
        let result = manager.check_service(&ServiceId::new("ghost")).await;
        assert!(matches!(result, Err(RecoveryError::ServiceNotFound(_))));
    }

    #[tokio::test]
    async fn test_check_all_and_summary() {
        let manager = manager(EventBus::new());
        manager.register_service(
            &ServiceId::new("a"),
            Arc::new(StaticProbe::healthy()),
            Some(fast_config(1)),
        );
        manager.register_service(
            &ServiceId::new("b"),
            Arc::new(StaticProbe::unhealthy()),
            Some(fast_config(1)),
        );
        manager.register_service(&ServiceId::new("c"), Arc::new(StaticProbe::healthy()), None);

        let results = manager.check_all().await;
        assert_eq!(results.len(), 3);
        assert!(!results[&ServiceId::new("b")].healthy);

        let summary = manager.system_summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.healthy, 2);
        assert_eq!(summary.unhealthy, 1);
        assert_eq!(summary.overall_status(), HealthStatus::Unhealthy);
        assert!((summary.unhealthy_ratio() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_stops_polling() {
        let manager = manager(EventBus::new());
        let id = ServiceId::new("db");
        let tracker = manager.register_service(&id, Arc::new(StaticProbe::healthy()), None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(tracker.health().history.len(), 1);

        assert!(manager.unregister_service(&id));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(tracker.health().history.len(), 1);
        assert!(manager.get_service_health(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_polling_resumes() {
        let manager = manager(EventBus::new());
        let id = ServiceId::new("db");
        let tracker = manager.register_service(&id, Arc::new(StaticProbe::healthy()), None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        manager.stop_all();
        assert!(!manager.is_polling(&id));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(tracker.health().history.len(), 1);

        assert_eq!(manager.resume_polling(), 1);
        assert_eq!(manager.resume_polling(), 0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(tracker.health().history.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistering_rearms_polling() {
        let manager = manager(EventBus::new());
        let id = ServiceId::new("db");
        let tracker = manager.register_service(&id, Arc::new(StaticProbe::healthy()), None);
        manager.stop_all();

        manager.register_service(&id, Arc::new(StaticProbe::healthy()), None);
        assert!(manager.is_polling(&id));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(tracker.health().history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_loop_picks_up_later_registrations() {
        let manager = manager(EventBus::new());
        let handle = manager.start();

        // First tick waits for the 60s summary interval.
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.register_service(&ServiceId::new("a"), Arc::new(StaticProbe::healthy()), None);
        assert!(manager.latest_summary().is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(manager.latest_summary().is_some());

        // From now on the loop runs at the 100ms tracker interval.
        *manager.latest_summary.lock() = None;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.latest_summary().unwrap().total, 1);

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_loop_uses_fastest_interval() {
        let manager = manager(EventBus::new());
        manager.register_service(&ServiceId::new("a"), Arc::new(StaticProbe::healthy()), None);

        let handle = manager.start();
        assert!(manager.latest_summary().is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let summary = manager.latest_summary().unwrap();
        assert_eq!(summary.total, 1);

        handle.stop();
    }
}
