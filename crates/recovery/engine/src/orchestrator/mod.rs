//! Recovery orchestrator.
//!
//! Composition root owning one registry per component. Guarded calls run
//! breaker over retry; failures feed the degradation fallback and a
//! prioritized recovery plan. A monitor loop derives the global degradation
//! level from aggregate health and a reaction loop starts plans from
//! breaker and health events.

mod actions;
mod plan;
mod summary;

pub use actions::{
    default_actions, effect_fn, ActionEffect, FnEffect, RecoveryAction, RecoveryActionKind,
    RecoveryContext, RecoveryTarget,
};
pub use plan::{ActionResult, PlanStatus, RecoveryPlan, TERMINAL_PRIORITY};
pub use summary::{target_degradation_level, ServiceMetrics, SystemHealthSummary};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use recovery_types::{
    BreakerEvent, DegradationLevel, HealthEvent, HealthStatus, OrchestratorEvent, RecoveryEvent,
    RecoveryEventEnvelope, RecoveryPlanId, ServiceId,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::config::{RecoveryConfig, ServiceOverrides};
use crate::degradation::{fallback_fn, DegradationRegistry, Fallback};
use crate::error::{BoxError, RecoveryError, RecoveryResult};
use crate::events::EventBus;
use crate::health::{HealthCheckManager, HealthCheckResult, HealthProbe, StaticProbe};
use crate::retry::RetryExecutorRegistry;
use crate::task::MonitorHandle;

/// Applied action ids remembered per service.
const APPLIED_ACTIONS_LIMIT: usize = 20;

/// Registration parameters of a service.
#[derive(Clone, Default)]
pub struct ServiceRegistration {
    /// Health probe; a probe that always reports healthy is used when unset.
    pub probe: Option<Arc<dyn HealthProbe>>,

    pub overrides: ServiceOverrides,
}

impl ServiceRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_overrides(mut self, overrides: ServiceOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("probe", &self.probe.as_ref().map(|p| p.name().to_string()))
            .field("overrides", &self.overrides)
            .finish()
    }
}

/// Per-call options of [`RecoveryOrchestrator::execute_with_recovery`].
pub struct ExecuteOptions<T> {
    /// Replacement result served when the guarded call fails.
    pub fallback: Option<Fallback<T>>,
    pub skip_circuit_breaker: bool,
    pub skip_retry: bool,
}

impl<T> Default for ExecuteOptions<T> {
    fn default() -> Self {
        Self {
            fallback: None,
            skip_circuit_breaker: false,
            skip_retry: false,
        }
    }
}

impl<T: 'static> ExecuteOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback<E, F, Fut>(mut self, fallback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.fallback = Some(fallback_fn(fallback));
        self
    }

    pub fn skip_circuit_breaker(mut self) -> Self {
        self.skip_circuit_breaker = true;
        self
    }

    pub fn skip_retry(mut self) -> Self {
        self.skip_retry = true;
        self
    }
}

/// Error bookkeeping per service.
#[derive(Debug, Clone, Default)]
struct ServiceState {
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    error_count: u64,
    recovery_attempts: u64,
    applied_actions: VecDeque<String>,
}

/// Removes the active-plan marker when a plan ends or is cancelled.
struct ActivePlanGuard<'a> {
    plans: &'a DashMap<ServiceId, RecoveryPlanId>,
    service_id: ServiceId,
}

impl Drop for ActivePlanGuard<'_> {
    fn drop(&mut self) {
        self.plans.remove(&self.service_id);
    }
}

/// Coordinates breakers, health tracking, retries, degradation and recovery.
pub struct RecoveryOrchestrator {
    config: RecoveryConfig,
    events: EventBus,

    breakers: CircuitBreakerRegistry,
    health: Arc<HealthCheckManager>,
    retries: RetryExecutorRegistry,
    degradation: DegradationRegistry,

    services: DashMap<ServiceId, ServiceState>,

    /// Cache and rate-window sweeps of registered services.
    maintenance: DashMap<ServiceId, MonitorHandle>,

    /// Recovery actions by descending priority.
    actions: RwLock<Vec<RecoveryAction>>,

    /// Plan currently running per service.
    active_plans: DashMap<ServiceId, RecoveryPlanId>,

    history: Mutex<VecDeque<RecoveryPlan>>,

    /// Monitor and reaction loops while started.
    running: Mutex<Vec<MonitorHandle>>,
}

impl RecoveryOrchestrator {
    /// Create an orchestrator with validated process-wide defaults.
    pub fn new(config: RecoveryConfig) -> RecoveryResult<Self> {
        let config = config.validate()?;
        let events = EventBus::new();

        Ok(Self {
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker.clone(), events.clone()),
            health: Arc::new(HealthCheckManager::new(
                config.health.clone(),
                config.orchestrator.health_summary_interval,
                events.clone(),
            )),
            retries: RetryExecutorRegistry::new(config.retry.clone(), events.clone()),
            degradation: DegradationRegistry::new(config.degradation.clone(), events.clone()),
            services: DashMap::new(),
            maintenance: DashMap::new(),
            actions: RwLock::new(default_actions(
                config.orchestrator.degrade_after_failed_attempts,
            )),
            active_plans: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            running: Mutex::new(Vec::new()),
            config,
            events,
        })
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Subscribe to events of every component.
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEventEnvelope> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn health_manager(&self) -> &Arc<HealthCheckManager> {
        &self.health
    }

    pub fn retry_executors(&self) -> &RetryExecutorRegistry {
        &self.retries
    }

    pub fn degradation(&self) -> &DegradationRegistry {
        &self.degradation
    }

    /// Register a service with merged configuration and start its polling.
    ///
    /// Components already created for the service keep their configuration.
    /// Must be called from within a Tokio runtime.
    #[instrument(skip(self, registration), fields(service_id = %service_id))]
    pub fn register_service(
        &self,
        service_id: &ServiceId,
        registration: ServiceRegistration,
    ) -> RecoveryResult<()> {
        let merged = self.config.service_config(&registration.overrides)?;
        let already_registered = self.health.contains(service_id);

        self.breakers
            .get_or_create_with(service_id, || merged.circuit_breaker.clone());
        self.retries
            .get_or_create_with(service_id, || merged.retry.clone());
        let controller = self
            .degradation
            .get_or_create_with(service_id, || merged.degradation.clone());
        let probe = registration
            .probe
            .unwrap_or_else(|| Arc::new(StaticProbe::healthy()));
        self.health
            .register_service(service_id, probe, Some(merged.health.clone()));
        self.services.entry(service_id.clone()).or_default();

        if already_registered {
            debug!(service_id = %service_id, "Service already registered");
            self.maintenance
                .entry(service_id.clone())
                .or_insert_with(|| controller.start_maintenance());
            return Ok(());
        }

        self.maintenance
            .insert(service_id.clone(), controller.start_maintenance());
        info!(service_id = %service_id, "Service registered for recovery");
        self.events
            .publish(service_id, OrchestratorEvent::ServiceRegistered);
        Ok(())
    }

    /// Stop all background work of a service and drop its components.
    #[instrument(skip(self), fields(service_id = %service_id))]
    pub fn unregister_service(&self, service_id: &ServiceId) -> bool {
        let registered = self.health.unregister_service(service_id);
        if let Some((_, handle)) = self.maintenance.remove(service_id) {
            handle.stop();
        }
        self.breakers.remove(service_id);
        self.retries.remove(service_id);
        self.degradation.remove(service_id);
        let known = self.services.remove(service_id).is_some();

        if registered || known {
            info!(service_id = %service_id, "Service unregistered");
            self.events
                .publish(service_id, OrchestratorEvent::ServiceUnregistered);
        }
        registered || known
    }

    /// Run `operation` through breaker and retry with recovery on failure.
    ///
    /// On failure the error is recorded, the fallback (if any) is tried and a
    /// recovery plan runs before returning. A successful fallback replaces
    /// the error; otherwise the operation's error is returned.
    #[instrument(skip_all, fields(service_id = %service_id, operation = %operation_name))]
    pub async fn execute_with_recovery<T, E, F, Fut>(
        &self,
        service_id: &ServiceId,
        operation_name: &str,
        mut operation: F,
        options: ExecuteOptions<T>,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let controller = self.degradation.get_or_create(service_id);
        if let Err(rejection) = controller.admit(operation_name) {
            debug!(
                service_id = %service_id,
                reason = rejection.kind(),
                "Call rejected by degradation controller"
            );
            return match options.fallback {
                Some(fallback) => {
                    controller
                        .run_fallback(operation_name, fallback, &rejection)
                        .await
                }
                None => Err(rejection),
            };
        }

        let breaker = self.breakers.get_or_create(service_id);
        let retry = self.retries.get_or_create(service_id);

        let result = match (options.skip_circuit_breaker, options.skip_retry) {
            (false, false) => breaker.execute(|| retry.execute(&mut operation)).await,
            (false, true) => breaker.execute(|| operation()).await,
            (true, false) => retry.execute(&mut operation).await,
            (true, true) => operation().await.map_err(RecoveryError::from_operation),
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        self.record_error(service_id, &error);

        let fallback_value = match options.fallback {
            Some(fallback) => controller
                .run_fallback(operation_name, fallback, &error)
                .await
                .ok(),
            None => None,
        };

        self.trigger_recovery(service_id, error.kind(), &error.to_string())
            .await;

        match fallback_value {
            Some(value) => Ok(value),
            None => Err(error),
        }
    }

    fn record_error(&self, service_id: &ServiceId, error: &RecoveryError) {
        let mut state = self.services.entry(service_id.clone()).or_default();
        state.error_count += 1;
        state.last_error = Some(error.to_string());
        state.last_error_at = Some(Utc::now());
        debug!(
            service_id = %service_id,
            error_count = state.error_count,
            error = %error,
            "Recorded service error"
        );
    }

    /// Build and run a recovery plan for a failure of `service_id`.
    ///
    /// Returns `None` when automatic recovery is disabled or a plan for the
    /// service is already running.
    pub async fn trigger_recovery(
        &self,
        service_id: &ServiceId,
        error_type: &str,
        error: &str,
    ) -> Option<RecoveryPlan> {
        if !self.config.orchestrator.auto_recovery_enabled {
            return None;
        }

        let plan_id = RecoveryPlanId::generate();
        match self.active_plans.entry(service_id.clone()) {
            Entry::Occupied(active) => {
                debug!(
                    service_id = %service_id,
                    active_plan = %active.get(),
                    "Recovery plan already running, skipping"
                );
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(plan_id);
            }
        }
        let _guard = ActivePlanGuard {
            plans: &self.active_plans,
            service_id: service_id.clone(),
        };

        let context = self.recovery_context(service_id, error_type, error);
        let actions: Vec<RecoveryAction> = self
            .actions
            .read()
            .iter()
            .filter(|a| a.applies_to(&context))
            .cloned()
            .collect();

        let mut plan = RecoveryPlan::new(service_id.clone(), error, &actions);
        plan.id = plan_id;
        info!(
            service_id = %service_id,
            plan_id = %plan.id,
            actions = ?plan.actions,
            "Recovery plan created"
        );
        self.events.publish(
            service_id,
            OrchestratorEvent::RecoveryPlanCreated {
                plan_id: plan.id,
                actions: plan.actions.clone(),
                error: error.to_string(),
            },
        );

        let target = RecoveryTarget {
            service_id: service_id.clone(),
            breaker: self.breakers.get_or_create(service_id),
            health: self.health.get(service_id),
            degradation: self.degradation.get_or_create(service_id),
            events: self.events.clone(),
            context,
        };
        plan.run(&actions, &target, self.config.orchestrator.action_timeout)
            .await;

        if let Some(mut state) = self.services.get_mut(service_id) {
            state.recovery_attempts += 1;
            for result in plan.results.iter().filter(|r| r.success) {
                if state.applied_actions.len() >= APPLIED_ACTIONS_LIMIT {
                    state.applied_actions.pop_front();
                }
                state.applied_actions.push_back(result.action_id.clone());
            }
        }

        let mut history = self.history.lock();
        if history.len() >= self.config.orchestrator.plan_history_size.max(1) {
            history.pop_front();
        }
        history.push_back(plan.clone());
        drop(history);

        Some(plan)
    }

    fn recovery_context(
        &self,
        service_id: &ServiceId,
        error_type: &str,
        error: &str,
    ) -> RecoveryContext {
        RecoveryContext {
            service_id: service_id.clone(),
            error_type: error_type.to_string(),
            error: error.to_string(),
            circuit_breaker: self.breakers.get(service_id).map(|b| b.metrics()),
            health: self.health.get_service_health(service_id),
            retry: self.retries.get(service_id).map(|r| r.metrics()),
            timestamp: Utc::now(),
            previous_actions: self
                .services
                .get(service_id)
                .map(|s| s.applied_actions.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Probe one registered service now.
    #[instrument(skip(self), fields(service_id = %service_id))]
    pub async fn check_service(&self, service_id: &ServiceId) -> RecoveryResult<HealthCheckResult> {
        self.health.check_service(service_id).await
    }

    /// Probe every registered service now.
    #[instrument(skip(self))]
    pub async fn check_all_services(&self) -> HashMap<ServiceId, HealthCheckResult> {
        self.health.check_all().await
    }

    /// Set the global degradation level by hand.
    ///
    /// The monitor loop recomputes the level on its next tick.
    pub fn force_system_degradation(&self, level: DegradationLevel, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(level = %level, reason = %reason, "Forcing system degradation");
        self.degradation
            .global()
            .set_degradation_level(level, reason, self.health.service_ids());
    }

    /// Recompute aggregate health and move the global level accordingly.
    pub fn evaluate_system_health(&self) -> DegradationLevel {
        let health = self.health.system_summary();
        let level = target_degradation_level(&health, &self.config.orchestrator);

        let affected: Vec<ServiceId> = self
            .health
            .all_health()
            .into_iter()
            .filter(|(_, h)| {
                matches!(h.status, HealthStatus::Degraded | HealthStatus::Unhealthy)
            })
            .map(|(id, _)| id)
            .collect();
        let reason = format!(
            "{} of {} services unhealthy, {} degraded",
            health.unhealthy, health.total, health.degraded
        );
        self.degradation
            .global()
            .set_degradation_level(level, reason, affected);

        self.events.publish(
            &ServiceId::system(),
            OrchestratorEvent::SystemHealthChecked {
                total_services: health.total,
                healthy: health.healthy,
                degraded: health.degraded,
                unhealthy: health.unhealthy,
                degradation_level: level,
            },
        );
        level
    }

    /// Clear breakers, retry histories, the global level and error counters.
    pub fn reset_all(&self) {
        info!("Resetting all recovery state");
        self.breakers.reset_all();
        self.retries.reset_all();
        self.degradation.global().reset();
        for mut state in self.services.iter_mut() {
            *state.value_mut() = ServiceState::default();
        }
    }

    /// Aggregate snapshot of every known service.
    pub fn get_system_health_summary(&self) -> SystemHealthSummary {
        let health = self.health.system_summary();
        let breaker_metrics = self.breakers.all_metrics();
        let retry_metrics = self.retries.all_metrics();

        let services = self
            .services
            .iter()
            .map(|entry| {
                let id = entry.key();
                let state = entry.value();
                let metrics = ServiceMetrics {
                    circuit_breaker: breaker_metrics.get(id).cloned(),
                    health: self.health.get_service_health(id),
                    retry: retry_metrics.get(id).cloned(),
                    degradation: self.degradation.get(id).map(|c| c.state()),
                    error_count: state.error_count,
                    recovery_attempts: state.recovery_attempts,
                    last_error: state.last_error.clone(),
                    last_error_at: state.last_error_at,
                };
                (id.clone(), metrics)
            })
            .collect();

        SystemHealthSummary {
            overall_status: health.overall_status(),
            degradation_level: self.degradation.global().level(),
            active_recovery_plans: self.active_plans.len(),
            total_services: health.total,
            healthy_services: health.healthy,
            degraded_services: health.degraded,
            unhealthy_services: health.unhealthy,
            open_circuit_breakers: self.breakers.open_breakers().len(),
            active_retry_executors: self.retries.total_executors(),
            services,
            checked_at: Utc::now(),
        }
    }

    /// Add an action, replacing one with the same id.
    pub fn add_recovery_action(&self, action: RecoveryAction) {
        let mut actions = self.actions.write();
        actions.retain(|a| a.id != action.id);
        debug!(action_id = %action.id, priority = action.priority, "Adding recovery action");
        actions.push(action);
        actions.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn remove_recovery_action(&self, action_id: &str) -> bool {
        let mut actions = self.actions.write();
        let before = actions.len();
        actions.retain(|a| a.id != action_id);
        actions.len() != before
    }

    /// Ids of the configured actions in execution order.
    pub fn recovery_actions(&self) -> Vec<String> {
        self.actions.read().iter().map(|a| a.id.clone()).collect()
    }

    /// Finished plans, oldest first.
    pub fn recovery_history(&self) -> Vec<RecoveryPlan> {
        self.history.lock().iter().cloned().collect()
    }

    /// Start the monitor loop, the event reaction loop, the health summary
    /// loop and the global cache sweeps. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if !running.is_empty() {
            return;
        }

        info!(
            monitor_interval_ms = self.config.orchestrator.monitor_interval.as_millis() as u64,
            "Starting recovery orchestrator"
        );
        running.push(self.spawn_monitor_loop());
        running.push(self.spawn_reaction_loop());
        running.push(self.health.start());
        running.push(self.degradation.global().start_maintenance());
        drop(running);

        // Background work of services registered before a previous stop.
        self.health.resume_polling();
        for service_id in self.health.service_ids() {
            if let Some(controller) = self.degradation.get(&service_id) {
                self.maintenance
                    .entry(service_id)
                    .or_insert_with(|| controller.start_maintenance());
            }
        }
    }

    /// Stop every background task, including per-service polling.
    pub fn stop(&self) {
        let handles: Vec<MonitorHandle> = self.running.lock().drain(..).collect();
        for handle in handles {
            handle.stop();
        }
        self.health.stop_all();
        self.maintenance.clear();
        info!("Recovery orchestrator stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.running.lock().is_empty()
    }

    fn spawn_monitor_loop(self: &Arc<Self>) -> MonitorHandle {
        let interval = self.config.orchestrator.monitor_interval;
        let orchestrator = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                let level = orchestrator.evaluate_system_health();
                debug!(level = %level, "System health evaluated");
            }
        });

        MonitorHandle::new("orchestrator:monitor", task)
    }

    fn spawn_reaction_loop(self: &Arc<Self>) -> MonitorHandle {
        let mut rx = self.events.subscribe();
        let orchestrator = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            loop {
                let envelope = match rx.recv().await {
                    Ok(envelope) => envelope,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Recovery reaction loop lagged behind events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                if let Some((error_type, error)) = recovery_trigger(&envelope) {
                    orchestrator
                        .trigger_recovery(&envelope.service_id, error_type, &error)
                        .await;
                }
            }
        });

        MonitorHandle::new("orchestrator:reactions", task)
    }
}

/// Events that start a recovery plan on their own.
fn recovery_trigger(envelope: &RecoveryEventEnvelope) -> Option<(&'static str, String)> {
    match &envelope.event {
        RecoveryEvent::Breaker(BreakerEvent::Opened { snapshot, .. }) => Some((
            "circuit_open",
            format!(
                "circuit breaker opened after {} consecutive failures (error rate {:.2})",
                snapshot.failure_count, snapshot.error_rate
            ),
        )),
        RecoveryEvent::Health(HealthEvent::CheckFailed {
            current: HealthStatus::Unhealthy,
            consecutive_failures,
            error,
            ..
        }) => Some((
            "health_check_failed",
            match error {
                Some(error) => format!(
                    "service unhealthy after {} failed checks: {}",
                    consecutive_failures, error
                ),
                None => format!("service unhealthy after {} failed checks", consecutive_failures),
            },
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, HealthCheckConfig, RetryConfig};
    use crate::health::probe_fn;
    use crate::retry::BackoffStrategy;
    use recovery_types::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn test_config() -> RecoveryConfig {
        RecoveryConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(30),
                ..CircuitBreakerConfig::default()
            },
            health: HealthCheckConfig {
                interval: Duration::from_millis(100),
                timeout: Duration::from_millis(50),
                unhealthy_threshold: 1,
                healthy_threshold: 1,
                custom_probe: None,
            },
            retry: RetryConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                strategy: BackoffStrategy::Fixed,
                ..RetryConfig::default()
            },
            ..RecoveryConfig::default()
        }
    }

    fn orchestrator() -> Arc<RecoveryOrchestrator> {
        Arc::new(RecoveryOrchestrator::new(test_config()).unwrap())
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let orch = orchestrator();
        let id = ServiceId::new("db");

        let value = orch
            .execute_with_recovery(
                &id,
                "query",
                || async { Ok::<_, BoxError>(42) },
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(orch.recovery_history().is_empty());
        assert_eq!(orch.retry_executors().total_executors(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_invoked_once_and_triggers_plan() {
        let orch = orchestrator();
        let id = ServiceId::new("db");
        let calls = AtomicU32::new(0);

        let err = orch
            .execute_with_recovery(
                &id,
                "query",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("constraint violation") }
                },
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "constraint violation");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let history = orch.recovery_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].actions, vec!["alert"]);
        assert_eq!(history[0].status, PlanStatus::Completed);

        let summary = orch.get_system_health_summary();
        let metrics = &summary.services[&id];
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.recovery_attempts, 1);
        assert_eq!(metrics.last_error.as_deref(), Some("constraint violation"));
    }

    #[tokio::test]
    async fn test_fallback_suppresses_error_but_plan_still_runs() {
        let orch = orchestrator();
        let id = ServiceId::new("db");

        let value = orch
            .execute_with_recovery(
                &id,
                "query",
                || async { Err::<u32, _>("bad request") },
                ExecuteOptions::new().with_fallback(|| async { Ok::<_, BoxError>(0) }),
            )
            .await
            .unwrap();

        assert_eq!(value, 0);
        assert_eq!(orch.recovery_history().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_fallback_returns_operation_error() {
        let orch = orchestrator();
        let err = orch
            .execute_with_recovery(
                &ServiceId::new("db"),
                "query",
                || async { Err::<u32, _>("bad request") },
                ExecuteOptions::new()
                    .with_fallback(|| async { Err::<u32, _>("fallback down") }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "bad request");
    }

    #[tokio::test]
    async fn test_open_breaker_plan_restarts_service() {
        let orch = orchestrator();
        let id = ServiceId::new("db");
        orch.circuit_breakers().get_or_create(&id).force_open();

        let err = orch
            .execute_with_recovery(
                &id,
                "query",
                || async { Ok::<_, BoxError>(()) },
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::CircuitOpen { .. }));

        let plan = orch.recovery_history().pop().unwrap();
        assert_eq!(plan.actions, vec!["restart", "alert"]);
        assert_eq!(
            orch.circuit_breakers().get(&id).unwrap().state(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_skip_flags_bypass_components() {
        let orch = orchestrator();
        let id = ServiceId::new("db");
        orch.circuit_breakers().get_or_create(&id).force_open();
        let calls = AtomicU32::new(0);

        let err = orch
            .execute_with_recovery(
                &id,
                "query",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("503 service unavailable") }
                },
                ExecuteOptions::new().skip_circuit_breaker().skip_retry(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "503 service unavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_plan_is_suppressed() {
        let orch = orchestrator();
        let id = ServiceId::new("db");
        orch.active_plans.insert(id.clone(), RecoveryPlanId::generate());

        assert!(orch.trigger_recovery(&id, "operation", "boom").await.is_none());
        orch.active_plans.clear();
        assert!(orch.trigger_recovery(&id, "operation", "boom").await.is_some());
        assert!(orch.active_plans.is_empty());
    }

    #[tokio::test]
    async fn test_custom_actions_replace_and_order() {
        let orch = orchestrator();
        orch.add_recovery_action(RecoveryAction::new(
            "failover",
            RecoveryActionKind::Custom,
            9,
            effect_fn(|_| async { Ok(()) }),
        ));
        assert_eq!(
            orch.recovery_actions(),
            vec!["failover", "restart", "reconnect", "degrade", "alert"]
        );

        let plan = orch
            .trigger_recovery(&ServiceId::new("db"), "operation", "boom")
            .await
            .unwrap();
        assert_eq!(plan.results.len(), 1);

        assert!(orch.remove_recovery_action("failover"));
        assert!(!orch.remove_recovery_action("failover"));
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let orch = orchestrator();
        let mut rx = orch.subscribe();
        let id = ServiceId::new("cache");
        let probe = probe_fn("ping", || async { Ok(true) });

        orch.register_service(&id, ServiceRegistration::new().with_probe(probe))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().event_type(), "service_registered");

        let result = orch.check_service(&id).await.unwrap();
        assert!(result.healthy);

        assert!(orch.unregister_service(&id));
        assert!(orch.check_service(&id).await.is_err());
        assert!(orch.circuit_breakers().get(&id).is_none());
    }

    #[tokio::test]
    async fn test_invalid_overrides_are_rejected() {
        let orch = orchestrator();
        let overrides = ServiceOverrides {
            retry: Some(RetryConfig {
                max_attempts: 0,
                ..RetryConfig::default()
            }),
            ..ServiceOverrides::default()
        };
        let result = orch.register_service(
            &ServiceId::new("db"),
            ServiceRegistration::new().with_overrides(overrides),
        );
        assert!(matches!(result, Err(RecoveryError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_force_degradation_and_reset_all() {
        let orch = orchestrator();
        let id = ServiceId::new("db");
        orch.register_service(&id, ServiceRegistration::new()).unwrap();

        let _ = orch
            .execute_with_recovery(
                &id,
                "query",
                || async { Err::<(), _>("constraint violation") },
                ExecuteOptions::default(),
            )
            .await;
        orch.circuit_breakers().get(&id).unwrap().force_open();
        orch.force_system_degradation(DegradationLevel::Minimal, "maintenance window");

        let summary = orch.get_system_health_summary();
        assert_eq!(summary.degradation_level, DegradationLevel::Minimal);
        assert_eq!(summary.open_circuit_breakers, 1);
        assert_eq!(summary.services[&id].error_count, 1);

        orch.reset_all();

        let summary = orch.get_system_health_summary();
        assert_eq!(summary.degradation_level, DegradationLevel::None);
        assert_eq!(summary.open_circuit_breakers, 0);
        assert_eq!(
            orch.circuit_breakers().get(&id).unwrap().state(),
            CircuitState::Closed
        );
        assert_eq!(
            orch.retry_executors().get(&id).unwrap().metrics().total_attempts,
            0
        );
        let metrics = &summary.services[&id];
        assert_eq!(metrics.error_count, 0);
        assert_eq!(metrics.recovery_attempts, 0);
        assert!(metrics.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_transient_failures_degrade_service() {
        let orch = orchestrator();
        let id = ServiceId::new("db");
        orch.register_service(&id, ServiceRegistration::new()).unwrap();

        // Two failed attempts per call; the third call crosses five.
        for _ in 0..3 {
            let _ = orch
                .execute_with_recovery(
                    &id,
                    "query",
                    || async { Err::<(), _>("503 service unavailable") },
                    ExecuteOptions::default(),
                )
                .await;
        }

        let history = orch.recovery_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].actions, vec!["alert"]);
        assert_eq!(history[2].actions, vec!["degrade", "alert"]);
        assert_eq!(
            orch.degradation().get(&id).unwrap().level(),
            DegradationLevel::Partial
        );
        assert_eq!(
            orch.circuit_breakers().get(&id).unwrap().state(),
            CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_polling_and_maintenance() {
        let orch = orchestrator();
        orch.start();
        let id = ServiceId::new("db");
        orch.register_service(&id, ServiceRegistration::new()).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        orch.stop();
        let before = orch.health_manager().get_service_health(&id).unwrap().history.len();
        assert_eq!(before, 1);
        assert!(!orch.health_manager().is_polling(&id));
        assert!(orch.maintenance.is_empty());

        orch.start();
        orch.register_service(&id, ServiceRegistration::new()).unwrap();
        assert!(orch.health_manager().is_polling(&id));
        assert!(orch.maintenance.contains_key(&id));

        tokio::time::sleep(Duration::from_millis(500)).await;
        let after = orch.health_manager().get_service_health(&id).unwrap().history.len();
        assert!(after >= before + 4);

        orch.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration_rearms_stopped_service() {
        let orch = orchestrator();
        let id = ServiceId::new("db");
        orch.register_service(&id, ServiceRegistration::new()).unwrap();
        orch.stop();
        assert!(orch.maintenance.is_empty());

        orch.register_service(&id, ServiceRegistration::new()).unwrap();
        assert!(orch.health_manager().is_polling(&id));
        assert!(orch.maintenance.contains_key(&id));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            orch.health_manager().get_service_health(&id).unwrap().history.len(),
            2
        );
    }
}
