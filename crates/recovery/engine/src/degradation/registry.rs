//! Per-service degradation controller registry.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use recovery_types::ServiceId;
use tracing::debug;

use super::controller::{DegradationController, DegradationState};
use crate::config::DegradationConfig;
use crate::events::EventBus;

/// Keyed store of degradation controllers plus the global controller.
pub struct DegradationRegistry {
    controllers: DashMap<ServiceId, Arc<DegradationController>>,

    /// System-wide controller, keyed by [`ServiceId::system`].
    global: Arc<DegradationController>,

    default_config: DegradationConfig,
    events: EventBus,
}

impl DegradationRegistry {
    pub fn new(default_config: DegradationConfig, events: EventBus) -> Self {
        let global = Arc::new(DegradationController::new(
            ServiceId::system(),
            default_config.clone(),
            events.clone(),
        ));
        Self {
            controllers: DashMap::new(),
            global,
            default_config,
            events,
        }
    }

    pub fn global(&self) -> Arc<DegradationController> {
        self.global.clone()
    }

    pub fn get_or_create(&self, service_id: &ServiceId) -> Arc<DegradationController> {
        self.get_or_create_with(service_id, || self.default_config.clone())
    }

    /// Get or create the controller; `config` is only evaluated on creation.
    pub fn get_or_create_with(
        &self,
        service_id: &ServiceId,
        config: impl FnOnce() -> DegradationConfig,
    ) -> Arc<DegradationController> {
        self.controllers
            .entry(service_id.clone())
            .or_insert_with(|| {
                debug!(service_id = %service_id, "Creating degradation controller");
                Arc::new(DegradationController::new(
                    service_id.clone(),
                    config(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, service_id: &ServiceId) -> Option<Arc<DegradationController>> {
        self.controllers.get(service_id).map(|c| c.clone())
    }

    pub fn remove(&self, service_id: &ServiceId) -> Option<Arc<DegradationController>> {
        self.controllers.remove(service_id).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Services whose own controller is above `None`.
    pub fn degraded_services(&self) -> Vec<ServiceId> {
        self.controllers
            .iter()
            .filter(|r| r.value().is_degraded())
            .map(|r| r.key().clone())
            .collect()
    }

    pub fn all_states(&self) -> HashMap<ServiceId, DegradationState> {
        self.controllers
            .iter()
            .map(|r| (r.key().clone(), r.value().state()))
            .collect()
    }

    /// Reset every per-service controller and the global one.
    pub fn reset_all(&self) {
        for item in self.controllers.iter() {
            item.value().reset();
        }
        self.global.reset();
    }
}
