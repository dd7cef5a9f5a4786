//! Per-service circuit breaker registry.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use recovery_types::{CircuitState, ServiceId};
use tracing::{debug, info};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics};
use crate::config::CircuitBreakerConfig;
use crate::events::EventBus;

/// Keyed store of circuit breakers with get-or-create semantics.
pub struct CircuitBreakerRegistry {
    /// Circuit breakers per service.
    breakers: DashMap<ServiceId, Arc<CircuitBreaker>>,

    /// Configuration for breakers created without an explicit one.
    default_config: CircuitBreakerConfig,

    events: EventBus,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            events,
        }
    }

    /// Get or create the breaker for a service using the default configuration.
    pub fn get_or_create(&self, service_id: &ServiceId) -> Arc<CircuitBreaker> {
        self.get_or_create_with(service_id, || self.default_config.clone())
    }

    /// Get or create the breaker; `config` is only evaluated on creation.
    pub fn get_or_create_with(
        &self,
        service_id: &ServiceId,
        config: impl FnOnce() -> CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service_id.clone())
            .or_insert_with(|| {
                debug!(service_id = %service_id, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(
                    service_id.clone(),
                    config(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, service_id: &ServiceId) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service_id).map(|b| b.clone())
    }

    pub fn remove(&self, service_id: &ServiceId) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(service_id).map(|(_, b)| b)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Metrics of every breaker, keyed by service.
    pub fn all_metrics(&self) -> HashMap<ServiceId, CircuitBreakerMetrics> {
        self.breakers
            .iter()
            .map(|r| (r.key().clone(), r.value().metrics()))
            .collect()
    }

    /// Services whose breaker is currently open.
    pub fn open_breakers(&self) -> Vec<ServiceId> {
        self.breakers
            .iter()
            .filter(|r| r.value().state() == CircuitState::Open)
            .map(|r| r.key().clone())
            .collect()
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        info!(count = self.breakers.len(), "Resetting all circuit breakers");
        for item in self.breakers.iter() {
            item.value().reset();
        }
    }
}
