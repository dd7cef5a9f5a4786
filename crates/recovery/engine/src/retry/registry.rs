//! Per-service retry executor registry.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use recovery_types::ServiceId;
use tracing::{debug, info};

use super::executor::{RetryExecutor, RetryMetrics};
use crate::config::RetryConfig;
use crate::events::EventBus;

/// Keyed store of retry executors with get-or-create semantics.
pub struct RetryExecutorRegistry {
    executors: DashMap<ServiceId, Arc<RetryExecutor>>,
    default_config: RetryConfig,
    events: EventBus,
}

impl RetryExecutorRegistry {
    pub fn new(default_config: RetryConfig, events: EventBus) -> Self {
        Self {
            executors: DashMap::new(),
            default_config,
            events,
        }
    }

    pub fn get_or_create(&self, service_id: &ServiceId) -> Arc<RetryExecutor> {
        self.get_or_create_with(service_id, || self.default_config.clone())
    }

    /// Get or create the executor; `config` is only evaluated on creation.
    pub fn get_or_create_with(
        &self,
        service_id: &ServiceId,
        config: impl FnOnce() -> RetryConfig,
    ) -> Arc<RetryExecutor> {
        self.executors
            .entry(service_id.clone())
            .or_insert_with(|| {
                debug!(service_id = %service_id, "Creating retry executor");
                Arc::new(RetryExecutor::new(
                    service_id.clone(),
                    config(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, service_id: &ServiceId) -> Option<Arc<RetryExecutor>> {
        self.executors.get(service_id).map(|e| e.clone())
    }

    pub fn remove(&self, service_id: &ServiceId) -> Option<Arc<RetryExecutor>> {
        self.executors.remove(service_id).map(|(_, e)| e)
    }

    pub fn total_executors(&self) -> usize {
        self.executors.len()
    }

    pub fn all_metrics(&self) -> HashMap<ServiceId, RetryMetrics> {
        self.executors
            .iter()
            .map(|r| (r.key().clone(), r.value().metrics()))
            .collect()
    }

    /// Clear every executor's history.
    pub fn reset_all(&self) {
        info!(count = self.executors.len(), "Clearing all retry histories");
        for item in self.executors.iter() {
            item.value().clear_history();
        }
    }
}
