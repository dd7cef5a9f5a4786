//! Handles for background loops.

use tokio::task::JoinHandle;
use tracing::debug;

/// Owns one or more background tasks; dropping or stopping it aborts them.
///
/// Returned by every "start" call (health polling, cache maintenance,
/// orchestrator monitor) so that callers decide how long the work lives.
#[derive(Debug)]
pub struct MonitorHandle {
    name: String,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    pub(crate) fn new(name: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self::from_tasks(name, vec![task])
    }

    pub(crate) fn from_tasks(name: impl Into<String>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether every task has finished (or was aborted).
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }

    /// Stop the background work.
    pub fn stop(self) {
        debug!(monitor = %self.name, "Stopping background monitor");
        drop(self);
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_aborts_task() {
        let task = tokio::spawn(async {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let handle = MonitorHandle::new("looping", task);
        assert!(!handle.is_finished());
        assert_eq!(handle.name(), "looping");
        handle.stop();
    }
}
