//! Recovery plans.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use recovery_types::{OrchestratorEvent, RecoveryPlanId, ServiceId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::actions::{RecoveryAction, RecoveryTarget};
use crate::error::RecoveryError;

/// A successful action at or above this priority ends the plan.
pub const TERMINAL_PRIORITY: u8 = 9;

/// Plan lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Executing,
    Completed,
    /// At least one action failed.
    Failed,
}

/// Outcome of one action in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: String,
    pub success: bool,
    pub attempts: u32,
    pub duration: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Ordered corrective actions for one failure of one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: RecoveryPlanId,
    pub service_id: ServiceId,

    /// Error that triggered the plan.
    pub trigger: String,

    /// Action ids by descending priority.
    pub actions: Vec<String>,

    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results: Vec<ActionResult>,
}

impl RecoveryPlan {
    pub fn new(service_id: ServiceId, trigger: impl Into<String>, actions: &[RecoveryAction]) -> Self {
        Self {
            id: RecoveryPlanId::generate(),
            service_id,
            trigger: trigger.into(),
            actions: actions.iter().map(|a| a.id.clone()).collect(),
            status: PlanStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            results: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    /// Run `actions` in order against `target`.
    ///
    /// A failing action is recorded and the plan moves on. Retryable actions
    /// get one more attempt.
    pub(crate) async fn run(
        &mut self,
        actions: &[RecoveryAction],
        target: &RecoveryTarget,
        default_timeout: Duration,
    ) {
        self.status = PlanStatus::Executing;
        target.events.publish(
            &self.service_id,
            OrchestratorEvent::RecoveryPlanStarted { plan_id: self.id },
        );
        info!(
            service_id = %self.service_id,
            plan_id = %self.id,
            actions = ?self.actions,
            "Executing recovery plan"
        );

        for action in actions {
            let result = run_action(action, target, default_timeout).await;
            let success = result.success;

            if success {
                debug!(
                    service_id = %self.service_id,
                    action_id = %action.id,
                    attempts = result.attempts,
                    "Recovery action succeeded"
                );
                target.events.publish(
                    &self.service_id,
                    OrchestratorEvent::RecoveryActionSucceeded {
                        plan_id: self.id,
                        action_id: action.id.clone(),
                        duration_ms: result.duration.as_millis() as u64,
                    },
                );
            } else {
                let error = result.error.clone().unwrap_or_default();
                warn!(
                    service_id = %self.service_id,
                    action_id = %action.id,
                    error = %error,
                    "Recovery action failed"
                );
                target.events.publish(
                    &self.service_id,
                    OrchestratorEvent::RecoveryActionFailed {
                        plan_id: self.id,
                        action_id: action.id.clone(),
                        error,
                    },
                );
            }
            self.results.push(result);

            if success && action.priority >= TERMINAL_PRIORITY {
                info!(
                    service_id = %self.service_id,
                    action_id = %action.id,
                    "Terminal recovery action succeeded, skipping remaining actions"
                );
                break;
            }
        }

        self.status = if self.failed() > 0 {
            PlanStatus::Failed
        } else {
            PlanStatus::Completed
        };
        self.completed_at = Some(Utc::now());

        target.events.publish(
            &self.service_id,
            OrchestratorEvent::RecoveryPlanCompleted {
                plan_id: self.id,
                succeeded: self.succeeded(),
                failed: self.failed(),
            },
        );
    }
}

async fn run_action(
    action: &RecoveryAction,
    target: &RecoveryTarget,
    default_timeout: Duration,
) -> ActionResult {
    let timeout = action.timeout.unwrap_or(default_timeout);
    let max_attempts = if action.retryable { 2 } else { 1 };
    let started = Instant::now();
    let mut attempts = 0;
    let mut last_error = None;

    while attempts < max_attempts {
        attempts += 1;
        // Panics and timeouts are failures like any other.
        let outcome =
            tokio::time::timeout(timeout, AssertUnwindSafe(action.apply(target)).catch_unwind())
                .await;
        match outcome {
            Ok(Ok(Ok(()))) => {
                last_error = None;
                break;
            }
            Ok(Ok(Err(e))) => last_error = Some(e.to_string()),
            Ok(Err(_)) => last_error = Some("panicked".to_string()),
            Err(_) => last_error = Some(format!("timed out after {}ms", timeout.as_millis())),
        }
    }

    let error = last_error.map(|reason| {
        RecoveryError::RecoveryActionFailed {
            service_id: target.service_id.clone(),
            action_id: action.id.clone(),
            reason,
        }
        .to_string()
    });

    ActionResult {
        action_id: action.id.clone(),
        success: error.is_none(),
        attempts,
        duration: started.elapsed(),
        error,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::config::{CircuitBreakerConfig, DegradationConfig};
    use crate::degradation::DegradationController;
    use crate::error::BoxError;
    use crate::events::EventBus;
    use crate::orchestrator::actions::{effect_fn, RecoveryActionKind, RecoveryContext};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn target() -> RecoveryTarget {
        let events = EventBus::new();
        let id = ServiceId::new("db");
        RecoveryTarget {
            service_id: id.clone(),
            breaker: Arc::new(CircuitBreaker::new(
                id.clone(),
                CircuitBreakerConfig::default(),
                events.clone(),
            )),
            health: None,
            degradation: Arc::new(DegradationController::new(
                id.clone(),
                DegradationConfig::default(),
                events.clone(),
            )),
            events,
            context: RecoveryContext {
                service_id: id,
                error_type: "operation".to_string(),
                error: "boom".to_string(),
                circuit_breaker: None,
                health: None,
                retry: None,
                timestamp: Utc::now(),
                previous_actions: Vec::new(),
            },
        }
    }

    fn counting(id: &str, priority: u8, calls: Arc<AtomicU32>, fail: bool) -> RecoveryAction {
        RecoveryAction::new(
            id,
            RecoveryActionKind::Custom,
            priority,
            effect_fn(move |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        Err::<(), BoxError>("effect failed".into())
                    } else {
                        Ok(())
                    }
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_failed_action_does_not_abort_plan() {
        let calls = Arc::new(AtomicU32::new(0));
        let actions = vec![
            counting("first", 7, calls.clone(), true),
            counting("second", 6, calls.clone(), false),
        ];
        let target = target();
        let mut plan = RecoveryPlan::new(target.service_id.clone(), "boom", &actions);

        plan.run(&actions, &target, Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(plan.succeeded(), 1);
        assert_eq!(plan.failed(), 1);
        assert_eq!(
            plan.results[0].error.as_deref(),
            Some("recovery action first failed for service db: effect failed")
        );
        assert!(plan.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_retryable_action_gets_second_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let actions = vec![counting("flaky", 5, calls.clone(), true).retryable(true)];
        let target = target();
        let mut plan = RecoveryPlan::new(target.service_id.clone(), "boom", &actions);

        plan.run(&actions, &target, Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(plan.results[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_terminal_priority_skips_remaining_actions() {
        let calls = Arc::new(AtomicU32::new(0));
        let actions = vec![
            counting("failover", TERMINAL_PRIORITY, calls.clone(), false),
            counting("alert", 5, calls.clone(), false),
        ];
        let target = target();
        let mut plan = RecoveryPlan::new(target.service_id.clone(), "boom", &actions);

        plan.run(&actions, &target, Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(plan.results.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_action_times_out() {
        let slow = RecoveryAction::new(
            "slow",
            RecoveryActionKind::Custom,
            5,
            effect_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .with_timeout(Duration::from_millis(100));
        let actions = vec![slow];
        let target = target();
        let mut plan = RecoveryPlan::new(target.service_id.clone(), "boom", &actions);

        plan.run(&actions, &target, Duration::from_secs(10)).await;

        assert_eq!(plan.status, PlanStatus::Failed);
        assert!(plan.results[0].error.as_deref().unwrap().contains("timed out"));
    }
}
