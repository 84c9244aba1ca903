//! What happens to a task after a failed attempt.
//!
//! [`decide`] is pure and shared by the build agent (validator failures) and
//! the liveness sweep (crashed agents). [`apply_failure`] persists the
//! outcome and announces it.

use std::sync::Arc;

use aw_bridge::event_bus::EventBus;
use aw_bridge::protocol::WaveEvent;
use aw_core::config::AgentConfig;
use aw_core::signature::error_signature;
use aw_core::store::{self, TaskStore};
use aw_core::types::{Task, TaskMeta, TaskStatus};
use aw_telemetry::metrics::{global_metrics, TASKS_TOTAL};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDecision {
    Retry,
    Stuck,
    Failed,
}

/// Counters a task carries after one more failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureAssessment {
    pub signature: String,
    pub attempts: u32,
    pub consecutive_failures: u32,
    pub signature_streak: u32,
    pub decision: FailureDecision,
}

fn next_streak(task: &Task, signature: &str) -> u32 {
    match task.last_error_signature.as_deref() {
        Some(last) if last == signature => task.signature_streak + 1,
        _ => 1,
    }
}

/// Decide the fate of `task` (as it was before this failure) given the
/// signature of the new failure. Repeated identical errors win over the
/// retry budget.
pub fn decide(task: &Task, signature: &str, config: &AgentConfig) -> FailureDecision {
    let streak = next_streak(task, signature);
    let attempts = task.attempts + 1;
    if streak >= config.stuck_threshold {
        FailureDecision::Stuck
    } else if attempts < config.max_retries {
        FailureDecision::Retry
    } else {
        FailureDecision::Failed
    }
}

pub fn assess(task: &Task, error_text: &str, config: &AgentConfig) -> FailureAssessment {
    let signature = error_signature(error_text);
    FailureAssessment {
        attempts: task.attempts + 1,
        consecutive_failures: task.consecutive_failures + 1,
        signature_streak: next_streak(task, &signature),
        decision: decide(task, &signature, config),
        signature,
    }
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no output")
}

/// Record a failed attempt of `task`. On `Retry` the task moves to
/// `retry_status`: an agent that keeps going passes `InProgress`, the
/// liveness sweep passes `Ready` so that a fresh agent picks it up.
#[allow(clippy::too_many_arguments)]
pub async fn apply_failure(
    store: &Arc<dyn TaskStore>,
    bus: &EventBus,
    config: &AgentConfig,
    task: &Task,
    instance_id: Uuid,
    error_text: &str,
    log_tail: Vec<String>,
    retry_status: TaskStatus,
) -> store::Result<(Task, FailureAssessment)> {
    let a = assess(task, error_text, config);
    let detail = first_line(error_text);

    let (status, reason) = match a.decision {
        FailureDecision::Retry => (
            retry_status,
            format!("attempt {} failed: {detail}", a.attempts),
        ),
        FailureDecision::Stuck => (
            TaskStatus::Stuck,
            format!(
                "stuck: identical error {} times in a row: {detail}",
                a.signature_streak
            ),
        ),
        FailureDecision::Failed => (
            TaskStatus::Failed,
            format!("failed after {} attempts: {detail}", a.attempts),
        ),
    };

    let meta = TaskMeta {
        reason: Some(reason.clone()),
        attempts: Some(a.attempts),
        consecutive_failures: Some(a.consecutive_failures),
        last_error_signature: Some(Some(a.signature.clone())),
        signature_streak: Some(a.signature_streak),
        push_error: Some(error_text.to_string()),
        failure_context: Some(log_tail.clone()),
        ..TaskMeta::default()
    };
    let updated = store.update_task_status(task.id, status, meta).await?;

    match a.decision {
        FailureDecision::Retry => {
            info!(
                task = %task.display_id,
                attempt = a.attempts,
                streak = a.signature_streak,
                "attempt failed, retrying"
            );
        }
        FailureDecision::Stuck => {
            warn!(task = %task.display_id, failures = a.consecutive_failures, %reason, "task stuck");
            global_metrics().increment_counter(TASKS_TOTAL, &[("outcome", "stuck")]);
            bus.publish(WaveEvent::BuildStuck {
                task_id: task.id,
                display_id: task.display_id.clone(),
                instance_id,
                consecutive_failures: a.consecutive_failures,
                error_signature: a.signature.clone(),
                log_tail,
            });
        }
        FailureDecision::Failed => {
            warn!(task = %task.display_id, attempts = a.attempts, %reason, "task failed");
            global_metrics().increment_counter(TASKS_TOTAL, &[("outcome", "failed")]);
            bus.publish(WaveEvent::TaskFailed {
                task_id: task.id,
                display_id: task.display_id.clone(),
                attempts: a.attempts,
                reason,
            });
        }
    }
    Ok((updated, a))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        AgentConfig {
            max_retries: 3,
            stuck_threshold: 3,
            ..AgentConfig::default()
        }
    }

    fn after(task: &Task, text: &str) -> Task {
        let a = assess(task, text, &config());
        let mut next = task.clone();
        next.attempts = a.attempts;
        next.consecutive_failures = a.consecutive_failures;
        next.last_error_signature = Some(a.signature);
        next.signature_streak = a.signature_streak;
        next
    }

    #[test]
    fn identical_errors_escalate_to_stuck() {
        let cfg = config();
        let t0 = Task::new(Uuid::new_v4(), "T-1", "t");
        let err = "src/a.ts(3,1): error TS2304: Cannot find name 'x'";
        assert_eq!(decide(&t0, &error_signature(err), &cfg), FailureDecision::Retry);
        let t1 = after(&t0, err);
        assert_eq!(decide(&t1, &error_signature(err), &cfg), FailureDecision::Retry);
        let t2 = after(&t1, err);
        assert_eq!(t2.signature_streak, 2);
        assert_eq!(decide(&t2, &error_signature(err), &cfg), FailureDecision::Stuck);
    }

    #[test]
    fn volatile_details_do_not_break_the_streak() {
        let t0 = Task::new(Uuid::new_v4(), "T-1", "t");
        let t1 = after(&t0, "test failed in 120ms at /tmp/run-abc123/x.ts");
        let a = assess(&t1, "test failed in 98ms at /tmp/run-zzz999/x.ts", &config());
        assert_eq!(a.signature_streak, 2);
    }

    #[test]
    fn varying_errors_exhaust_retries_and_fail() {
        let cfg = config();
        let t0 = Task::new(Uuid::new_v4(), "T-1", "t");
        let t1 = after(&t0, "error one");
        let t2 = after(&t1, "error two");
        let a = assess(&t2, "error three", &cfg);
        assert_eq!(a.attempts, 3);
        assert_eq!(a.signature_streak, 1);
        assert_eq!(a.decision, FailureDecision::Failed);
    }

    #[test]
    fn stuck_wins_over_exhausted_retries() {
        let cfg = AgentConfig {
            max_retries: 2,
            stuck_threshold: 2,
            ..AgentConfig::default()
        };
        let t0 = Task::new(Uuid::new_v4(), "T-1", "t");
        let t1 = after(&t0, "same");
        assert_eq!(decide(&t1, &error_signature("same"), &cfg), FailureDecision::Stuck);
    }
}
