//! QA validation of completed tasks.
//!
//! A verification walks `pending_verification -> verifying -> qa_passed |
//! qa_failed`. The checks of the task's level run in order against a shared
//! time budget; the report is persisted whatever the outcome. A failed
//! report reverts the task to `failed` and, within the generation limit,
//! queues a fix task in its place.

use std::sync::Arc;
use std::time::{Duration, Instant};

use aw_bridge::event_bus::EventBus;
use aw_bridge::protocol::WaveEvent;
use aw_core::config::{CheckDefinition, QaConfig};
use aw_core::store::{StoreError, TaskStore};
use aw_core::types::{
    CheckResult, CheckStatus, FixTaskSpec, QaState, QaStatus, QaValidationReport, SkipReason,
    Task, TaskMeta, TaskStatus,
};
use aw_harness::provider::{Validator, ValidatorError};
use aw_telemetry::metrics::{global_metrics, QA_CHECK_DURATION, QA_REPORTS_TOTAL};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::criteria::{map_criteria, parse_pass_criteria};
use crate::levels::{resolve, ResolvedLevel};
use crate::remediation::suggestions;

/// Lines of check output kept on the report.
pub const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum QaError {
    #[error("task store: {0}")]
    Store(#[from] StoreError),
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {task} is {status}, only completed tasks are verified")]
    NotCompleted { task: String, status: TaskStatus },
    #[error("no qa level configured")]
    NoLevel,
    #[error("invalid qa transition {from:?} -> {to:?}")]
    InvalidTransition { from: QaState, to: QaState },
}

pub type Result<T> = std::result::Result<T, QaError>;

// ---------------------------------------------------------------------------
// State tracking
// ---------------------------------------------------------------------------

/// Current QA state of one verification.
#[derive(Debug)]
pub struct QaTracker {
    state: QaState,
}

impl QaTracker {
    pub fn new() -> Self {
        Self {
            state: QaState::PendingVerification,
        }
    }

    pub fn state(&self) -> QaState {
        self.state
    }

    pub fn advance(&mut self, to: QaState) -> Result<()> {
        if !self.state.can_transition_to(&to) {
            return Err(QaError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(from = ?self.state, ?to, "qa transition");
        self.state = to;
        Ok(())
    }
}

impl Default for QaTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct QaOutcome {
    pub report: QaValidationReport,
    pub state: QaState,
    /// Fix task queued for a failed report, unless the original was already
    /// at the generation limit.
    pub fix_task: Option<Task>,
}

pub struct QaEngine {
    store: Arc<dyn TaskStore>,
    validator: Arc<dyn Validator>,
    bus: EventBus,
    config: QaConfig,
}

impl QaEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        validator: Arc<dyn Validator>,
        bus: EventBus,
        config: QaConfig,
    ) -> Self {
        Self {
            store,
            validator,
            bus,
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Verify a completed task and act on the verdict.
    pub async fn verify(&self, task_id: Uuid) -> Result<QaOutcome> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(QaError::NotFound(task_id))?;
        if task.status != TaskStatus::Completed {
            return Err(QaError::NotCompleted {
                task: task.display_id,
                status: task.status,
            });
        }
        let level = resolve(&self.config, &task).ok_or(QaError::NoLevel)?;

        let mut tracker = QaTracker::new();
        tracker.advance(QaState::Verifying)?;
        info!(task = %task.display_id, level = %level.level, checks = level.checks.len(), "verifying");

        let started = Instant::now();
        let checks = self.run_checks(&level).await;
        let status = report_status(&checks);
        let criteria = parse_pass_criteria(&task.description);
        let report = QaValidationReport {
            id: Uuid::new_v4(),
            task_id: task.id,
            level: level.level,
            status,
            pass_criteria: map_criteria(&criteria, &checks),
            checks,
            duration_ms: started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
        };
        self.store.insert_report(&report).await?;
        global_metrics().increment_counter(QA_REPORTS_TOTAL, &[("status", status_label(status))]);

        if status != QaStatus::Failed {
            tracker.advance(QaState::QaPassed)?;
            info!(task = %task.display_id, report = %report.id, ?status, "qa passed");
            self.bus.publish(WaveEvent::QaPassed {
                task_id: task.id,
                report_id: report.id,
                level: report.level,
                status,
            });
            return Ok(QaOutcome {
                report,
                state: tracker.state(),
                fix_task: None,
            });
        }

        tracker.advance(QaState::QaFailed)?;
        let fix_task = self.reject(&task, &report).await?;
        Ok(QaOutcome {
            report,
            state: tracker.state(),
            fix_task,
        })
    }

    async fn reject(&self, task: &Task, report: &QaValidationReport) -> Result<Option<Task>> {
        let failed = report.failed_checks();
        let failed_names: Vec<String> = failed.iter().map(|c| c.name.clone()).collect();
        warn!(task = %task.display_id, report = %report.id, failed = ?failed_names, "qa failed");

        self.store
            .update_task_status(
                task.id,
                TaskStatus::Failed,
                TaskMeta::reason(format!("qa failed: {}", failed_names.join(", "))),
            )
            .await?;
        self.bus.publish(WaveEvent::QaFailed {
            task_id: task.id,
            report_id: report.id,
            level: report.level,
            failed_checks: failed_names.clone(),
        });

        let generation = task.fix_generation() + 1;
        if generation > self.config.max_fix_generations {
            warn!(
                task = %task.display_id,
                generation,
                limit = self.config.max_fix_generations,
                "fix generation limit reached, not creating a fix task"
            );
            return Ok(None);
        }

        let fix = self
            .store
            .create_fix_task(FixTaskSpec {
                original_task_id: task.id,
                report_id: report.id,
                failed_checks: failed_names,
                suggestions: suggestions(&failed),
            })
            .await?;
        info!(task = %task.display_id, fix = %fix.display_id, generation, "fix task created");
        self.bus.publish(WaveEvent::FixCreated {
            original_task_id: task.id,
            fix_task_id: fix.id,
            report_id: report.id,
            generation,
        });
        Ok(Some(fix))
    }

    async fn run_checks(&self, level: &ResolvedLevel) -> Vec<CheckResult> {
        let started = Instant::now();
        let mut results = Vec::with_capacity(level.checks.len());
        let mut fail_fast_tripped = false;

        for check in &level.checks {
            if fail_fast_tripped {
                results.push(skipped(check, SkipReason::FailFast));
                continue;
            }
            let remaining = level.total_budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                results.push(skipped(check, SkipReason::BudgetExhausted));
                continue;
            }
            let result = self.run_check(check, check.timeout().min(remaining)).await;
            if level.fail_fast && result.required && result.status != CheckStatus::Passed {
                fail_fast_tripped = true;
            }
            results.push(result);
        }
        results
    }

    async fn run_check(&self, check: &CheckDefinition, timeout: Duration) -> CheckResult {
        debug!(check = %check.name, command = %check.command, ?timeout, "running check");
        let started = Instant::now();
        let outcome = self.validator.run(&check.command, timeout).await;
        let elapsed = started.elapsed();
        global_metrics().observe_duration(QA_CHECK_DURATION, &[("check", check.name.as_str())], elapsed);

        let mut result = CheckResult {
            name: check.name.clone(),
            command: check.command.clone(),
            required: check.required,
            status: CheckStatus::Passed,
            skip_reason: None,
            exit_code: None,
            duration_ms: elapsed.as_millis() as u64,
            output_tail: Vec::new(),
        };
        match outcome {
            Ok(out) => {
                result.exit_code = Some(out.exit_code);
                result.output_tail = tail(out.lines(), OUTPUT_TAIL_LINES);
                if !out.success() {
                    result.status = CheckStatus::Failed;
                }
            }
            Err(ValidatorError::Timeout(_)) => {
                warn!(check = %check.name, ?timeout, "check timed out");
                result.status = CheckStatus::Skipped;
                result.skip_reason = Some(SkipReason::Timeout);
            }
            Err(e @ ValidatorError::Spawn(_)) => {
                result.status = CheckStatus::Failed;
                result.output_tail = vec![e.to_string()];
            }
        }
        result
    }
}

fn skipped(check: &CheckDefinition, reason: SkipReason) -> CheckResult {
    CheckResult {
        name: check.name.clone(),
        command: check.command.clone(),
        required: check.required,
        status: CheckStatus::Skipped,
        skip_reason: Some(reason),
        exit_code: None,
        duration_ms: 0,
        output_tail: Vec::new(),
    }
}

fn tail<'a>(lines: impl Iterator<Item = &'a str>, n: usize) -> Vec<String> {
    let all: Vec<&str> = lines.collect();
    let start = all.len().saturating_sub(n);
    all[start..].iter().map(|l| l.to_string()).collect()
}

/// Required problems fail the report, optional ones make it partial.
pub fn report_status(checks: &[CheckResult]) -> QaStatus {
    let bad = |c: &&CheckResult| c.status != CheckStatus::Passed;
    if checks.iter().filter(|c| c.required).any(|c| bad(&c)) {
        QaStatus::Failed
    } else if checks.iter().any(|c| bad(&c)) {
        QaStatus::Partial
    } else {
        QaStatus::Passed
    }
}

fn status_label(status: QaStatus) -> &'static str {
    match status {
        QaStatus::Passed => "passed",
        QaStatus::Failed => "failed",
        QaStatus::Partial => "partial",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(required: bool, status: CheckStatus) -> CheckResult {
        CheckResult {
            name: "c".into(),
            command: "true".into(),
            required,
            status,
            skip_reason: None,
            exit_code: None,
            duration_ms: 0,
            output_tail: Vec::new(),
        }
    }

    #[test]
    fn status_rules() {
        use CheckStatus::*;
        assert_eq!(report_status(&[result(true, Passed), result(false, Passed)]), QaStatus::Passed);
        assert_eq!(report_status(&[result(true, Passed), result(false, Failed)]), QaStatus::Partial);
        assert_eq!(report_status(&[result(true, Passed), result(false, Skipped)]), QaStatus::Partial);
        assert_eq!(report_status(&[result(true, Skipped), result(false, Passed)]), QaStatus::Failed);
        assert_eq!(report_status(&[result(true, Failed)]), QaStatus::Failed);
        assert_eq!(report_status(&[]), QaStatus::Passed);
    }

    #[test]
    fn tracker_follows_the_qa_lifecycle() {
        let mut tracker = QaTracker::new();
        assert!(tracker.advance(QaState::QaPassed).is_err());
        tracker.advance(QaState::Verifying).unwrap();
        tracker.advance(QaState::QaFailed).unwrap();
        let err = tracker.advance(QaState::QaPassed).unwrap_err();
        assert!(matches!(
            err,
            QaError::InvalidTransition {
                from: QaState::QaFailed,
                to: QaState::QaPassed
            }
        ));
    }

    #[test]
    fn tail_keeps_the_last_lines() {
        let text = (1..=30).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let kept = tail(text.lines(), OUTPUT_TAIL_LINES);
        assert_eq!(kept.len(), 20);
        assert_eq!(kept[0], "11");
        assert_eq!(kept[19], "30");
    }
}
