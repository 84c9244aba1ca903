use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use aw_bridge::event_bus::EventBus;
use aw_bridge::protocol::WaveEvent;
use aw_core::checkpoint::{CheckpointError, CheckpointManager};
use aw_core::config::AgentConfig;
use aw_core::locks::{acquire_all, FileLockRegistry, LockError, LockOutcome};
use aw_core::store::{StoreError, TaskStore};
use aw_core::types::{BuildAgentInstance, Checkpoint, Task, TaskMeta, TaskStatus};
use aw_core::vcs::VersionControl;
use aw_harness::provider::{Executor, TaskContext, Validator};
use aw_harness::retry::{retry_transient, Backoff};
use aw_harness::shutdown::ShutdownSignal;
use aw_telemetry::metrics::{
    global_metrics, AGENTS_RUNNING, ATTEMPTS_TOTAL, ATTEMPT_DURATION, DEFERRALS_TOTAL,
    TASKS_TOTAL,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::heartbeat::HeartbeatEmitter;
use crate::policy::{apply_failure, FailureDecision};
use crate::state_machine::{BuildAgentEvent, BuildAgentState, BuildAgentStateMachine};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("task store: {0}")]
    Store(#[from] StoreError),
    #[error("file locks: {0}")]
    Lock(#[from] LockError),
    /// The working tree can no longer be trusted. Aborts the run.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<CheckpointError> for AgentError {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::Store(s) => AgentError::Store(s),
            other => AgentError::Fatal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentOutcome {
    Completed { commit: Option<String> },
    Failed,
    Stuck,
    /// A lock was held elsewhere; the task went back to `ready`.
    Deferred { path: String, holder: Option<Uuid> },
    /// The run was told to stop; the task went back to `ready`.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AgentReport {
    pub instance_id: Uuid,
    pub task_id: Uuid,
    pub outcome: AgentOutcome,
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// LogTail
// ---------------------------------------------------------------------------

/// Bounded ring of the most recent executor and validator output lines.
#[derive(Debug, Clone)]
pub struct LogTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn extend_text(&mut self, text: &str) {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.push(line);
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

// ---------------------------------------------------------------------------
// AgentContext
// ---------------------------------------------------------------------------

/// Shared handles every agent of a run works through. Cheap to clone.
#[derive(Clone)]
pub struct AgentContext {
    pub store: Arc<dyn TaskStore>,
    pub locks: Arc<dyn FileLockRegistry>,
    pub vcs: Arc<dyn VersionControl>,
    pub checkpoints: CheckpointManager,
    pub executor: Arc<dyn Executor>,
    pub validator: Arc<dyn Validator>,
    pub bus: EventBus,
    pub config: AgentConfig,
    pub workdir: PathBuf,
}

impl AgentContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        locks: Arc<dyn FileLockRegistry>,
        vcs: Arc<dyn VersionControl>,
        executor: Arc<dyn Executor>,
        validator: Arc<dyn Validator>,
        bus: EventBus,
        config: AgentConfig,
        workdir: PathBuf,
    ) -> Self {
        let checkpoints = CheckpointManager::new(store.clone(), vcs.clone());
        Self {
            store,
            locks,
            vcs,
            checkpoints,
            executor,
            validator,
            bus,
            config,
            workdir,
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::from_millis(self.config.backoff_base_ms, self.config.backoff_max_ms)
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("workdir", &self.workdir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// BuildAgent
// ---------------------------------------------------------------------------

/// Result of one attempt that got as far as the checkpoint.
enum AttemptResult {
    Passed,
    Failed(String),
    Cancelled,
}

/// Drives one task through lock -> checkpoint -> execute -> validate, with
/// retries, until the task completes, fails, gets stuck, defers or the run
/// stops.
pub struct BuildAgent {
    ctx: AgentContext,
    instance: BuildAgentInstance,
    machine: BuildAgentStateMachine,
    stop: ShutdownSignal,
    tail: LogTail,
    heartbeat: Option<HeartbeatEmitter>,
}

impl BuildAgent {
    pub fn new(ctx: AgentContext, instance: BuildAgentInstance, stop: ShutdownSignal) -> Self {
        let tail = LogTail::new(ctx.config.log_tail_lines);
        Self {
            ctx,
            instance,
            machine: BuildAgentStateMachine::new(),
            stop,
            tail,
            heartbeat: None,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance.id
    }

    pub fn state(&self) -> BuildAgentState {
        self.machine.state()
    }

    pub fn history(&self) -> &[(BuildAgentState, BuildAgentEvent, BuildAgentState)] {
        self.machine.history()
    }

    /// Run the agent until the task completes, fails, gets stuck, defers or
    /// the run stops. A deferred agent stays `idle` and keeps beating; the
    /// orchestrator calls `run` again once the task is scheduled anew.
    pub async fn run(&mut self) -> Result<AgentReport> {
        self.persist_instance().await?;
        if self.heartbeat.is_none() {
            self.heartbeat = Some(HeartbeatEmitter::spawn(
                self.ctx.store.clone(),
                self.ctx.bus.clone(),
                self.instance.id,
                self.instance.task_id,
                self.ctx.config.heartbeat_interval(),
                self.ctx.config.stall_after(),
            ));
        }
        global_metrics().add_gauge(AGENTS_RUNNING, &[], 1);
        let result = self.drive().await;
        global_metrics().add_gauge(AGENTS_RUNNING, &[], -1);

        if !matches!(result, Ok(AgentOutcome::Deferred { .. })) {
            self.heartbeat = None;
        }

        match result {
            Ok(outcome) => {
                let attempts = self
                    .ctx
                    .store
                    .get_task(self.instance.task_id)
                    .await?
                    .map(|t| t.attempts)
                    .unwrap_or(self.instance.attempt);
                Ok(AgentReport {
                    instance_id: self.instance.id,
                    task_id: self.instance.task_id,
                    outcome,
                    attempts,
                })
            }
            Err(e) => {
                // The row stays non-terminal so the supervisor's crash path
                // can claim it and clean up locks and the checkpoint.
                error!(instance = %self.instance.id, task_id = %self.instance.task_id, error = %e, "agent aborted");
                Err(e)
            }
        }
    }

    async fn persist_instance(&mut self) -> Result<()> {
        self.instance.last_heartbeat_at = Utc::now();
        self.ctx.store.upsert_agent(&self.instance).await?;
        Ok(())
    }

    async fn fire(&mut self, event: BuildAgentEvent) -> Result<()> {
        let next = self
            .machine
            .transition(event)
            .map_err(|e| AgentError::Fatal(e.to_string()))?;
        let status = next.status();
        self.instance.status = status;
        self.ctx.store.set_agent_status(self.instance.id, status).await?;
        if let Some(hb) = &self.heartbeat {
            hb.set_status(status);
        }
        Ok(())
    }

    async fn load_task(&self) -> Result<Task> {
        self.ctx
            .store
            .get_task(self.instance.task_id)
            .await?
            .ok_or_else(|| {
                AgentError::Store(StoreError::NotFound {
                    kind: "task",
                    id: self.instance.task_id.to_string(),
                })
            })
    }

    /// Put an in-progress task back to `ready` for a later agent.
    async fn hand_back(&self, task: &Task, reason: &str) -> Result<()> {
        if task.status == TaskStatus::InProgress {
            self.ctx
                .store
                .update_task_status(task.id, TaskStatus::Ready, TaskMeta::reason(reason))
                .await?;
        }
        Ok(())
    }

    async fn release_locks(&self) -> Result<()> {
        let freed = self.ctx.locks.release_all(self.instance.id).await?;
        if !freed.is_empty() {
            debug!(instance = %self.instance.id, paths = ?freed, "locks released");
        }
        Ok(())
    }

    async fn drive(&mut self) -> Result<AgentOutcome> {
        let mut task = self.load_task().await?;
        info!(
            instance = %self.instance.id,
            task = %task.display_id,
            wave = self.instance.wave_number,
            "build agent started"
        );

        loop {
            if self.stop.is_shutting_down() {
                self.hand_back(&task, "run stopped").await?;
                info!(task = %task.display_id, "stop requested before lock acquisition");
                return Ok(AgentOutcome::Cancelled);
            }

            let requests = task.lock_requests();
            match acquire_all(self.ctx.locks.as_ref(), &requests, self.instance.id).await? {
                LockOutcome::Acquired(_) => {}
                LockOutcome::Deferred { path, holder } => {
                    return self.defer(&task, path, holder).await;
                }
            }

            let event = if self.machine.state() == BuildAgentState::Running {
                BuildAgentEvent::Retry
            } else {
                BuildAgentEvent::Start
            };
            self.fire(event).await?;

            if task.status != TaskStatus::InProgress {
                task = self
                    .ctx
                    .store
                    .update_task_status(
                        task.id,
                        TaskStatus::InProgress,
                        TaskMeta {
                            wave_number: Some(self.instance.wave_number),
                            ..TaskMeta::default()
                        },
                    )
                    .await?;
            }
            self.instance.attempt = task.attempts + 1;
            self.persist_instance().await?;
            global_metrics().increment_counter(ATTEMPTS_TOTAL, &[]);

            // Only the paths this task may write are snapshotted, so a
            // rollback never reaches into files other agents own.
            let checkpoint = match self
                .ctx
                .checkpoints
                .create(task.id, self.instance.id, task.write_paths())
                .await
            {
                Ok(cp) => cp,
                Err(e) => {
                    self.release_locks().await?;
                    return Err(e.into());
                }
            };

            let started = Instant::now();
            let result = self.attempt(&task).await;
            global_metrics().observe_duration(ATTEMPT_DURATION, &[], started.elapsed());

            match result {
                AttemptResult::Passed => match self
                    .ctx
                    .vcs
                    .commit(&commit_message(&task), &checkpoint.scope)
                    .await
                {
                    Ok(commit) => return self.succeed(&task, &checkpoint, commit).await,
                    Err(e) => {
                        let text = format!("commit failed: {e}");
                        self.tail.push(text.clone());
                        match self.fail(&task, &checkpoint, &text).await? {
                            Some(outcome) => return Ok(outcome),
                            None => task = self.load_task().await?,
                        }
                    }
                },
                AttemptResult::Failed(text) => match self.fail(&task, &checkpoint, &text).await? {
                    Some(outcome) => return Ok(outcome),
                    None => task = self.load_task().await?,
                },
                AttemptResult::Cancelled => {
                    self.rollback(&checkpoint).await?;
                    self.release_locks().await?;
                    self.hand_back(&task, "run stopped").await?;
                    info!(task = %task.display_id, "attempt cancelled, checkpoint restored");
                    return Ok(AgentOutcome::Cancelled);
                }
            }
        }
    }

    /// Execute, then validate. Transient errors are retried with backoff
    /// inside the attempt.
    async fn attempt(&mut self, task: &Task) -> AttemptResult {
        let command = task
            .validation_command
            .clone()
            .unwrap_or_else(|| self.ctx.config.default_validation_command.clone());
        let tctx = TaskContext::for_task(
            task,
            &command,
            self.instance.attempt,
            self.ctx.workdir.clone(),
        );

        if self.stop.is_shutting_down() {
            return AttemptResult::Cancelled;
        }

        // Every executor and validator call is a step; the heartbeat only
        // keeps going while steps keep starting.
        let heartbeat = self.heartbeat.as_ref();
        let executor = self.ctx.executor.as_ref();
        let tctx_ref = &tctx;
        let generated = retry_transient(
            self.ctx.backoff(),
            self.ctx.config.max_transient_retries,
            "executor",
            move || {
                if let Some(hb) = heartbeat {
                    hb.touch();
                }
                executor.generate(tctx_ref)
            },
        )
        .await;
        match generated {
            Ok(change) => {
                debug!(task = %task.display_id, files = ?change.files, "executor produced change");
                if !change.summary.is_empty() {
                    self.tail.extend_text(&change.summary);
                }
            }
            Err(e) => {
                self.tail.extend_text(e.message());
                return AttemptResult::Failed(e.message().to_string());
            }
        }

        if self.stop.is_shutting_down() {
            return AttemptResult::Cancelled;
        }

        let validator = self.ctx.validator.as_ref();
        let command_ref = command.as_str();
        let timeout = self.ctx.config.validation_timeout();
        let heartbeat = self.heartbeat.as_ref();
        let validated = retry_transient(
            self.ctx.backoff(),
            self.ctx.config.max_transient_retries,
            "validator",
            move || {
                if let Some(hb) = heartbeat {
                    hb.touch();
                }
                validator.run(command_ref, timeout)
            },
        )
        .await;
        match validated {
            Ok(out) => {
                self.tail.extend_text(&out.stdout);
                self.tail.extend_text(&out.stderr);
                if out.success() {
                    AttemptResult::Passed
                } else {
                    let text = out.error_text();
                    AttemptResult::Failed(if text.trim().is_empty() {
                        format!("validation exited with code {}", out.exit_code)
                    } else {
                        text.to_string()
                    })
                }
            }
            Err(e) => {
                let text = e.to_string();
                self.tail.push(text.clone());
                AttemptResult::Failed(text)
            }
        }
    }

    async fn defer(
        &mut self,
        task: &Task,
        path: String,
        holder: Option<Uuid>,
    ) -> Result<AgentOutcome> {
        if self.machine.state() == BuildAgentState::Initializing {
            self.fire(BuildAgentEvent::Start).await?;
        }
        self.fire(BuildAgentEvent::Defer).await?;
        self.hand_back(task, &format!("waiting for lock on {path}"))
            .await?;
        global_metrics().increment_counter(DEFERRALS_TOTAL, &[]);
        info!(task = %task.display_id, %path, holder = ?holder, "deferred on file lock");
        self.ctx.bus.publish(WaveEvent::TaskDeferred {
            task_id: task.id,
            path: path.clone(),
            holder,
        });
        Ok(AgentOutcome::Deferred { path, holder })
    }

    async fn rollback(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.ctx.checkpoints.rollback(checkpoint.id).await.map_err(|e| {
            error!(checkpoint = %checkpoint.id, error = %e, "checkpoint rollback failed");
            AgentError::from(e)
        })
    }

    async fn succeed(
        &mut self,
        task: &Task,
        checkpoint: &Checkpoint,
        commit: Option<String>,
    ) -> Result<AgentOutcome> {
        self.ctx.checkpoints.discard(checkpoint.id).await?;
        self.release_locks().await?;
        let attempts = task.attempts + 1;
        self.ctx
            .store
            .update_task_status(
                task.id,
                TaskStatus::Completed,
                TaskMeta {
                    reason: Some(format!("completed on attempt {attempts}")),
                    attempts: Some(attempts),
                    consecutive_failures: Some(0),
                    last_error_signature: Some(None),
                    signature_streak: Some(0),
                    ..TaskMeta::default()
                },
            )
            .await?;
        self.fire(BuildAgentEvent::Succeed).await?;
        global_metrics().increment_counter(TASKS_TOTAL, &[("outcome", "completed")]);
        info!(task = %task.display_id, attempts, commit = ?commit, "task completed");
        self.ctx.bus.publish(WaveEvent::TaskCompleted {
            task_id: task.id,
            display_id: task.display_id.clone(),
            attempts,
            commit: commit.clone(),
        });
        Ok(AgentOutcome::Completed { commit })
    }

    /// `None` means another attempt follows.
    async fn fail(
        &mut self,
        task: &Task,
        checkpoint: &Checkpoint,
        error_text: &str,
    ) -> Result<Option<AgentOutcome>> {
        self.rollback(checkpoint).await?;
        self.release_locks().await?;

        let (_, assessment) = apply_failure(
            &self.ctx.store,
            &self.ctx.bus,
            &self.ctx.config,
            task,
            self.instance.id,
            error_text,
            self.tail.snapshot(),
            TaskStatus::InProgress,
        )
        .await?;

        match assessment.decision {
            FailureDecision::Retry => Ok(None),
            FailureDecision::Stuck => {
                self.fire(BuildAgentEvent::Escalate).await?;
                Ok(Some(AgentOutcome::Stuck))
            }
            FailureDecision::Failed => {
                self.fire(BuildAgentEvent::Fail).await?;
                Ok(Some(AgentOutcome::Failed))
            }
        }
    }
}

fn commit_message(task: &Task) -> String {
    format!("{}: {}", task.display_id, task.title)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_tail_keeps_the_newest_lines() {
        let mut tail = LogTail::new(3);
        tail.extend_text("one\n\ntwo\nthree\nfour");
        assert_eq!(tail.snapshot(), vec!["two", "three", "four"]);
        tail.push("five");
        assert_eq!(tail.len(), 3);
        assert_eq!(tail.snapshot()[2], "five");
    }

    #[test]
    fn zero_capacity_tail_stays_empty() {
        let mut tail = LogTail::new(0);
        tail.push("x");
        assert!(tail.is_empty());
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(AgentOutcome::Deferred {
            path: "shared.ts".into(),
            holder: None,
        })
        .unwrap();
        assert_eq!(json["outcome"], "deferred");
        assert_eq!(json["path"], "shared.ts");
    }
}
