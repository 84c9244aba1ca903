//! Wave-by-wave execution of a task list.
//!
//! The orchestrator owns the run loop: it plans waves, launches one build
//! agent per ready task of the current wave (bounded by the scheduler),
//! hands completed tasks to QA, blocks dependents of failed tasks and
//! re-plans when the list changes underneath it. A patrol sweep on its own
//! interval catches agents whose heartbeat stopped.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use aw_agents::build_agent::{
    AgentContext, AgentError, AgentOutcome, AgentReport, BuildAgent,
};
use aw_bridge::protocol::WaveEvent;
use aw_core::checkpoint::CheckpointError;
use aw_core::config::{Config, OrchestratorConfig};
use aw_core::conflict::ConflictDetector;
use aw_core::locks::LockError;
use aw_core::planner::{PlanError, WavePlanner};
use aw_core::store::StoreError;
use aw_core::types::{
    BuildAgentInstance, ExecutionRun, RunStatus, Task, TaskMeta, TaskStatus, Wave, WaveStatus,
};
use aw_harness::shutdown::{ShutdownSignal, StopCause};
use aw_qa::engine::{QaEngine, QaError, QaOutcome};
use aw_telemetry::metrics::{global_metrics, CURRENT_WAVE};
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::heartbeat::HeartbeatMonitor;
use crate::patrol::{PatrolError, PatrolRunner};
use crate::scheduler::TaskScheduler;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("task store: {0}")]
    Store(#[from] StoreError),
    #[error("file locks: {0}")]
    Lock(#[from] LockError),
    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },
}

impl OrchestratorError {
    /// Errors that mean the run cannot be trusted to continue, as opposed to
    /// a missing row or a failing store.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestratorError::Plan(_) | OrchestratorError::Fatal(_))
    }
}

impl From<PatrolError> for OrchestratorError {
    fn from(e: PatrolError) -> Self {
        match e {
            PatrolError::Store(s) => OrchestratorError::Store(s),
            PatrolError::Lock(l) => OrchestratorError::Lock(l),
            PatrolError::Checkpoint(CheckpointError::Store(s)) => OrchestratorError::Store(s),
            PatrolError::Checkpoint(other) => OrchestratorError::Fatal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// In-flight bookkeeping
// ---------------------------------------------------------------------------

/// What a finished job hands back to the run loop.
enum Job {
    Agent {
        task_id: Uuid,
        instance_id: Uuid,
        result: std::thread::Result<(BuildAgent, std::result::Result<AgentReport, AgentError>)>,
    },
    Qa {
        task_id: Uuid,
        result: std::thread::Result<std::result::Result<QaOutcome, QaError>>,
    },
}

struct Running {
    instance_id: Uuid,
    abort: AbortHandle,
    /// Resolves once the agent's task has been dropped, whether it finished
    /// or was aborted.
    stopped: oneshot::Receiver<()>,
}

/// Everything the run loop has launched and not yet collected.
#[derive(Default)]
struct Flight {
    jobs: JoinSet<Job>,
    /// Keyed by task id.
    agents: HashMap<Uuid, Running>,
    /// Deferred agents waiting for their task to be scheduled again, keyed
    /// by task id.
    parked: HashMap<Uuid, BuildAgent>,
    qa: HashSet<Uuid>,
}

impl Flight {
    fn is_busy(&self) -> bool {
        !self.agents.is_empty() || !self.qa.is_empty()
    }

    fn is_busy_with(&self, task_id: &Uuid) -> bool {
        self.agents.contains_key(task_id) || self.qa.contains(task_id)
    }

    /// Spawn an agent future, tracking it under `task_id`.
    fn launch<F>(&mut self, task_id: Uuid, instance_id: Uuid, job: F)
    where
        F: Future<Output = Job> + Send + 'static,
    {
        let (guard, stopped) = oneshot::channel::<()>();
        let abort = self.jobs.spawn(Tracked {
            job: Box::pin(job),
            _stopped: guard,
        });
        self.agents.insert(
            task_id,
            Running {
                instance_id,
                abort,
                stopped,
            },
        );
    }

    /// Abort the local task of an agent the patrol claimed. The returned
    /// future resolves once that task is gone, so the crash path never
    /// restores a checkpoint underneath an agent that is still writing.
    fn abandon(&mut self, instance_id: Uuid) -> impl Future<Output = ()> + Send + 'static {
        let running = self
            .agents
            .iter()
            .find(|(_, r)| r.instance_id == instance_id)
            .map(|(task_id, _)| *task_id)
            .and_then(|task_id| self.agents.remove(&task_id));
        self.parked.retain(|_, agent| agent.instance_id() != instance_id);
        if let Some(running) = &running {
            running.abort.abort();
        }
        async move {
            if let Some(running) = running {
                // The sender lives inside the task and drops with it.
                let _ = running.stopped.await;
            }
        }
    }
}

/// A job whose `_stopped` sender is dropped strictly after the job itself.
struct Tracked<F> {
    job: Pin<Box<F>>,
    _stopped: oneshot::Sender<()>,
}

impl<F: Future> Future for Tracked<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        self.job.as_mut().poll(cx)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    ctx: AgentContext,
    qa: Arc<QaEngine>,
    planner: WavePlanner,
    scheduler: TaskScheduler,
    patrol: PatrolRunner,
    config: OrchestratorConfig,
    stop: ShutdownSignal,
}

impl Orchestrator {
    /// Build an orchestrator over `ctx`. The agent section of `ctx` is used
    /// as is; everything else comes from `config`.
    pub fn new(ctx: AgentContext, config: &Config) -> Self {
        let qa = Arc::new(QaEngine::new(
            ctx.store.clone(),
            ctx.validator.clone(),
            ctx.bus.clone(),
            config.qa.clone(),
        ));
        let patrol = PatrolRunner::new(
            ctx.store.clone(),
            ctx.locks.clone(),
            ctx.checkpoints.clone(),
            ctx.bus.clone(),
            ctx.config.clone(),
            HeartbeatMonitor::new(config.orchestrator.staleness_threshold()),
        );
        Self {
            qa,
            planner: WavePlanner::new(ConflictDetector::new(config.conflict.clone())),
            scheduler: TaskScheduler::new(config.orchestrator.max_concurrent_agents),
            patrol,
            config: config.orchestrator.clone(),
            stop: ShutdownSignal::new(),
            ctx,
        }
    }

    /// Handle for stopping the run from outside, e.g. on Ctrl-C.
    pub fn stop_handle(&self) -> ShutdownSignal {
        self.stop.clone()
    }

    /// Start a run for `list_id` and drive it to the end.
    pub async fn run(&self, list_id: Uuid) -> Result<ExecutionRun> {
        let run = self.start_run(list_id).await?;
        self.drive(run.id).await
    }

    /// Plan and persist a new run. A plan error (a dependency cycle, an
    /// impact that cannot be compared) still persists the run, as `failed`.
    pub async fn start_run(&self, list_id: Uuid) -> Result<ExecutionRun> {
        let list = self
            .ctx
            .store
            .get_task_list(list_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                kind: "task list",
                id: list_id,
            })?;

        self.block_dependents(list_id, &HashSet::new()).await?;
        self.ctx.store.refresh_readiness(list_id).await?;

        let mut run = ExecutionRun::new(list_id);
        run.planned_revision = self.ctx.store.list_revision(list_id).await?;
        let tasks = self.ctx.store.list_tasks(list_id).await?;

        match self.plan_waves(&[], &tasks) {
            Ok(waves) => run.waves = waves,
            Err(e) => {
                error!(list = %list.name, error = %e, "planning failed");
                run.status = RunStatus::Failed;
                run.error = Some(e.to_string());
                run.finished_at = Some(Utc::now());
                self.ctx.store.create_run(&run).await?;
                self.ctx.bus.publish(WaveEvent::RunFinished {
                    run_id: run.id,
                    status: run.status,
                    error: run.error.clone(),
                });
                return Err(OrchestratorError::Plan(e));
            }
        }

        self.ctx.store.create_run(&run).await?;
        info!(
            run_id = %run.id,
            list = %list.name,
            tasks = tasks.len(),
            waves = run.waves.len(),
            "run started"
        );
        Ok(run)
    }

    /// Pick a run back up after the previous orchestrator went away. Every
    /// agent it left behind goes down the crash path first.
    pub async fn resume(&self, run_id: Uuid) -> Result<ExecutionRun> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Running {
            info!(run_id = %run_id, status = ?run.status, "run already finished");
            return Ok(run);
        }

        self.patrol
            .recover_run(run_id, "orchestrator restarted")
            .await?;

        for task in self.ctx.store.list_tasks(run.task_list_id).await? {
            if task.status == TaskStatus::InProgress {
                warn!(task = %task.display_id, "in progress without an agent, back to ready");
                self.ctx
                    .store
                    .update_task_status(
                        task.id,
                        TaskStatus::Ready,
                        TaskMeta::reason("recovered after restart"),
                    )
                    .await?;
            }
        }

        self.drive(run_id).await
    }

    /// Drive a started run until every wave is done, the run is stopped or a
    /// fatal error ends it.
    pub async fn drive(&self, run_id: Uuid) -> Result<ExecutionRun> {
        let mut run = self.load_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Ok(run);
        }

        let mut flight = Flight::default();
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first sweep tick fires immediately; nothing can be stale yet.
        sweep.tick().await;

        let outcome: Result<()> = loop {
            tokio::select! {
                Some(joined) = flight.jobs.join_next(), if !flight.jobs.is_empty() => {
                    if let Err(e) = self.on_job(&mut flight, joined).await {
                        break Err(e);
                    }
                }
                _ = tick.tick() => {
                    match self.step(&mut run, &mut flight).await {
                        Ok(true) => break Ok(()),
                        Ok(false) => {}
                        Err(e) => break Err(e),
                    }
                }
                _ = sweep.tick() => {
                    let swept = self
                        .patrol
                        .sweep(run.id, |instance| flight.abandon(instance))
                        .await;
                    if let Err(e) = swept {
                        break Err(e.into());
                    }
                }
            }
        };

        match outcome {
            Ok(()) => Ok(run),
            Err(e) => self.abort(&mut run, &mut flight, e).await,
        }
    }

    /// One pass of the run loop. Returns `true` once the run is finished.
    async fn step(&self, run: &mut ExecutionRun, flight: &mut Flight) -> Result<bool> {
        if !self.stop.is_shutting_down() && self.ctx.store.is_stop_requested(run.id).await? {
            info!(run_id = %run.id, "stop requested");
            self.stop.trigger(StopCause::Cancelled);
        }
        if self.stop.is_shutting_down() {
            // In-flight agents notice the signal at their next step boundary.
            if flight.is_busy() {
                return Ok(false);
            }
            flight.parked.clear();
            let cause = self
                .stop
                .cause()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "stopped".to_string());
            self.finish(run, RunStatus::Failed, Some(cause)).await?;
            return Ok(true);
        }

        self.block_dependents(run.task_list_id, &flight.qa).await?;
        self.ctx.store.refresh_readiness(run.task_list_id).await?;
        self.replan_if_changed(run).await?;

        let tasks: HashMap<Uuid, Task> = self
            .ctx
            .store
            .list_tasks(run.task_list_id)
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        loop {
            let Some(idx) = run.waves.iter().position(|w| w.status != WaveStatus::Completed)
            else {
                if flight.is_busy() {
                    return Ok(false);
                }
                let (status, error) = final_status(&tasks);
                self.finish(run, status, error).await?;
                return Ok(true);
            };

            if run.waves[idx].status == WaveStatus::Pending {
                self.start_wave(run, idx).await?;
            }

            let wave = &run.waves[idx];
            let done = wave.task_ids.iter().all(|id| {
                !flight.is_busy_with(id)
                    && tasks.get(id).map_or(true, |t| t.status.is_terminal())
            });
            if done {
                self.complete_wave(run, idx).await?;
                continue;
            }

            let mut ready: Vec<Task> = wave
                .task_ids
                .iter()
                .filter_map(|id| tasks.get(id))
                .filter(|t| t.status == TaskStatus::Ready && !flight.agents.contains_key(&t.id))
                .cloned()
                .collect();
            self.scheduler.order(&mut ready);
            let wave_number = wave.number;
            for task in &ready {
                let Some(permit) = self.scheduler.try_permit() else {
                    debug!(waiting = ready.len(), "all agent slots taken");
                    break;
                };
                self.spawn_agent(run.id, wave_number, task, flight, permit);
            }
            return Ok(false);
        }
    }

    fn spawn_agent(
        &self,
        run_id: Uuid,
        wave: u32,
        task: &Task,
        flight: &mut Flight,
        permit: OwnedSemaphorePermit,
    ) {
        let mut agent = match flight.parked.remove(&task.id) {
            Some(agent) => {
                debug!(task = %task.display_id, instance = %agent.instance_id(), "resuming deferred agent");
                agent
            }
            None => {
                let instance = BuildAgentInstance::new(run_id, wave, task.id, task.attempts + 1);
                self.ctx.bus.publish(WaveEvent::AgentSpawned {
                    run_id,
                    instance_id: instance.id,
                    task_id: task.id,
                    wave,
                    attempt: instance.attempt,
                });
                BuildAgent::new(self.ctx.clone(), instance, self.stop.clone())
            }
        };

        let task_id = task.id;
        let instance_id = agent.instance_id();
        flight.launch(task_id, instance_id, async move {
            let _permit = permit;
            let result = AssertUnwindSafe(async move {
                let report = agent.run().await;
                (agent, report)
            })
            .catch_unwind()
            .await;
            Job::Agent {
                task_id,
                instance_id,
                result,
            }
        });
    }

    fn spawn_qa(&self, task_id: Uuid, flight: &mut Flight) {
        let qa = Arc::clone(&self.qa);
        flight.qa.insert(task_id);
        flight.jobs.spawn(async move {
            let result = AssertUnwindSafe(qa.verify(task_id)).catch_unwind().await;
            Job::Qa { task_id, result }
        });
    }

    async fn on_job(
        &self,
        flight: &mut Flight,
        joined: std::result::Result<Job, JoinError>,
    ) -> Result<()> {
        let job = match joined {
            Ok(job) => job,
            // Aborted after the patrol claimed it; the crash path already ran.
            Err(e) if e.is_cancelled() => return Ok(()),
            Err(e) => return Err(OrchestratorError::Fatal(format!("job failed: {e}"))),
        };

        match job {
            Job::Agent {
                task_id,
                instance_id,
                result,
            } => {
                if flight
                    .agents
                    .get(&task_id)
                    .is_some_and(|r| r.instance_id == instance_id)
                {
                    flight.agents.remove(&task_id);
                }
                match result {
                    Ok((agent, Ok(report))) => self.on_report(flight, agent, report),
                    Ok((_, Err(AgentError::Fatal(msg)))) => {
                        return Err(OrchestratorError::Fatal(msg));
                    }
                    Ok((_, Err(e))) => {
                        self.patrol
                            .recover_agent(instance_id, task_id, &format!("agent error: {e}"))
                            .await?;
                    }
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        error!(instance = %instance_id, task_id = %task_id, panic = %msg, "agent panicked");
                        self.patrol
                            .recover_agent(instance_id, task_id, &format!("agent panicked: {msg}"))
                            .await?;
                    }
                }
            }
            Job::Qa { task_id, result } => {
                flight.qa.remove(&task_id);
                match result {
                    Ok(Ok(outcome)) => {
                        debug!(task_id = %task_id, state = ?outcome.state, "qa finished");
                    }
                    Ok(Err(e)) => {
                        warn!(task_id = %task_id, error = %e, "qa could not run, completion stands");
                    }
                    Err(payload) => {
                        error!(task_id = %task_id, panic = %panic_message(payload.as_ref()), "qa panicked");
                    }
                }
            }
        }
        Ok(())
    }

    fn on_report(&self, flight: &mut Flight, agent: BuildAgent, report: AgentReport) {
        debug!(
            task_id = %report.task_id,
            outcome = ?report.outcome,
            attempts = report.attempts,
            "agent finished"
        );
        match report.outcome {
            AgentOutcome::Completed { .. } => {
                if self.qa.enabled() {
                    self.spawn_qa(report.task_id, flight);
                }
            }
            AgentOutcome::Deferred { .. } => {
                flight.parked.insert(report.task_id, agent);
            }
            // Dependents are blocked on the next step.
            AgentOutcome::Failed | AgentOutcome::Stuck | AgentOutcome::Cancelled => {}
        }
    }

    /// Block every pending or ready task that depends on a failed, stuck or
    /// blocked task, transitively. Failed tasks in `qa_pending` are skipped:
    /// their fix task may still take over their dependents.
    async fn block_dependents(&self, list_id: Uuid, qa_pending: &HashSet<Uuid>) -> Result<usize> {
        let tasks = self.ctx.store.list_tasks(list_id).await?;
        let names: HashMap<Uuid, &str> = tasks
            .iter()
            .map(|t| (t.id, t.display_id.as_str()))
            .collect();
        let mut status: HashMap<Uuid, TaskStatus> =
            tasks.iter().map(|t| (t.id, t.status)).collect();

        let mut blocked = 0;
        loop {
            let mut changed = false;
            for task in &tasks {
                if !matches!(status.get(&task.id), Some(TaskStatus::Pending | TaskStatus::Ready)) {
                    continue;
                }
                let blocker = task.depends_on.iter().copied().find(|dep| {
                    match status.get(dep) {
                        Some(TaskStatus::Failed) => !qa_pending.contains(dep),
                        Some(TaskStatus::Stuck | TaskStatus::Blocked) => true,
                        _ => false,
                    }
                });
                let Some(dep) = blocker else { continue };

                let dep_name = names.get(&dep).copied().unwrap_or("unknown task");
                let dep_status = status.get(&dep).copied().unwrap_or(TaskStatus::Blocked);
                self.ctx
                    .store
                    .update_task_status(
                        task.id,
                        TaskStatus::Blocked,
                        TaskMeta::reason(format!("blocked by {dep_name} ({dep_status})")),
                    )
                    .await?;
                info!(task = %task.display_id, blocked_by = dep_name, "task blocked");
                self.ctx.bus.publish(WaveEvent::TaskBlocked {
                    task_id: task.id,
                    display_id: task.display_id.clone(),
                    blocked_by: dep,
                });
                status.insert(task.id, TaskStatus::Blocked);
                changed = true;
                blocked += 1;
            }
            if !changed {
                break;
            }
        }
        Ok(blocked)
    }

    /// Waves for every schedulable task, keeping `frozen` waves as they are.
    ///
    /// A task whose dependency is neither schedulable nor satisfied is left
    /// out; it is either blocked on a later step or planned once a fix task
    /// takes over the dependency.
    fn plan_waves(
        &self,
        frozen: &[Wave],
        tasks: &[Task],
    ) -> std::result::Result<Vec<Wave>, PlanError> {
        let satisfied: HashSet<Uuid> = tasks
            .iter()
            .filter(|t| t.status.satisfies_dependency())
            .map(|t| t.id)
            .collect();
        let mut known: HashSet<Uuid> = satisfied.clone();
        for wave in frozen {
            known.extend(wave.task_ids.iter().copied());
        }

        let mut candidates: Vec<Task> = tasks
            .iter()
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Pending | TaskStatus::Ready | TaskStatus::InProgress
                )
            })
            .cloned()
            .collect();
        loop {
            let ids: HashSet<Uuid> = candidates.iter().map(|t| t.id).collect();
            let before = candidates.len();
            candidates.retain(|t| {
                t.depends_on
                    .iter()
                    .all(|d| ids.contains(d) || known.contains(d))
            });
            if candidates.len() == before {
                break;
            }
        }

        self.planner.replan(frozen, &candidates, &satisfied)
    }

    async fn replan_if_changed(&self, run: &mut ExecutionRun) -> Result<()> {
        let revision = self.ctx.store.list_revision(run.task_list_id).await?;
        if revision == run.planned_revision {
            return Ok(());
        }
        let tasks = self.ctx.store.list_tasks(run.task_list_id).await?;
        let frozen: Vec<Wave> = run
            .waves
            .iter()
            .filter(|w| w.status.is_frozen())
            .cloned()
            .collect();
        run.waves = self.plan_waves(&frozen, &tasks)?;
        run.planned_revision = revision;
        self.ctx.store.save_run(run).await?;
        info!(
            run_id = %run.id,
            revision,
            frozen = frozen.len(),
            waves = run.waves.len(),
            "re-planned after task list change"
        );
        Ok(())
    }

    async fn start_wave(&self, run: &mut ExecutionRun, idx: usize) -> Result<()> {
        let wave = &mut run.waves[idx];
        wave.status = WaveStatus::Running;
        let (number, task_ids) = (wave.number, wave.task_ids.clone());
        self.ctx.store.save_run(run).await?;
        global_metrics().set_gauge(CURRENT_WAVE, &[], i64::from(number));
        info!(run_id = %run.id, wave = number, tasks = task_ids.len(), "wave started");
        self.ctx.bus.publish(WaveEvent::WaveStarted {
            run_id: run.id,
            wave: number,
            task_ids,
        });
        Ok(())
    }

    async fn complete_wave(&self, run: &mut ExecutionRun, idx: usize) -> Result<()> {
        run.waves[idx].status = WaveStatus::Completed;
        let number = run.waves[idx].number;
        self.ctx.store.save_run(run).await?;
        info!(run_id = %run.id, wave = number, "wave completed");
        self.ctx.bus.publish(WaveEvent::WaveCompleted {
            run_id: run.id,
            wave: number,
        });
        Ok(())
    }

    async fn finish(
        &self,
        run: &mut ExecutionRun,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<()> {
        run.status = status;
        run.error = error;
        run.finished_at = Some(Utc::now());
        self.ctx.store.save_run(run).await?;
        match &run.error {
            None => info!(run_id = %run.id, status = ?run.status, "run finished"),
            Some(e) => warn!(run_id = %run.id, status = ?run.status, error = %e, "run finished"),
        }
        self.ctx.bus.publish(WaveEvent::RunFinished {
            run_id: run.id,
            status: run.status,
            error: run.error.clone(),
        });
        Ok(())
    }

    /// Stop launching, wait for whatever is in flight, then record the run
    /// as failed with `err`.
    async fn abort(
        &self,
        run: &mut ExecutionRun,
        flight: &mut Flight,
        err: OrchestratorError,
    ) -> Result<ExecutionRun> {
        error!(run_id = %run.id, error = %err, "run aborted");
        self.stop.trigger(StopCause::Fatal(err.to_string()));

        while let Some(joined) = flight.jobs.join_next().await {
            if let Ok(Job::Agent {
                instance_id,
                result: Ok((_, Err(e))),
                ..
            }) = &joined
            {
                warn!(instance = %instance_id, error = %e, "agent error while draining");
            }
        }
        flight.agents.clear();
        flight.qa.clear();
        flight.parked.clear();

        if let Err(e) = self
            .finish(run, RunStatus::Failed, Some(err.to_string()))
            .await
        {
            error!(run_id = %run.id, error = %e, "could not record the failed run");
        }
        Err(err)
    }

    async fn load_run(&self, run_id: Uuid) -> Result<ExecutionRun> {
        self.ctx
            .store
            .get_run(run_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                kind: "run",
                id: run_id,
            })
    }
}

/// `completed` when every task completed or was skipped, counting a failed
/// task whose chain of fix tasks ends in a completed one.
fn final_status(tasks: &HashMap<Uuid, Task>) -> (RunStatus, Option<String>) {
    let mut unresolved: Vec<&str> = tasks
        .values()
        .filter(|t| !t.status.satisfies_dependency() && !resolved_by_fix(t, tasks))
        .map(|t| t.display_id.as_str())
        .collect();
    if unresolved.is_empty() {
        return (RunStatus::Completed, None);
    }
    unresolved.sort_unstable();
    (
        RunStatus::Failed,
        Some(format!(
            "{} task(s) did not complete: {}",
            unresolved.len(),
            unresolved.join(", ")
        )),
    )
}

fn resolved_by_fix(task: &Task, tasks: &HashMap<Uuid, Task>) -> bool {
    if task.status != TaskStatus::Failed {
        return false;
    }
    let mut current = task;
    for _ in 0..=tasks.len() {
        match current.superseded_by.and_then(|id| tasks.get(&id)) {
            Some(next) => current = next,
            None => return current.status == TaskStatus::Completed,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks(items: Vec<Task>) -> HashMap<Uuid, Task> {
        items.into_iter().map(|t| (t.id, t)).collect()
    }

    #[test]
    fn fix_chain_counts_as_completed() {
        let list = Uuid::new_v4();
        let mut original = Task::new(list, "T-1", "checkout");
        let mut fix1 = Task::new(list, "T-1-fix1", "fix");
        let mut fix2 = Task::new(list, "T-1-fix2", "fix again");
        original.status = TaskStatus::Failed;
        original.superseded_by = Some(fix1.id);
        fix1.status = TaskStatus::Failed;
        fix1.superseded_by = Some(fix2.id);
        fix2.status = TaskStatus::Completed;

        let all = tasks(vec![original, fix1, fix2]);
        assert_eq!(final_status(&all), (RunStatus::Completed, None));
    }

    #[test]
    fn unresolved_tasks_fail_the_run() {
        let list = Uuid::new_v4();
        let mut done = Task::new(list, "T-1", "a");
        done.status = TaskStatus::Completed;
        let mut failed = Task::new(list, "T-2", "b");
        failed.status = TaskStatus::Failed;
        let mut blocked = Task::new(list, "T-3", "c");
        blocked.status = TaskStatus::Blocked;
        let mut skipped = Task::new(list, "T-4", "d");
        skipped.status = TaskStatus::Skipped;

        let (status, error) = final_status(&tasks(vec![done, failed, blocked, skipped]));
        assert_eq!(status, RunStatus::Failed);
        assert_eq!(error.as_deref(), Some("2 task(s) did not complete: T-2, T-3"));
    }

    #[test]
    fn fatal_checkpoint_errors_stay_fatal() {
        let err: OrchestratorError = PatrolError::Checkpoint(CheckpointError::RestoreFailed {
            checkpoint: Uuid::nil(),
            source: aw_core::vcs::VcsError::NotFound("snap-1".into()),
        })
        .into();
        assert!(err.is_fatal());
        let err = OrchestratorError::NotFound {
            kind: "run",
            id: Uuid::nil(),
        };
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn abandon_waits_for_the_agent_task_to_stop() {
        struct SetOnDrop(Arc<std::sync::atomic::AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut flight = Flight::default();
        let task_id = Uuid::new_v4();
        let instance_id = Uuid::new_v4();
        let marker = SetOnDrop(dropped.clone());
        flight.launch(task_id, instance_id, async move {
            let _marker = marker;
            std::future::pending::<Job>().await
        });
        tokio::task::yield_now().await;

        flight.abandon(instance_id).await;
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!flight.is_busy());

        // Unknown instances resolve immediately.
        flight.abandon(Uuid::new_v4()).await;
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
