//! Crash recovery for build agents.
//!
//! An agent is treated as crashed when its heartbeat goes stale, when it
//! panics, or when the orchestrator restarts underneath it. Whoever wins
//! the store's `mark_agent_stuck` compare-and-set runs the crash path;
//! everyone else backs off, so a detection is handled exactly once.

use std::future::Future;
use std::sync::Arc;

use aw_agents::policy::{apply_failure, FailureDecision};
use aw_bridge::event_bus::EventBus;
use aw_core::checkpoint::{CheckpointError, CheckpointManager};
use aw_core::config::AgentConfig;
use aw_core::locks::{FileLockRegistry, LockError};
use aw_core::store::{StoreError, TaskStore};
use aw_core::types::TaskStatus;
use aw_telemetry::metrics::{global_metrics, STALE_AGENTS_TOTAL};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::heartbeat::HeartbeatMonitor;

pub const HEARTBEAT_LOST: &str = "agent heartbeat lost";

#[derive(Debug, thiserror::Error)]
pub enum PatrolError {
    #[error("task store: {0}")]
    Store(#[from] StoreError),
    #[error("file locks: {0}")]
    Lock(#[from] LockError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl PatrolError {
    /// A checkpoint that could not be restored leaves the working tree in an
    /// unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PatrolError::Checkpoint(e) if e.is_fatal())
    }
}

pub type Result<T> = std::result::Result<T, PatrolError>;

/// What the crash path did for one agent.
#[derive(Debug, Clone)]
pub struct Recovery {
    pub instance_id: Uuid,
    pub task_id: Uuid,
    pub released: Vec<String>,
    pub restored_checkpoint: Option<Uuid>,
    /// `None` when the task was not in progress and was left alone.
    pub decision: Option<FailureDecision>,
}

/// Result of a single patrol sweep.
#[derive(Debug, Clone)]
pub struct PatrolReport {
    /// Stale agents seen, including ones another sweep already claimed.
    pub stale_agents: usize,
    pub recovered: Vec<Recovery>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PatrolRunner {
    store: Arc<dyn TaskStore>,
    locks: Arc<dyn FileLockRegistry>,
    checkpoints: CheckpointManager,
    bus: EventBus,
    config: AgentConfig,
    monitor: HeartbeatMonitor,
}

impl PatrolRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        locks: Arc<dyn FileLockRegistry>,
        checkpoints: CheckpointManager,
        bus: EventBus,
        config: AgentConfig,
        monitor: HeartbeatMonitor,
    ) -> Self {
        Self {
            store,
            locks,
            checkpoints,
            bus,
            config,
            monitor,
        }
    }

    /// Find the run's stale agents and recover the ones this sweep claims.
    /// `on_claimed` runs between the claim and the crash path, and the crash
    /// path waits for it; the orchestrator uses it to stop the agent's local
    /// task before its checkpoint is restored.
    pub async fn sweep<F, Fut>(&self, run_id: Uuid, mut on_claimed: F) -> Result<PatrolReport>
    where
        F: FnMut(Uuid) -> Fut,
        Fut: Future<Output = ()>,
    {
        debug!(run_id = %run_id, "patrol sweep starting");
        let stale = self.monitor.check_run(self.store.as_ref(), run_id).await?;

        let mut recovered = Vec::new();
        for agent in &stale {
            if !self.claim(agent.instance_id).await? {
                continue;
            }
            on_claimed(agent.instance_id).await;
            recovered.push(self.crash(agent.instance_id, agent.task_id, HEARTBEAT_LOST).await?);
        }

        let report = PatrolReport {
            stale_agents: stale.len(),
            recovered,
            timestamp: Utc::now(),
        };
        if report.stale_agents > 0 {
            info!(
                run_id = %run_id,
                stale_agents = report.stale_agents,
                recovered = report.recovered.len(),
                "patrol completed"
            );
        }
        Ok(report)
    }

    /// Crash path for one agent that is known to be dead, if nobody else
    /// handled it yet.
    pub async fn recover_agent(
        &self,
        instance_id: Uuid,
        task_id: Uuid,
        reason: &str,
    ) -> Result<Option<Recovery>> {
        if !self.claim(instance_id).await? {
            return Ok(None);
        }
        self.crash(instance_id, task_id, reason).await.map(Some)
    }

    /// Crash path for every agent of the run that never reached a terminal
    /// status. Used after an orchestrator restart.
    pub async fn recover_run(&self, run_id: Uuid, reason: &str) -> Result<PatrolReport> {
        let agents = self.store.list_agents(run_id).await?;
        let live: Vec<_> = agents.iter().filter(|a| !a.status.is_terminal()).collect();
        let mut recovered = Vec::new();
        for agent in &live {
            if let Some(r) = self.recover_agent(agent.id, agent.task_id, reason).await? {
                recovered.push(r);
            }
        }
        info!(run_id = %run_id, agents = live.len(), recovered = recovered.len(), "recovered agents after restart");
        Ok(PatrolReport {
            stale_agents: live.len(),
            recovered,
            timestamp: Utc::now(),
        })
    }

    async fn claim(&self, instance_id: Uuid) -> Result<bool> {
        let won = self.store.mark_agent_stuck(instance_id).await?;
        if !won {
            debug!(instance = %instance_id, "agent already handled elsewhere");
        }
        Ok(won)
    }

    async fn crash(&self, instance_id: Uuid, task_id: Uuid, reason: &str) -> Result<Recovery> {
        global_metrics().increment_counter(STALE_AGENTS_TOTAL, &[]);
        let released = self.locks.force_release(instance_id).await?;

        let restored_checkpoint = match self.checkpoints.active_for(instance_id).await? {
            Some(cp) => {
                self.checkpoints.rollback(cp.id).await?;
                Some(cp.id)
            }
            None => None,
        };

        let mut decision = None;
        match self.store.get_task(task_id).await? {
            Some(task) if task.status == TaskStatus::InProgress => {
                let (_, assessment) = apply_failure(
                    &self.store,
                    &self.bus,
                    &self.config,
                    &task,
                    instance_id,
                    reason,
                    Vec::new(),
                    TaskStatus::Ready,
                )
                .await?;
                decision = Some(assessment.decision);
            }
            Some(task) => {
                debug!(task = %task.display_id, status = %task.status, "task not in progress, left as is");
            }
            None => warn!(task_id = %task_id, "crashed agent's task is gone"),
        }

        warn!(
            instance = %instance_id,
            task_id = %task_id,
            released = released.len(),
            checkpoint = ?restored_checkpoint,
            decision = ?decision,
            reason,
            "agent crash handled"
        );
        Ok(Recovery {
            instance_id,
            task_id,
            released,
            restored_checkpoint,
            decision,
        })
    }
}
