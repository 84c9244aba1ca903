use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::store::{StoreError, TaskStore};
use crate::types::{Checkpoint, CheckpointState};
use crate::vcs::{VcsError, VersionControl};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint store: {0}")]
    Store(#[from] StoreError),

    #[error("snapshot: {0}")]
    Vcs(#[from] VcsError),

    #[error("checkpoint {0} not found")]
    NotFound(Uuid),

    /// The working tree may be partially rolled back. Fatal to the run.
    #[error("restore of checkpoint {checkpoint} failed: {source}")]
    RestoreFailed {
        checkpoint: Uuid,
        #[source]
        source: VcsError,
    },
}

impl CheckpointError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CheckpointError::RestoreFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Takes and restores working-tree snapshots around a task attempt. Every
/// checkpoint is recorded in the store, scope included, before `create`
/// returns, so a crashed attempt can be rolled back by whoever picks it up
/// next without disturbing paths other agents are working on.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn TaskStore>,
    vcs: Arc<dyn VersionControl>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn TaskStore>, vcs: Arc<dyn VersionControl>) -> Self {
        Self { store, vcs }
    }

    /// Snapshot `scope`, the paths the attempt is allowed to modify.
    pub async fn create(
        &self,
        task_id: Uuid,
        instance_id: Uuid,
        scope: Vec<String>,
    ) -> Result<Checkpoint> {
        let id = Uuid::new_v4();
        let snapshot_ref = self.vcs.snapshot(&id.to_string(), &scope).await?;
        let checkpoint = Checkpoint {
            id,
            task_id,
            instance_id,
            snapshot_ref,
            scope,
            state: CheckpointState::Active,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_checkpoint(&checkpoint).await {
            if let Err(discard) = self.vcs.discard(&checkpoint.snapshot_ref).await {
                tracing::warn!(checkpoint = %id, error = %discard, "orphaned snapshot");
            }
            return Err(e.into());
        }
        tracing::debug!(checkpoint = %id, task_id = %task_id, instance = %instance_id, "checkpoint created");
        Ok(checkpoint)
    }

    /// Return the working tree to the checkpoint. Restoring a checkpoint that
    /// was already restored or discarded is a no-op.
    pub async fn restore(&self, id: Uuid) -> Result<()> {
        let checkpoint = self
            .store
            .get_checkpoint(id)
            .await?
            .ok_or(CheckpointError::NotFound(id))?;

        match checkpoint.state {
            CheckpointState::Restored | CheckpointState::Discarded => {
                tracing::debug!(checkpoint = %id, state = ?checkpoint.state, "restore skipped");
                Ok(())
            }
            CheckpointState::Active => {
                self.vcs
                    .restore(&checkpoint.snapshot_ref, &checkpoint.scope)
                    .await
                    .map_err(|source| CheckpointError::RestoreFailed {
                        checkpoint: id,
                        source,
                    })?;
                self.store
                    .set_checkpoint_state(id, CheckpointState::Restored)
                    .await?;
                tracing::info!(checkpoint = %id, task_id = %checkpoint.task_id, "checkpoint restored");
                Ok(())
            }
        }
    }

    /// Restore, then drop the snapshot. Used on every failure path.
    pub async fn rollback(&self, id: Uuid) -> Result<()> {
        self.restore(id).await?;
        self.discard(id).await
    }

    /// Drop the snapshot without touching the working tree. Used on success.
    pub async fn discard(&self, id: Uuid) -> Result<()> {
        let checkpoint = self
            .store
            .get_checkpoint(id)
            .await?
            .ok_or(CheckpointError::NotFound(id))?;
        if checkpoint.state == CheckpointState::Discarded {
            return Ok(());
        }
        if let Err(e) = self.vcs.discard(&checkpoint.snapshot_ref).await {
            tracing::warn!(checkpoint = %id, error = %e, "failed to discard snapshot");
        }
        self.store
            .set_checkpoint_state(id, CheckpointState::Discarded)
            .await?;
        Ok(())
    }

    /// The instance's checkpoint that has been neither restored nor
    /// discarded, if any.
    pub async fn active_for(&self, instance_id: Uuid) -> Result<Option<Checkpoint>> {
        Ok(self.store.active_checkpoint_for(instance_id).await?)
    }
}
