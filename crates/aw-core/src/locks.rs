//! Reader/writer path locks shared by every running task list.
//!
//! All access goes through [`FileLockRegistry`]; there is no ambient
//! "who owns this file" state anywhere else.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::store::StoreError;
use crate::types::{FileLock, LockMode};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock store: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, LockError>;

#[async_trait]
pub trait FileLockRegistry: Send + Sync {
    /// Take `path` for `instance` in `mode`. Returns `false` when another
    /// instance holds it in a conflicting mode. Re-acquiring a lock already
    /// held by `instance` succeeds and upgrades it to exclusive if asked,
    /// provided no other instance shares it.
    async fn acquire(&self, path: &str, instance: Uuid, mode: LockMode) -> Result<bool>;

    /// Release `path` if `instance` holds it. Releasing a lock held by
    /// someone else is a no-op.
    async fn release(&self, path: &str, instance: Uuid) -> Result<()>;

    /// Release every lock held by `instance`, returning the freed paths.
    async fn release_all(&self, instance: Uuid) -> Result<Vec<String>>;

    /// The exclusive holder of `path`, or one of its shared holders.
    async fn holder(&self, path: &str) -> Result<Option<Uuid>>;

    async fn list(&self) -> Result<Vec<FileLock>>;

    /// Release on behalf of a holder that can no longer do it itself.
    async fn force_release(&self, instance: Uuid) -> Result<Vec<String>> {
        let paths = self.release_all(instance).await?;
        if !paths.is_empty() {
            tracing::warn!(instance = %instance, paths = ?paths, "force-released file locks");
        }
        Ok(paths)
    }
}

/// Result of [`acquire_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired(Vec<String>),
    /// Contention; nothing is held on return.
    Deferred { path: String, holder: Option<Uuid> },
}

/// Acquire `requests` in path order, all or nothing. A path requested
/// twice is taken in the stronger of the two modes.
pub async fn acquire_all(
    registry: &dyn FileLockRegistry,
    requests: &[(String, LockMode)],
    instance: Uuid,
) -> Result<LockOutcome> {
    let mut sorted: Vec<(String, LockMode)> = requests.to_vec();
    sorted.sort();
    // Sorting puts Exclusive after Shared for the same path; keep the last.
    sorted.reverse();
    sorted.dedup_by(|a, b| a.0 == b.0);
    sorted.reverse();

    let mut held = Vec::with_capacity(sorted.len());
    for (path, mode) in sorted {
        if registry.acquire(&path, instance, mode).await? {
            held.push(path);
            continue;
        }
        let holder = registry.holder(&path).await?;
        for p in &held {
            registry.release(p, instance).await?;
        }
        tracing::debug!(instance = %instance, path = %path, holder = ?holder, "lock contended");
        return Ok(LockOutcome::Deferred { path, holder });
    }
    Ok(LockOutcome::Acquired(held))
}

/// Process-local registry. Each path maps to its current holders.
#[derive(Debug, Default)]
pub struct InMemoryLockRegistry {
    locks: DashMap<String, Vec<FileLock>>,
}

impl InMemoryLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileLockRegistry for InMemoryLockRegistry {
    async fn acquire(&self, path: &str, instance: Uuid, mode: LockMode) -> Result<bool> {
        let mut holders = self.locks.entry(path.to_string()).or_default();
        let conflict = holders
            .iter()
            .any(|l| l.holder_instance_id != instance && l.mode.blocks(mode));
        if conflict {
            return Ok(false);
        }
        match holders.iter_mut().find(|l| l.holder_instance_id == instance) {
            Some(own) => own.mode = own.mode.max(mode),
            None => holders.push(FileLock {
                path: path.to_string(),
                holder_instance_id: instance,
                mode,
                acquired_at: Utc::now(),
            }),
        }
        Ok(true)
    }

    async fn release(&self, path: &str, instance: Uuid) -> Result<()> {
        if let Some(mut holders) = self.locks.get_mut(path) {
            holders.retain(|l| l.holder_instance_id != instance);
        }
        self.locks.remove_if(path, |_, holders| holders.is_empty());
        Ok(())
    }

    async fn release_all(&self, instance: Uuid) -> Result<Vec<String>> {
        let mut freed = Vec::new();
        for mut entry in self.locks.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|l| l.holder_instance_id != instance);
            if entry.value().len() != before {
                freed.push(entry.key().clone());
            }
        }
        self.locks.retain(|_, holders| !holders.is_empty());
        freed.sort();
        Ok(freed)
    }

    async fn holder(&self, path: &str) -> Result<Option<Uuid>> {
        Ok(self.locks.get(path).and_then(|holders| {
            holders
                .iter()
                .find(|l| l.mode == LockMode::Exclusive)
                .or_else(|| holders.first())
                .map(|l| l.holder_instance_id)
        }))
    }

    async fn list(&self) -> Result<Vec<FileLock>> {
        let mut all: Vec<FileLock> = self
            .locks
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        all.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then(a.acquired_at.cmp(&b.acquired_at))
        });
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use LockMode::{Exclusive, Shared};

    #[tokio::test]
    async fn exclusive_and_reentrant() {
        let reg = InMemoryLockRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(reg.acquire("shared.ts", a, Exclusive).await.unwrap());
        assert!(reg.acquire("shared.ts", a, Exclusive).await.unwrap());
        assert!(!reg.acquire("shared.ts", b, Exclusive).await.unwrap());
        assert!(!reg.acquire("shared.ts", b, Shared).await.unwrap());

        reg.release("shared.ts", b).await.unwrap();
        assert_eq!(reg.holder("shared.ts").await.unwrap(), Some(a));

        reg.release("shared.ts", a).await.unwrap();
        assert!(reg.acquire("shared.ts", b, Exclusive).await.unwrap());
    }

    #[tokio::test]
    async fn readers_share_and_block_writers() {
        let reg = InMemoryLockRegistry::new();
        let reader = Uuid::new_v4();
        let other_reader = Uuid::new_v4();
        let deleter = Uuid::new_v4();

        assert!(reg.acquire("config.ts", reader, Shared).await.unwrap());
        assert!(reg.acquire("config.ts", other_reader, Shared).await.unwrap());
        assert!(!reg.acquire("config.ts", deleter, Exclusive).await.unwrap());
        assert_eq!(reg.list().await.unwrap().len(), 2);

        // A shared holder cannot upgrade while another reader is present.
        assert!(!reg.acquire("config.ts", reader, Exclusive).await.unwrap());

        reg.release("config.ts", reader).await.unwrap();
        reg.release("config.ts", other_reader).await.unwrap();
        assert!(reg.acquire("config.ts", deleter, Exclusive).await.unwrap());
        assert!(!reg.acquire("config.ts", reader, Shared).await.unwrap());
    }

    #[tokio::test]
    async fn acquire_all_rolls_back_on_contention() {
        let reg = InMemoryLockRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(reg.acquire("b.ts", b, Shared).await.unwrap());

        let requests = [
            ("c.ts".to_string(), Exclusive),
            ("a.ts".to_string(), Exclusive),
            ("b.ts".to_string(), Shared),
            ("b.ts".to_string(), Exclusive),
        ];
        let outcome = acquire_all(&reg, &requests, a).await.unwrap();
        assert_eq!(
            outcome,
            LockOutcome::Deferred {
                path: "b.ts".into(),
                holder: Some(b)
            }
        );
        assert_eq!(reg.holder("a.ts").await.unwrap(), None);
        assert_eq!(reg.list().await.unwrap().len(), 1);

        let reads = [("b.ts".to_string(), Shared), ("a.ts".to_string(), Shared)];
        let outcome = acquire_all(&reg, &reads, a).await.unwrap();
        assert_eq!(
            outcome,
            LockOutcome::Acquired(vec!["a.ts".to_string(), "b.ts".to_string()])
        );
    }

    #[tokio::test]
    async fn force_release_frees_everything_for_holder() {
        let reg = InMemoryLockRegistry::new();
        let a = Uuid::new_v4();
        let other = Uuid::new_v4();
        reg.acquire("x", a, Exclusive).await.unwrap();
        reg.acquire("y", a, Shared).await.unwrap();
        reg.acquire("y", other, Shared).await.unwrap();
        reg.acquire("z", other, Exclusive).await.unwrap();

        let freed = reg.force_release(a).await.unwrap();
        assert_eq!(freed, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(reg.holder("y").await.unwrap(), Some(other));
        assert_eq!(reg.holder("z").await.unwrap(), Some(other));
    }
}
