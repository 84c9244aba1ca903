//! Single-orchestrator-per-list guard.
//!
//! Only one orchestrator may drive a given task list, while different lists
//! run side by side against the same state database and contend through its
//! file-lock registry. The guard is a JSON lockfile next to the database
//! (`state.db.<list>.lock`), created with `O_CREAT | O_EXCL` so that exactly
//! one of two racing processes wins. A lockfile whose pid is no longer alive
//! (`kill(pid, 0)`) is treated as stale and removed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LockfileError {
    #[error("orchestrator already running (pid={pid}, run={run_id:?}) for list {list_id} in {store}")]
    AlreadyRunning {
        pid: u32,
        list_id: Uuid,
        run_id: Option<Uuid>,
        store: String,
    },
    #[error("lockfile I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to acquire lockfile after stale cleanup")]
    Contended,
}

/// Contents of the lockfile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorLockfile {
    pub pid: u32,
    pub list_id: Uuid,
    pub run_id: Option<Uuid>,
    pub started_at: String,
    pub store_path: String,
    pub version: String,
}

/// Result of trying to acquire the lockfile.
pub enum AcquireResult {
    /// We created the lockfile; we own it.
    Acquired,
    /// Another live orchestrator holds the lockfile.
    AlreadyRunning(OrchestratorLockfile),
    /// Stale lockfile was cleaned up; retry.
    StaleRemoved,
}

impl OrchestratorLockfile {
    pub fn new(store_path: &Path, list_id: Uuid, run_id: Option<Uuid>) -> Self {
        Self {
            pid: std::process::id(),
            list_id,
            run_id,
            started_at: chrono::Utc::now().to_rfc3339(),
            store_path: store_path.display().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// `<store>.<list>.lock` alongside the database file.
    pub fn path_for(store_path: &Path, list_id: Uuid) -> PathBuf {
        let mut name = store_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.db".into());
        name.push(format!(".{list_id}.lock"));
        store_path.with_file_name(name)
    }

    fn path(&self) -> PathBuf {
        Self::path_for(Path::new(&self.store_path), self.list_id)
    }

    /// Try to exclusively create and write the lockfile.
    pub fn acquire(&self) -> std::io::Result<AcquireResult> {
        let path = self.path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match Self::read(&path) {
                Some(existing) if existing.is_alive() => Ok(AcquireResult::AlreadyRunning(existing)),
                _ => {
                    tracing::info!(path = %path.display(), "removing stale orchestrator lockfile");
                    let _ = std::fs::remove_file(&path);
                    Ok(AcquireResult::StaleRemoved)
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Acquire with one retry after stale cleanup. The returned guard removes
    /// the lockfile when dropped.
    pub fn acquire_guard(self) -> Result<LockfileGuard, LockfileError> {
        for attempt in 0..2 {
            match self.acquire()? {
                AcquireResult::Acquired => {
                    return Ok(LockfileGuard { path: self.path() });
                }
                AcquireResult::AlreadyRunning(existing) => {
                    return Err(LockfileError::AlreadyRunning {
                        pid: existing.pid,
                        list_id: existing.list_id,
                        run_id: existing.run_id,
                        store: existing.store_path,
                    });
                }
                AcquireResult::StaleRemoved if attempt == 0 => continue,
                AcquireResult::StaleRemoved => break,
            }
        }
        Err(LockfileError::Contended)
    }

    /// Read a lockfile. Returns `None` if missing or unparseable.
    pub fn read(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }
}

/// Removes the lockfile on drop.
#[derive(Debug)]
pub struct LockfileGuard {
    path: PathBuf,
}

impl LockfileGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockfileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}
