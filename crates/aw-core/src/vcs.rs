use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use uuid::Uuid;
use walkdir::WalkDir;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by a [`VersionControl`] backend.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// A git command returned a non-zero exit code. `stderr` is captured.
    #[error("`git {cmd}` failed: {stderr}")]
    Command { cmd: String, stderr: String },

    /// The snapshot reference is unknown to the backend.
    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walking working tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("snapshot manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, VcsError>;

/// Snapshot/restore/commit over part of a working tree.
///
/// Every operation takes a `scope`: workdir-relative paths, each naming a
/// file or a directory and everything beneath it. Nothing outside the scope
/// is read or written, so agents sharing one tree only ever touch their own
/// paths. An empty scope touches nothing.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Capture `scope`. `label` is unique per call; the returned reference
    /// is opaque to callers.
    async fn snapshot(&self, label: &str, scope: &[String]) -> Result<String>;

    /// Make `scope` byte-identical to `reference`, including deleting files
    /// created inside it after the snapshot was taken.
    async fn restore(&self, reference: &str, scope: &[String]) -> Result<()>;

    /// Record the current state of `scope`. `None` when there was nothing to
    /// commit or the backend has no history.
    async fn commit(&self, message: &str, scope: &[String]) -> Result<Option<String>>;

    /// Drop a snapshot that is no longer needed.
    async fn discard(&self, reference: &str) -> Result<()>;
}

/// Whether `rel` is `entry` or lies beneath it for some entry of `scope`.
pub fn in_scope(rel: &str, scope: &[String]) -> bool {
    scope.iter().any(|entry| {
        rel == entry
            || rel
                .strip_prefix(entry.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Remove directories left empty by deleting `file`, stopping at `root`.
fn prune_empty_parents(root: &Path, file: &Path) {
    let mut dir = file.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        if std::fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

// ---------------------------------------------------------------------------
// GitVcs
// ---------------------------------------------------------------------------

const CHECKPOINT_REF_PREFIX: &str = "refs/auto-wave/checkpoints/";

/// Git-backed snapshots. Checkpoints are commits reachable only from
/// `refs/auto-wave/checkpoints/*` whose tree holds just the scoped paths;
/// they are built through a scratch index so the user's staging area is
/// never touched. Ignored files are never captured.
#[derive(Debug, Clone)]
pub struct GitVcs {
    workdir: PathBuf,
    /// Serializes commits through the shared index.
    index_lock: Arc<tokio::sync::Mutex<()>>,
}

impl GitVcs {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            index_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    async fn git(&self, args: &[&str], index: Option<&Path>) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        if let Some(index) = index {
            cmd.env("GIT_INDEX_FILE", index);
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(VcsError::Command {
                cmd: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn scratch_index() -> PathBuf {
        std::env::temp_dir().join(format!("aw-index-{}", Uuid::new_v4()))
    }

    /// Scope entries `git add` can stage: present on disk (or, with
    /// `tracked`, known to the real index) and not ignored.
    async fn pathspec(&self, scope: &[String], tracked: bool) -> Vec<String> {
        let mut out = Vec::with_capacity(scope.len());
        for entry in scope {
            let on_disk = std::fs::symlink_metadata(self.workdir.join(entry)).is_ok();
            let known = on_disk
                || (tracked
                    && self
                        .git(&["ls-files", "--error-unmatch", "--", entry], None)
                        .await
                        .is_ok());
            if !known {
                continue;
            }
            // check-ignore exits zero only for ignored paths.
            if on_disk
                && self
                    .git(&["check-ignore", "-q", "--", entry], None)
                    .await
                    .is_ok()
            {
                continue;
            }
            out.push(entry.clone());
        }
        out
    }

    /// Tree object holding only `scope`, built in a scratch index.
    async fn scoped_tree(&self, scope: &[String]) -> Result<String> {
        let paths = self.pathspec(scope, false).await;
        let index = Self::scratch_index();
        let result = async {
            if !paths.is_empty() {
                let mut args = vec!["add", "-A", "--"];
                args.extend(paths.iter().map(String::as_str));
                self.git(&args, Some(&index)).await?;
            }
            self.git(&["write-tree"], Some(&index)).await
        }
        .await;
        let _ = std::fs::remove_file(&index);
        result
    }

    async fn has_identity(&self) -> bool {
        self.git(&["config", "user.email"], None).await.is_ok()
    }
}

#[async_trait]
impl VersionControl for GitVcs {
    async fn snapshot(&self, label: &str, scope: &[String]) -> Result<String> {
        let tree = self.scoped_tree(scope).await?;
        let message = format!("auto-wave checkpoint {label}");

        let mut cmd = Command::new("git");
        cmd.args(["commit-tree", &tree, "-m", &message])
            .current_dir(&self.workdir)
            .env("GIT_AUTHOR_NAME", "auto-wave")
            .env("GIT_AUTHOR_EMAIL", "auto-wave@localhost")
            .env("GIT_COMMITTER_NAME", "auto-wave")
            .env("GIT_COMMITTER_EMAIL", "auto-wave@localhost");
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(VcsError::Command {
                cmd: "commit-tree".into(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let reference = format!("{CHECKPOINT_REF_PREFIX}{label}");
        self.git(&["update-ref", &reference, &commit], None).await?;
        tracing::debug!(reference = %reference, commit = %commit, "git checkpoint taken");
        Ok(reference)
    }

    async fn restore(&self, reference: &str, scope: &[String]) -> Result<()> {
        let target = format!("{reference}^{{tree}}");
        self.git(&["rev-parse", "--verify", &target], None)
            .await
            .map_err(|_| VcsError::NotFound(reference.to_string()))?;
        if scope.is_empty() {
            return Ok(());
        }

        let current = self.scoped_tree(scope).await?;
        let added = self
            .git(
                &[
                    "diff-tree",
                    "-r",
                    "-z",
                    "--name-only",
                    "--no-renames",
                    "--diff-filter=A",
                    &target,
                    &current,
                ],
                None,
            )
            .await?;
        for rel in added
            .split('\0')
            .filter(|s| !s.is_empty() && in_scope(s, scope))
        {
            let path = self.workdir.join(rel);
            match std::fs::remove_file(&path) {
                Ok(()) => prune_empty_parents(&self.workdir, &path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // The target tree holds only scoped paths, so checking it out
        // leaves the rest of the tree alone.
        let index = Self::scratch_index();
        let result = async {
            self.git(&["read-tree", &target], Some(&index)).await?;
            self.git(&["checkout-index", "-a", "-f"], Some(&index)).await
        }
        .await;
        let _ = std::fs::remove_file(&index);
        result?;
        tracing::debug!(reference = %reference, "git checkpoint restored");
        Ok(())
    }

    async fn commit(&self, message: &str, scope: &[String]) -> Result<Option<String>> {
        let _index = self.index_lock.lock().await;
        let paths = self.pathspec(scope, true).await;
        if paths.is_empty() {
            return Ok(None);
        }
        let with_paths = |head: &[&'static str]| -> Vec<String> {
            head.iter()
                .map(|s| s.to_string())
                .chain(std::iter::once("--".to_string()))
                .chain(paths.iter().cloned())
                .collect()
        };

        let add = with_paths(&["add", "-A"]);
        self.git(&add.iter().map(String::as_str).collect::<Vec<_>>(), None)
            .await?;
        let diff = with_paths(&["diff", "--cached", "--quiet"]);
        if self
            .git(&diff.iter().map(String::as_str).collect::<Vec<_>>(), None)
            .await
            .is_ok()
        {
            return Ok(None);
        }

        // A pathspec commit leaves whatever else is staged out of it.
        let mut cmd = Command::new("git");
        cmd.args(["commit", "-q", "-m", message, "--"])
            .args(&paths)
            .current_dir(&self.workdir);
        if !self.has_identity().await {
            cmd.env("GIT_AUTHOR_NAME", "auto-wave")
                .env("GIT_AUTHOR_EMAIL", "auto-wave@localhost")
                .env("GIT_COMMITTER_NAME", "auto-wave")
                .env("GIT_COMMITTER_EMAIL", "auto-wave@localhost");
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(VcsError::Command {
                cmd: "commit".into(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let sha = self.git(&["rev-parse", "HEAD"], None).await?;
        Ok(Some(sha))
    }

    async fn discard(&self, reference: &str) -> Result<()> {
        self.git(&["update-ref", "-d", reference], None).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SnapshotVcs
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    files: BTreeSet<String>,
    dirs: BTreeSet<String>,
    #[serde(default)]
    links: BTreeMap<String, String>,
}

/// Plain directory copies of the working tree. Needs no repository, so it
/// also covers trees that are not under git.
#[derive(Debug, Clone)]
pub struct SnapshotVcs {
    workdir: PathBuf,
    snapshot_dir: PathBuf,
    exclude: Vec<String>,
}

impl SnapshotVcs {
    pub fn new(
        workdir: impl Into<PathBuf>,
        snapshot_dir: impl Into<PathBuf>,
        exclude: Vec<String>,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            snapshot_dir: snapshot_dir.into(),
            exclude,
        }
    }

    fn is_excluded(&self, rel: &Path) -> bool {
        let first = rel
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().to_string());
        match first {
            Some(name) => self.exclude.iter().any(|e| *e == name),
            None => false,
        }
    }

    /// Every entry under `scope` relative to the workdir, honouring the
    /// exclusion list and skipping the snapshot directory itself.
    fn scan(&self, scope: &[String]) -> Result<Manifest> {
        let mut manifest = Manifest::default();
        for entry in scope {
            let root = self.workdir.join(entry);
            if self.is_excluded(Path::new(entry)) || std::fs::symlink_metadata(&root).is_err() {
                continue;
            }
            let walker = WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| {
                    let rel = e.path().strip_prefix(&self.workdir).unwrap_or(e.path());
                    !self.is_excluded(rel) && !e.path().starts_with(&self.snapshot_dir)
                });
            for item in walker {
                let item = item?;
                let rel = relative(&self.workdir, item.path());
                let ft = item.file_type();
                if ft.is_symlink() {
                    let target = std::fs::read_link(item.path())?;
                    manifest
                        .links
                        .insert(rel, target.to_string_lossy().to_string());
                } else if ft.is_dir() {
                    manifest.dirs.insert(rel);
                } else {
                    manifest.files.insert(rel);
                }
            }
        }
        Ok(manifest)
    }

    fn snapshot_blocking(&self, label: &str, scope: &[String]) -> Result<String> {
        let root = self.snapshot_dir.join(label);
        let files_root = root.join("files");
        std::fs::create_dir_all(&files_root)?;

        let manifest = self.scan(scope)?;
        for dir in &manifest.dirs {
            std::fs::create_dir_all(files_root.join(dir))?;
        }
        for file in &manifest.files {
            let dest = files_root.join(file);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(self.workdir.join(file), dest)?;
        }
        std::fs::write(
            root.join("manifest.json"),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        Ok(label.to_string())
    }

    fn restore_blocking(&self, reference: &str, scope: &[String]) -> Result<()> {
        let root = self.snapshot_dir.join(reference);
        let manifest_path = root.join("manifest.json");
        if !manifest_path.exists() {
            return Err(VcsError::NotFound(reference.to_string()));
        }
        let wanted: Manifest = serde_json::from_slice(&std::fs::read(&manifest_path)?)?;
        let files_root = root.join("files");

        // Deepest entries first so directories are empty when reached.
        let mut current: Vec<(String, bool)> = {
            let scanned = self.scan(scope)?;
            scanned
                .files
                .into_iter()
                .chain(scanned.links.into_keys())
                .map(|f| (f, false))
                .chain(scanned.dirs.into_iter().map(|d| (d, true)))
                .collect()
        };
        current.sort_by(|a, b| b.0.cmp(&a.0));

        for (rel, is_dir) in current {
            let path = self.workdir.join(&rel);
            if is_dir {
                if !wanted.dirs.contains(&rel) && path.exists() {
                    std::fs::remove_dir_all(&path)?;
                    prune_empty_parents(&self.workdir, &path);
                }
            } else if !wanted.files.contains(&rel) || wanted.links.contains_key(&rel) {
                match std::fs::remove_file(&path) {
                    Ok(()) => prune_empty_parents(&self.workdir, &path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        for dir in &wanted.dirs {
            std::fs::create_dir_all(self.workdir.join(dir))?;
        }
        for file in &wanted.files {
            let dest = self.workdir.join(file);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(files_root.join(file), dest)?;
        }
        #[cfg(unix)]
        for (rel, target) in &wanted.links {
            let path = self.workdir.join(rel);
            if std::fs::symlink_metadata(&path).is_err() {
                std::os::unix::fs::symlink(target, &path)?;
            }
        }
        Ok(())
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[async_trait]
impl VersionControl for SnapshotVcs {
    async fn snapshot(&self, label: &str, scope: &[String]) -> Result<String> {
        let this = self.clone();
        let label = label.to_string();
        let scope = scope.to_vec();
        tokio::task::spawn_blocking(move || this.snapshot_blocking(&label, &scope))
            .await
            .map_err(|e| VcsError::Join(e.to_string()))?
    }

    async fn restore(&self, reference: &str, scope: &[String]) -> Result<()> {
        let this = self.clone();
        let reference = reference.to_string();
        let scope = scope.to_vec();
        tokio::task::spawn_blocking(move || this.restore_blocking(&reference, &scope))
            .await
            .map_err(|e| VcsError::Join(e.to_string()))?
    }

    async fn commit(&self, _message: &str, _scope: &[String]) -> Result<Option<String>> {
        Ok(None)
    }

    async fn discard(&self, reference: &str) -> Result<()> {
        let root = self.snapshot_dir.join(reference);
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
