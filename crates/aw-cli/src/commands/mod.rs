pub mod cancel;
pub mod import;
pub mod run;
pub mod status;
pub mod tasks;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use aw_agents::build_agent::AgentContext;
use aw_bridge::event_bus::EventBus;
use aw_core::config::{expand_home, Config, VcsBackend};
use aw_core::store::SqliteStore;
use aw_core::vcs::{GitVcs, SnapshotVcs, VersionControl};
use aw_harness::provider::{CommandExecutor, ShellValidator};
use aw_harness::shutdown::{ShutdownSignal, StopCause};

/// Resolved settings every command works from: config file plus the global
/// flag overrides.
#[derive(Debug)]
pub struct Env {
    pub config: Config,
    pub db: PathBuf,
    pub workdir: PathBuf,
}

impl Env {
    pub fn resolve(
        config: Option<PathBuf>,
        db: Option<PathBuf>,
        workdir: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let config = match config {
            Some(path) => Config::load_from(&path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => Config::load().context("loading config")?,
        };
        let db = db.unwrap_or_else(|| expand_home(&config.store.path));
        let workdir = match workdir.or_else(|| config.general.workdir.as_deref().map(expand_home)) {
            Some(dir) => dir,
            None => std::env::current_dir().context("resolving the working directory")?,
        };
        Ok(Self {
            config,
            db,
            workdir,
        })
    }

    pub async fn open_store(&self) -> anyhow::Result<Arc<SqliteStore>> {
        let store = SqliteStore::new(&self.db)
            .await
            .with_context(|| format!("opening state database {}", self.db.display()))?;
        Ok(Arc::new(store))
    }

    fn vcs(&self) -> Arc<dyn VersionControl> {
        match self.config.vcs.backend {
            VcsBackend::Git => Arc::new(GitVcs::new(&self.workdir)),
            VcsBackend::Snapshot => Arc::new(SnapshotVcs::new(
                &self.workdir,
                expand_home(&self.config.vcs.snapshot_dir),
                self.config.vcs.exclude.clone(),
            )),
        }
    }

    /// Everything a build agent needs, wired to the configured executor
    /// command and a shell validator in the working tree.
    pub fn agent_context(&self, store: Arc<SqliteStore>) -> anyhow::Result<AgentContext> {
        let command = self
            .config
            .agent
            .executor_command
            .clone()
            .context("agent.executor_command is not configured")?;
        let executor = Arc::new(CommandExecutor::new(
            command,
            &self.workdir,
            self.config.agent.executor_timeout(),
        ));
        Ok(AgentContext::new(
            store.clone(),
            store,
            self.vcs(),
            executor,
            Arc::new(ShellValidator::new(&self.workdir)),
            EventBus::new(),
            self.config.agent.clone(),
            self.workdir.clone(),
        ))
    }
}

/// Trigger `stop` on the first Ctrl-C.
pub fn stop_on_ctrl_c(stop: ShutdownSignal) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("ctrl-c received, stopping the run");
        stop.trigger(StopCause::Interrupted);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[store]\npath = \"/var/lib/aw/state.db\"\n\n[general]\nworkdir = \"/srv/shop\"\n",
        )
        .unwrap();

        let env = Env::resolve(Some(path.clone()), None, None).unwrap();
        assert_eq!(env.db, PathBuf::from("/var/lib/aw/state.db"));
        assert_eq!(env.workdir, PathBuf::from("/srv/shop"));

        let env = Env::resolve(
            Some(path),
            Some(dir.path().join("other.db")),
            Some(dir.path().to_path_buf()),
        )
        .unwrap();
        assert_eq!(env.db, dir.path().join("other.db"));
        assert_eq!(env.workdir, dir.path());
    }

    #[tokio::test]
    async fn missing_executor_command_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let env = Env {
            config: Config::default(),
            db: dir.path().join("state.db"),
            workdir: dir.path().to_path_buf(),
        };
        let store = env.open_store().await.unwrap();
        let err = env.agent_context(store).unwrap_err();
        assert!(err.to_string().contains("executor_command"));
    }
}
