use std::process::ExitCode;

use anyhow::bail;
use aw_core::lockfile::OrchestratorLockfile;
use aw_core::store::TaskStore;
use aw_core::types::{ExecutionRun, RunStatus};
use aw_daemon::orchestrator::Orchestrator;
use aw_telemetry::metrics::global_metrics;
use tracing::info;
use uuid::Uuid;

use super::{status, stop_on_ctrl_c, Env};

/// `aw run <list>`: plan the list and drive the run to the end.
pub async fn run(env: &Env, list: Uuid, metrics: bool) -> anyhow::Result<ExitCode> {
    let _guard = OrchestratorLockfile::new(&env.db, list, None).acquire_guard()?;
    let store = env.open_store().await?;
    let orchestrator = Orchestrator::new(env.agent_context(store.clone())?, &env.config);
    stop_on_ctrl_c(orchestrator.stop_handle());

    info!(list = %list, workdir = %env.workdir.display(), "starting run");
    let result = orchestrator.run(list).await;
    if metrics {
        print!("{}", global_metrics().export_prometheus());
    }
    finish(store.as_ref(), result?).await
}

/// `aw resume <run>`: recover what the previous orchestrator left behind
/// and keep driving.
pub async fn resume(env: &Env, run_id: Uuid) -> anyhow::Result<ExitCode> {
    let store = env.open_store().await?;
    let Some(previous) = store.get_run(run_id).await? else {
        bail!("run {run_id} not found");
    };
    let _guard =
        OrchestratorLockfile::new(&env.db, previous.task_list_id, Some(run_id)).acquire_guard()?;
    let orchestrator = Orchestrator::new(env.agent_context(store.clone())?, &env.config);
    stop_on_ctrl_c(orchestrator.stop_handle());

    info!(run_id = %run_id, "resuming run");
    let run = orchestrator.resume(run_id).await?;
    finish(store.as_ref(), run).await
}

async fn finish(store: &dyn TaskStore, run: ExecutionRun) -> anyhow::Result<ExitCode> {
    let tasks = store.list_tasks(run.task_list_id).await?;
    print!("{}", status::render(&run, &tasks));
    Ok(exit_code(&run))
}

/// 0 when every task completed, 1 for a failed or stopped run.
pub fn exit_code(run: &ExecutionRun) -> ExitCode {
    match run.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Running | RunStatus::Failed => ExitCode::from(1),
    }
}
