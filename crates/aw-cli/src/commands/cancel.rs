use std::process::ExitCode;

use anyhow::Context;
use aw_core::store::TaskStore;
use aw_core::types::RunStatus;
use uuid::Uuid;

use super::Env;

/// `aw cancel <run>`: set the run's stop flag. The orchestrator driving the
/// run picks it up on its next tick and lets in-flight attempts wind down.
pub async fn run(env: &Env, run_id: Uuid) -> anyhow::Result<ExitCode> {
    let store = env.open_store().await?;
    let run = store
        .get_run(run_id)
        .await?
        .with_context(|| format!("run {run_id} not found"))?;
    if run.status != RunStatus::Running {
        println!("run {run_id} already finished ({:?})", run.status);
        return Ok(ExitCode::SUCCESS);
    }
    store.request_stop(run_id).await?;
    tracing::info!(run_id = %run_id, "stop requested");
    println!("stop requested for run {run_id}");
    Ok(ExitCode::SUCCESS)
}
