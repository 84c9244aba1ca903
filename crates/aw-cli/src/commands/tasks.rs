use std::collections::HashMap;
use std::process::ExitCode;

use anyhow::Context;
use aw_core::store::TaskStore;
use uuid::Uuid;

use super::Env;

/// `aw tasks <list>`: every task of the list with its dependencies.
pub async fn run(env: &Env, list_id: Uuid) -> anyhow::Result<ExitCode> {
    let store = env.open_store().await?;
    let list = store
        .get_task_list(list_id)
        .await?
        .with_context(|| format!("task list {list_id} not found"))?;
    let tasks = store.list_tasks(list_id).await?;
    let names: HashMap<Uuid, &str> = tasks
        .iter()
        .map(|t| (t.id, t.display_id.as_str()))
        .collect();

    println!("{} ({} tasks, revision {})", list.name, tasks.len(), list.revision);
    for task in &tasks {
        let deps: Vec<&str> = task
            .depends_on
            .iter()
            .map(|d| names.get(d).copied().unwrap_or("?"))
            .collect();
        println!(
            "  {:<12} {:<12} p{:<3} deps=[{}]  {}",
            task.display_id,
            task.status.to_string(),
            task.priority,
            deps.join(", "),
            task.title
        );
    }
    Ok(ExitCode::SUCCESS)
}
