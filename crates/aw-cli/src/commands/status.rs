use std::collections::HashMap;
use std::fmt::Write;
use std::process::ExitCode;

use anyhow::Context;
use aw_core::store::TaskStore;
use aw_core::types::{ExecutionRun, Task};
use uuid::Uuid;

use super::Env;

/// `aw status <run>`: print the run's waves and their tasks.
pub async fn run(env: &Env, run_id: Uuid) -> anyhow::Result<ExitCode> {
    let store = env.open_store().await?;
    let run = store
        .get_run(run_id)
        .await?
        .with_context(|| format!("run {run_id} not found"))?;
    let tasks = store.list_tasks(run.task_list_id).await?;
    print!("{}", render(&run, &tasks));
    Ok(ExitCode::SUCCESS)
}

/// Wave/task table. Tasks outside every wave (blocked before planning,
/// skipped) are listed last.
pub fn render(run: &ExecutionRun, tasks: &[Task]) -> String {
    let by_id: HashMap<Uuid, &Task> = tasks.iter().map(|t| (t.id, t)).collect();
    let mut out = String::new();

    let _ = writeln!(out, "run {}  {:?}", run.id, run.status);
    if let Some(error) = &run.error {
        let _ = writeln!(out, "error: {error}");
    }
    out.push_str(&"-".repeat(60));
    out.push('\n');

    for wave in &run.waves {
        let _ = writeln!(out, "wave {}  {:?}", wave.number, wave.status);
        for id in &wave.task_ids {
            match by_id.get(id) {
                Some(task) => row(&mut out, task),
                None => {
                    let _ = writeln!(out, "  {id}  (deleted)");
                }
            }
        }
    }

    let mut rest: Vec<&Task> = tasks
        .iter()
        .filter(|t| run.wave_of(&t.id).is_none())
        .collect();
    if !rest.is_empty() {
        rest.sort_by(|a, b| a.display_id.cmp(&b.display_id));
        out.push_str("unscheduled\n");
        for task in rest {
            row(&mut out, task);
        }
    }
    out
}

fn row(out: &mut String, task: &Task) {
    let _ = write!(
        out,
        "  {:<12} {:<12} attempts={}  {}",
        task.display_id, task.status.to_string(), task.attempts, task.title
    );
    if let Some(reason) = &task.reason {
        let _ = write!(out, "  ({reason})");
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_core::types::{TaskStatus, Wave, WaveStatus};

    #[test]
    fn waves_then_unscheduled() {
        let list = Uuid::new_v4();
        let mut a = Task::new(list, "T-1", "Cart badge");
        a.status = TaskStatus::Completed;
        a.attempts = 1;
        let mut b = Task::new(list, "T-2", "Checkout");
        b.status = TaskStatus::Failed;
        b.reason = Some("qa failed: Tests".into());
        let mut c = Task::new(list, "T-3", "Receipt");
        c.status = TaskStatus::Blocked;

        let mut run = ExecutionRun::new(list);
        let mut wave = Wave::new(0, vec![a.id, b.id]);
        wave.status = WaveStatus::Completed;
        run.waves.push(wave);

        let text = render(&run, &[a, b, c]);
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].ends_with("Running"));
        assert_eq!(lines[2], "wave 0  Completed");
        assert!(lines[3].contains("T-1") && lines[3].contains("completed"));
        assert!(lines[4].ends_with("(qa failed: Tests)"));
        assert_eq!(lines[5], "unscheduled");
        assert!(lines[6].contains("T-3") && lines[6].contains("blocked"));
    }
}
