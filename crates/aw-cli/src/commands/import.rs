use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context};
use aw_core::store::TaskStore;
use aw_core::types::{FileImpact, Task, TaskList, ValidationLevel};
use serde::Deserialize;
use uuid::Uuid;

use super::Env;

/// A task list as written by hand or exported from a planner.
///
/// ```json
/// {
///   "name": "checkout",
///   "tasks": [
///     { "displayId": "T-1", "title": "Cart badge",
///       "fileImpacts": [{ "path": "src/cart.tsx", "operation": "UPDATE" }] },
///     { "displayId": "T-2", "title": "Checkout", "dependsOn": ["T-1"] }
///   ]
/// }
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportDocument {
    pub name: String,
    pub tasks: Vec<ImportTask>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportTask {
    pub display_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    /// Display ids of tasks in the same document.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub file_impacts: Vec<FileImpact>,
    #[serde(default)]
    pub validation_command: Option<String>,
    #[serde(default)]
    pub qa_level: Option<ValidationLevel>,
}

/// `aw import <file>`: create the list and its tasks in one go.
pub async fn run(env: &Env, file: &Path) -> anyhow::Result<ExitCode> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let doc: ImportDocument = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", file.display()))?;
    let store = env.open_store().await?;
    let list = import(store.as_ref(), doc).await?;
    println!("{}", list.id);
    Ok(ExitCode::SUCCESS)
}

/// Write the document's list and tasks, then promote the unblocked ones.
pub async fn import(store: &impl TaskStore, doc: ImportDocument) -> anyhow::Result<TaskList> {
    let (list, tasks) = build(doc)?;
    store.create_task_list(&list).await?;
    for task in &tasks {
        store.insert_task(task).await?;
    }
    store.refresh_readiness(list.id).await?;
    tracing::info!(list = %list.id, name = %list.name, tasks = tasks.len(), "task list imported");
    Ok(list)
}

/// Turn the document into store rows, resolving `dependsOn` display ids.
pub fn build(doc: ImportDocument) -> anyhow::Result<(TaskList, Vec<Task>)> {
    let list = TaskList::new(doc.name);

    let mut ids: HashMap<String, Uuid> = HashMap::new();
    for entry in &doc.tasks {
        if ids.insert(entry.display_id.clone(), Uuid::new_v4()).is_some() {
            bail!("duplicate displayId {}", entry.display_id);
        }
    }

    let mut tasks = Vec::with_capacity(doc.tasks.len());
    for entry in doc.tasks {
        let mut task = Task::new(list.id, entry.display_id.clone(), entry.title)
            .with_description(entry.description)
            .with_priority(entry.priority);
        // Ids were assigned above so dependencies can point forward.
        task.id = ids[&entry.display_id];
        for dep in &entry.depends_on {
            let Some(&dep_id) = ids.get(dep) else {
                bail!("{} depends on unknown task {dep}", entry.display_id);
            };
            task = task.with_dependency(dep_id);
        }
        task.file_impacts = entry.file_impacts;
        task.validation_command = entry.validation_command;
        task.qa_level = entry.qa_level;
        tasks.push(task);
    }
    Ok((list, tasks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_core::types::{FileOperation, TaskStatus};

    fn parse(json: &str) -> ImportDocument {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn dependencies_resolve_by_display_id() {
        let doc = parse(
            r#"{
              "name": "checkout",
              "tasks": [
                { "displayId": "T-2", "title": "Checkout", "dependsOn": ["T-1"], "qaLevel": "RELEASE" },
                { "displayId": "T-1", "title": "Cart badge", "priority": 2,
                  "fileImpacts": [{ "path": "src/cart.tsx", "operation": "UPDATE" }] }
              ]
            }"#,
        );
        let (list, tasks) = build(doc).unwrap();
        assert_eq!(list.name, "checkout");
        assert!(tasks.iter().all(|t| t.task_list_id == list.id));
        assert!(tasks[0].depends_on.contains(&tasks[1].id));
        assert_eq!(tasks[0].qa_level, Some(ValidationLevel::Release));
        assert_eq!(tasks[1].priority, 2);
        assert_eq!(tasks[1].file_impacts[0].operation, FileOperation::Update);
        assert_eq!(tasks[1].file_impacts[0].confidence, 1.0);
    }

    #[test]
    fn unknown_and_duplicate_ids_are_rejected() {
        let doc = parse(r#"{"name": "x", "tasks": [{"displayId": "A", "title": "a", "dependsOn": ["B"]}]}"#);
        assert!(build(doc).unwrap_err().to_string().contains("unknown task B"));

        let doc = parse(
            r#"{"name": "x", "tasks": [{"displayId": "A", "title": "a"}, {"displayId": "A", "title": "b"}]}"#,
        );
        assert!(build(doc).unwrap_err().to_string().contains("duplicate displayId A"));
    }

    #[tokio::test]
    async fn import_promotes_tasks_without_dependencies() {
        let store = aw_core::store::SqliteStore::new_in_memory().await.unwrap();
        let doc = parse(
            r#"{"name": "shop", "tasks": [
                {"displayId": "A", "title": "a"},
                {"displayId": "B", "title": "b", "dependsOn": ["A"]}
            ]}"#,
        );

        let list = import(&store, doc).await.unwrap();
        let tasks = store.list_tasks(list.id).await.unwrap();
        let status = |id: &str| tasks.iter().find(|t| t.display_id == id).unwrap().status;
        assert_eq!(tasks.len(), 2);
        assert_eq!(status("A"), TaskStatus::Ready);
        assert_eq!(status("B"), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn malformed_documents_leave_the_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("list.json");
        std::fs::write(&file, r#"{"name": "shop", "tasks": [{"displayId": "A"}]}"#).unwrap();
        let env = Env {
            config: aw_core::config::Config::default(),
            db: dir.path().join("state.db"),
            workdir: dir.path().to_path_buf(),
        };

        let err = run(&env, &file).await.unwrap_err();
        assert!(format!("{err:#}").contains("parsing"));
        assert!(!env.db.exists());
    }
}
