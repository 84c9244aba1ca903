use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::locks::{self, FileLockRegistry};
use crate::types::{
    AgentStatus, BuildAgentInstance, Checkpoint, CheckpointState, ExecutionRun, FileImpact,
    FileLock, FixReference, FixTaskSpec, LockMode, QaValidationReport, RunStatus, Task, TaskList,
    TaskMeta, TaskStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite connection: {0}")]
    Connection(#[from] tokio_rusqlite::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("task {task}: invalid transition {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("unknown state {value:?} in {column}")]
    UnknownState { column: &'static str, value: String },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable record of task lists, tasks, runs, agents, checkpoints and QA
/// reports. Status transitions are validated and applied atomically.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task_list(&self, list: &TaskList) -> Result<()>;
    async fn get_task_list(&self, id: Uuid) -> Result<Option<TaskList>>;
    async fn list_revision(&self, list_id: Uuid) -> Result<u64>;

    async fn insert_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;
    async fn list_tasks(&self, list_id: Uuid) -> Result<Vec<Task>>;
    async fn get_ready_tasks(&self, list_id: Uuid) -> Result<Vec<Task>>;

    /// Validate `current -> status` and apply `meta` in one transaction.
    /// Re-asserting the current status only applies `meta`.
    async fn update_task_status(&self, id: Uuid, status: TaskStatus, meta: TaskMeta)
        -> Result<Task>;

    /// Add an impact and bump the list's graph revision.
    async fn record_file_impact(&self, task_id: Uuid, impact: FileImpact) -> Result<()>;
    /// Replace the dependency set and bump the list's graph revision.
    async fn set_dependencies(&self, task_id: Uuid, deps: BTreeSet<Uuid>) -> Result<()>;

    /// Create a fix task for a QA failure, rewire the original's dependents
    /// onto it, and bump the graph revision.
    async fn create_fix_task(&self, spec: FixTaskSpec) -> Result<Task>;

    /// Re-derive `pending`/`ready` from dependency statuses. Returns the
    /// tasks whose status changed.
    async fn refresh_readiness(&self, list_id: Uuid) -> Result<Vec<Task>>;

    async fn create_run(&self, run: &ExecutionRun) -> Result<()>;
    /// Persist everything except the stop flag, which only `request_stop`
    /// writes.
    async fn save_run(&self, run: &ExecutionRun) -> Result<()>;
    async fn get_run(&self, id: Uuid) -> Result<Option<ExecutionRun>>;
    async fn list_runs(&self) -> Result<Vec<ExecutionRun>>;
    async fn request_stop(&self, run_id: Uuid) -> Result<()>;
    async fn is_stop_requested(&self, run_id: Uuid) -> Result<bool>;

    async fn upsert_agent(&self, agent: &BuildAgentInstance) -> Result<()>;
    async fn get_agent(&self, id: Uuid) -> Result<Option<BuildAgentInstance>>;
    async fn list_agents(&self, run_id: Uuid) -> Result<Vec<BuildAgentInstance>>;
    /// Bump `last_heartbeat_at` unless the instance is already terminal.
    async fn record_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
    async fn set_agent_status(&self, id: Uuid, status: AgentStatus) -> Result<()>;
    /// Compare-and-set into `stuck` from any non-terminal status. Only one
    /// caller ever observes `true` for a given instance.
    async fn mark_agent_stuck(&self, id: Uuid) -> Result<bool>;

    async fn record_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn get_checkpoint(&self, id: Uuid) -> Result<Option<Checkpoint>>;
    async fn active_checkpoint_for(&self, instance_id: Uuid) -> Result<Option<Checkpoint>>;
    async fn set_checkpoint_state(&self, id: Uuid, state: CheckpointState) -> Result<()>;

    async fn insert_report(&self, report: &QaValidationReport) -> Result<()>;
    async fn get_report(&self, id: Uuid) -> Result<Option<QaValidationReport>>;
    async fn reports_for_task(&self, task_id: Uuid) -> Result<Vec<QaValidationReport>>;
}

// ---------------------------------------------------------------------------
// helpers – enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> Result<String> {
    let s = serde_json::to_string(val)?;
    Ok(s.trim_matches('"').to_string())
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(column: &'static str, raw: &str) -> Result<T> {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).map_err(|_| StoreError::UnknownState {
        column,
        value: raw.to_string(),
    })
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("uuid {raw:?}: {e}")))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

/// Async SQLite-backed task store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corrupt(format!("create {parent:?}: {e}")))?;
            }
        }
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS task_lists (
                        id          TEXT PRIMARY KEY,
                        name        TEXT NOT NULL,
                        revision    INTEGER NOT NULL DEFAULT 0,
                        created_at  TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS tasks (
                        id          TEXT PRIMARY KEY,
                        list_id     TEXT NOT NULL,
                        display_id  TEXT NOT NULL,
                        status      TEXT NOT NULL,
                        priority    INTEGER NOT NULL DEFAULT 0,
                        created_at  TEXT NOT NULL,
                        updated_at  TEXT NOT NULL,
                        data        TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_list_status ON tasks(list_id, status);

                    CREATE TABLE IF NOT EXISTS runs (
                        id              TEXT PRIMARY KEY,
                        list_id         TEXT NOT NULL,
                        status          TEXT NOT NULL,
                        stop_requested  INTEGER NOT NULL DEFAULT 0,
                        started_at      TEXT NOT NULL,
                        data            TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS agents (
                        id                 TEXT PRIMARY KEY,
                        run_id             TEXT NOT NULL,
                        wave_number        INTEGER NOT NULL,
                        task_id            TEXT NOT NULL,
                        status             TEXT NOT NULL,
                        attempt            INTEGER NOT NULL,
                        spawned_at         TEXT NOT NULL,
                        last_heartbeat_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_agents_run ON agents(run_id);

                    CREATE TABLE IF NOT EXISTS file_locks (
                        path         TEXT NOT NULL,
                        holder       TEXT NOT NULL,
                        mode         TEXT NOT NULL,
                        acquired_at  TEXT NOT NULL,
                        PRIMARY KEY (path, holder)
                    );

                    CREATE INDEX IF NOT EXISTS idx_file_locks_holder ON file_locks(holder);

                    CREATE TABLE IF NOT EXISTS checkpoints (
                        id            TEXT PRIMARY KEY,
                        task_id       TEXT NOT NULL,
                        instance_id   TEXT NOT NULL,
                        snapshot_ref  TEXT NOT NULL,
                        scope         TEXT NOT NULL,
                        state         TEXT NOT NULL,
                        created_at    TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_checkpoints_instance ON checkpoints(instance_id);

                    CREATE TABLE IF NOT EXISTS qa_reports (
                        id          TEXT PRIMARY KEY,
                        task_id     TEXT NOT NULL,
                        status      TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        data        TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_qa_reports_task ON qa_reports(task_id);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Synchronous row helpers, run inside `Connection::call`
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str = "status, data";

fn row_to_task(status: &str, data: &str) -> Result<Task> {
    let mut task: Task = serde_json::from_str(data)?;
    task.status = enum_from_sql("tasks.status", status)?;
    Ok(task)
}

fn load_task(conn: &rusqlite::Connection, id: Uuid) -> Result<Option<Task>> {
    let row: Option<(String, String)> = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            rusqlite::params![id.to_string()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    row.map(|(s, d)| row_to_task(&s, &d)).transpose()
}

fn require_task(conn: &rusqlite::Connection, id: Uuid) -> Result<Task> {
    load_task(conn, id)?.ok_or(StoreError::NotFound {
        kind: "task",
        id: id.to_string(),
    })
}

fn load_list_tasks(conn: &rusqlite::Connection, list_id: Uuid) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE list_id = ?1 ORDER BY created_at, display_id"
    ))?;
    let rows = stmt.query_map(rusqlite::params![list_id.to_string()], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (status, data) = row?;
        out.push(row_to_task(&status, &data)?);
    }
    Ok(out)
}

fn write_task(conn: &rusqlite::Connection, task: &Task) -> Result<()> {
    let data = serde_json::to_string(task)?;
    conn.execute(
        "INSERT INTO tasks (id, list_id, display_id, status, priority, created_at, updated_at, data)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
         ON CONFLICT(id) DO UPDATE SET
            display_id=excluded.display_id, status=excluded.status,
            priority=excluded.priority, updated_at=excluded.updated_at, data=excluded.data",
        rusqlite::params![
            task.id.to_string(),
            task.task_list_id.to_string(),
            task.display_id,
            enum_to_sql(&task.status)?,
            task.priority,
            task.created_at.to_rfc3339(),
            task.updated_at.to_rfc3339(),
            data,
        ],
    )?;
    Ok(())
}

fn bump_revision(conn: &rusqlite::Connection, list_id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE task_lists SET revision = revision + 1 WHERE id = ?1",
        rusqlite::params![list_id.to_string()],
    )?;
    Ok(())
}

/// Status of every id in `ids`, looked up across all lists.
fn dependency_statuses(
    conn: &rusqlite::Connection,
    known: &HashMap<Uuid, TaskStatus>,
    ids: impl Iterator<Item = Uuid>,
) -> Result<HashMap<Uuid, Option<TaskStatus>>> {
    let mut out = HashMap::new();
    for id in ids {
        let status = match known.get(&id) {
            Some(s) => Some(*s),
            None => load_task(conn, id)?.map(|t| t.status),
        };
        out.insert(id, status);
    }
    Ok(out)
}

fn deps_satisfied(task: &Task, statuses: &HashMap<Uuid, Option<TaskStatus>>) -> bool {
    task.depends_on.iter().all(|d| {
        statuses
            .get(d)
            .copied()
            .flatten()
            .is_some_and(|s| s.satisfies_dependency())
    })
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<[String; 8]> {
    Ok([
        row.get(0)?,
        row.get(1)?,
        row.get::<_, i64>(2)?.to_string(),
        row.get(3)?,
        row.get(4)?,
        row.get::<_, i64>(5)?.to_string(),
        row.get(6)?,
        row.get(7)?,
    ])
}

fn agent_from_columns(c: [String; 8]) -> Result<BuildAgentInstance> {
    let number = |s: &str| -> Result<u32> {
        s.parse()
            .map_err(|e| StoreError::Corrupt(format!("integer {s:?}: {e}")))
    };
    Ok(BuildAgentInstance {
        id: parse_uuid(&c[0])?,
        execution_run_id: parse_uuid(&c[1])?,
        wave_number: number(&c[2])?,
        task_id: parse_uuid(&c[3])?,
        status: enum_from_sql("agents.status", &c[4])?,
        attempt: number(&c[5])?,
        spawned_at: parse_time(&c[6])?,
        last_heartbeat_at: parse_time(&c[7])?,
    })
}

const AGENT_COLUMNS: &str =
    "id, run_id, wave_number, task_id, status, attempt, spawned_at, last_heartbeat_at";

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<[String; 7]> {
    Ok([
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ])
}

fn checkpoint_from_columns(c: [String; 7]) -> Result<Checkpoint> {
    Ok(Checkpoint {
        id: parse_uuid(&c[0])?,
        task_id: parse_uuid(&c[1])?,
        instance_id: parse_uuid(&c[2])?,
        snapshot_ref: c[3].clone(),
        scope: serde_json::from_str(&c[4])?,
        state: enum_from_sql("checkpoints.state", &c[5])?,
        created_at: parse_time(&c[6])?,
    })
}

const CHECKPOINT_COLUMNS: &str =
    "id, task_id, instance_id, snapshot_ref, scope, state, created_at";

fn row_to_run(status: &str, stop: i64, data: &str) -> Result<ExecutionRun> {
    let mut run: ExecutionRun = serde_json::from_str(data)?;
    run.status = enum_from_sql::<RunStatus>("runs.status", status)?;
    run.stop_requested = stop != 0;
    Ok(run)
}

fn fix_description(original: &Task, spec: &FixTaskSpec) -> String {
    let mut text = format!(
        "QA validation of {} failed (report {}).\n\n## Failed checks\n",
        original.display_id, spec.report_id
    );
    for check in &spec.failed_checks {
        text.push_str(&format!("- {check}\n"));
    }
    if !spec.suggestions.is_empty() {
        text.push_str("\n## Remediation\n");
        for s in &spec.suggestions {
            text.push_str(&format!("- {s}\n"));
        }
    }
    if !original.description.is_empty() {
        text.push_str("\n## Original specification\n");
        text.push_str(&original.description);
        text.push('\n');
    }
    text
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task_list(&self, list: &TaskList) -> Result<()> {
        let list = list.clone();
        self.conn
            .call(move |conn| {
                Ok(conn
                    .execute(
                        "INSERT INTO task_lists (id, name, revision, created_at)
                         VALUES (?1,?2,?3,?4)
                         ON CONFLICT(id) DO UPDATE SET name=excluded.name",
                        rusqlite::params![
                            list.id.to_string(),
                            list.name,
                            list.revision as i64,
                            list.created_at.to_rfc3339()
                        ],
                    )
                    .map(|_| ()))
            })
            .await??;
        Ok(())
    }

    async fn get_task_list(&self, id: Uuid) -> Result<Option<TaskList>> {
        let row: Option<(String, i64, String)> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT name, revision, created_at FROM task_lists WHERE id = ?1",
                        rusqlite::params![id.to_string()],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                    )
                    .optional()?)
            })
            .await?;
        row.map(|(name, revision, created_at)| {
            Ok(TaskList {
                id,
                name,
                revision: revision as u64,
                created_at: parse_time(&created_at)?,
            })
        })
        .transpose()
    }

    async fn list_revision(&self, list_id: Uuid) -> Result<u64> {
        self.get_task_list(list_id)
            .await?
            .map(|l| l.revision)
            .ok_or(StoreError::NotFound {
                kind: "task list",
                id: list_id.to_string(),
            })
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        let task = task.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let res = write_task(&tx, &task).and_then(|_| bump_revision(&tx, task.task_list_id));
                if res.is_ok() {
                    tx.commit()?;
                }
                Ok(res)
            })
            .await?
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        self.conn.call(move |conn| Ok(load_task(conn, id))).await?
    }

    async fn list_tasks(&self, list_id: Uuid) -> Result<Vec<Task>> {
        self.conn
            .call(move |conn| Ok(load_list_tasks(conn, list_id)))
            .await?
    }

    async fn get_ready_tasks(&self, list_id: Uuid) -> Result<Vec<Task>> {
        let mut tasks = self.list_tasks(list_id).await?;
        tasks.retain(|t| t.status == TaskStatus::Ready);
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        meta: TaskMeta,
    ) -> Result<Task> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let res = (|| -> Result<Task> {
                    let mut task = require_task(&tx, id)?;
                    if task.status != status && !task.status.can_transition_to(&status) {
                        return Err(StoreError::InvalidTransition {
                            task: task.display_id.clone(),
                            from: task.status,
                            to: status,
                        });
                    }
                    task.status = status;
                    meta.apply(&mut task);
                    task.updated_at = Utc::now();
                    write_task(&tx, &task)?;
                    Ok(task)
                })();
                if res.is_ok() {
                    tx.commit()?;
                }
                Ok(res)
            })
            .await?
    }

    async fn record_file_impact(&self, task_id: Uuid, impact: FileImpact) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let res = (|| -> Result<()> {
                    let mut task = require_task(&tx, task_id)?;
                    let path = impact.normalized_path();
                    task.file_impacts
                        .retain(|i| !(i.normalized_path() == path && i.operation == impact.operation));
                    task.file_impacts.push(impact);
                    task.updated_at = Utc::now();
                    write_task(&tx, &task)?;
                    bump_revision(&tx, task.task_list_id)
                })();
                if res.is_ok() {
                    tx.commit()?;
                }
                Ok(res)
            })
            .await?
    }

    async fn set_dependencies(&self, task_id: Uuid, deps: BTreeSet<Uuid>) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let res = (|| -> Result<()> {
                    let mut task = require_task(&tx, task_id)?;
                    task.depends_on = deps;
                    task.updated_at = Utc::now();
                    write_task(&tx, &task)?;
                    bump_revision(&tx, task.task_list_id)
                })();
                if res.is_ok() {
                    tx.commit()?;
                }
                Ok(res)
            })
            .await?
    }

    async fn create_fix_task(&self, spec: FixTaskSpec) -> Result<Task> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let res = (|| -> Result<Task> {
                    let mut original = require_task(&tx, spec.original_task_id)?;
                    let generation = original.fix_generation() + 1;

                    let mut fix = Task::new(
                        original.task_list_id,
                        format!("{}-fix{}", original.display_id, generation),
                        format!(
                            "Fix QA failures in {}: {}",
                            original.display_id,
                            spec.failed_checks.join(", ")
                        ),
                    );
                    fix.description = fix_description(&original, &spec);
                    fix.depends_on = original.depends_on.clone();
                    fix.file_impacts = original.file_impacts.clone();
                    fix.priority = original.priority;
                    fix.validation_command = original.validation_command.clone();
                    fix.qa_level = original.qa_level;
                    fix.fix_for = Some(FixReference {
                        original_task_id: original.id,
                        report_id: spec.report_id,
                        failed_checks: spec.failed_checks.clone(),
                        generation,
                    });

                    let siblings = load_list_tasks(&tx, original.task_list_id)?;
                    let known: HashMap<Uuid, TaskStatus> =
                        siblings.iter().map(|t| (t.id, t.status)).collect();
                    let statuses =
                        dependency_statuses(&tx, &known, fix.depends_on.iter().copied())?;
                    if deps_satisfied(&fix, &statuses) {
                        fix.status = TaskStatus::Ready;
                    }
                    write_task(&tx, &fix)?;

                    for mut dependent in siblings
                        .into_iter()
                        .filter(|t| t.depends_on.contains(&original.id))
                    {
                        dependent.depends_on.remove(&original.id);
                        dependent.depends_on.insert(fix.id);
                        if dependent.status == TaskStatus::Blocked
                            || dependent.status == TaskStatus::Ready
                        {
                            dependent.status = TaskStatus::Pending;
                            dependent.reason = None;
                        }
                        dependent.updated_at = Utc::now();
                        write_task(&tx, &dependent)?;
                    }

                    original.superseded_by = Some(fix.id);
                    original.updated_at = Utc::now();
                    write_task(&tx, &original)?;
                    bump_revision(&tx, original.task_list_id)?;
                    Ok(fix)
                })();
                if res.is_ok() {
                    tx.commit()?;
                }
                Ok(res)
            })
            .await?
    }

    async fn refresh_readiness(&self, list_id: Uuid) -> Result<Vec<Task>> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let res = (|| -> Result<Vec<Task>> {
                    let tasks = load_list_tasks(&tx, list_id)?;
                    let known: HashMap<Uuid, TaskStatus> =
                        tasks.iter().map(|t| (t.id, t.status)).collect();
                    let all_deps = tasks.iter().flat_map(|t| t.depends_on.iter().copied());
                    let statuses = dependency_statuses(&tx, &known, all_deps)?;

                    let mut changed = Vec::new();
                    for mut task in tasks {
                        let ok = deps_satisfied(&task, &statuses);
                        let next = match (task.status, ok) {
                            (TaskStatus::Pending, true) => TaskStatus::Ready,
                            (TaskStatus::Ready, false) => TaskStatus::Pending,
                            _ => continue,
                        };
                        task.status = next;
                        task.updated_at = Utc::now();
                        write_task(&tx, &task)?;
                        changed.push(task);
                    }
                    Ok(changed)
                })();
                if res.is_ok() {
                    tx.commit()?;
                }
                Ok(res)
            })
            .await?
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    async fn create_run(&self, run: &ExecutionRun) -> Result<()> {
        let data = serde_json::to_string(run)?;
        let status = enum_to_sql(&run.status)?;
        let id = run.id.to_string();
        let list_id = run.task_list_id.to_string();
        let started_at = run.started_at.to_rfc3339();
        let stop = run.stop_requested as i64;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO runs (id, list_id, status, stop_requested, started_at, data)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![id, list_id, status, stop, started_at, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn save_run(&self, run: &ExecutionRun) -> Result<()> {
        let data = serde_json::to_string(run)?;
        let status = enum_to_sql(&run.status)?;
        let id = run.id.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE runs SET status = ?2, data = ?3 WHERE id = ?1",
                    rusqlite::params![id, status, data],
                )?)
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "run",
                id: run.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<ExecutionRun>> {
        let row: Option<(String, i64, String)> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT status, stop_requested, data FROM runs WHERE id = ?1",
                        rusqlite::params![id.to_string()],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                    )
                    .optional()?)
            })
            .await?;
        row.map(|(s, stop, d)| row_to_run(&s, stop, &d)).transpose()
    }

    async fn list_runs(&self) -> Result<Vec<ExecutionRun>> {
        let rows: Vec<(String, i64, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT status, stop_requested, data FROM runs ORDER BY started_at DESC",
                )?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter()
            .map(|(s, stop, d)| row_to_run(s, *stop, d))
            .collect()
    }

    async fn request_stop(&self, run_id: Uuid) -> Result<()> {
        let id = run_id.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE runs SET stop_requested = 1 WHERE id = ?1",
                    rusqlite::params![id],
                )?)
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "run",
                id: run_id.to_string(),
            });
        }
        tracing::info!(run_id = %run_id, "stop requested");
        Ok(())
    }

    async fn is_stop_requested(&self, run_id: Uuid) -> Result<bool> {
        let stop: Option<i64> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT stop_requested FROM runs WHERE id = ?1",
                        rusqlite::params![run_id.to_string()],
                        |r| r.get(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(stop.unwrap_or(0) != 0)
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    async fn upsert_agent(&self, agent: &BuildAgentInstance) -> Result<()> {
        let status = enum_to_sql(&agent.status)?;
        let a = agent.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, run_id, wave_number, task_id, status, attempt,
                        spawned_at, last_heartbeat_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                     ON CONFLICT(id) DO UPDATE SET
                        status=excluded.status, attempt=excluded.attempt,
                        last_heartbeat_at=excluded.last_heartbeat_at",
                    rusqlite::params![
                        a.id.to_string(),
                        a.execution_run_id.to_string(),
                        a.wave_number as i64,
                        a.task_id.to_string(),
                        status,
                        a.attempt as i64,
                        a.spawned_at.to_rfc3339(),
                        a.last_heartbeat_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<BuildAgentInstance>> {
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                        rusqlite::params![id.to_string()],
                        row_to_agent,
                    )
                    .optional()?)
            })
            .await?;
        row.map(agent_from_columns).transpose()
    }

    async fn list_agents(&self, run_id: Uuid) -> Result<Vec<BuildAgentInstance>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AGENT_COLUMNS} FROM agents WHERE run_id = ?1 ORDER BY spawned_at"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![run_id.to_string()], row_to_agent)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(agent_from_columns).collect()
    }

    async fn record_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE agents SET last_heartbeat_at = ?2
                     WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'stuck')",
                    rusqlite::params![id.to_string(), at.to_rfc3339()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn set_agent_status(&self, id: Uuid, status: AgentStatus) -> Result<()> {
        let status = enum_to_sql(&status)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE agents SET status = ?2 WHERE id = ?1",
                    rusqlite::params![id.to_string(), status],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn mark_agent_stuck(&self, id: Uuid) -> Result<bool> {
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE agents SET status = 'stuck'
                     WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'stuck')",
                    rusqlite::params![id.to_string()],
                )?)
            })
            .await?;
        Ok(updated == 1)
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    async fn record_checkpoint(&self, cp: &Checkpoint) -> Result<()> {
        let state = enum_to_sql(&cp.state)?;
        let scope = serde_json::to_string(&cp.scope)?;
        let cp = cp.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO checkpoints ({CHECKPOINT_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7)"
                    ),
                    rusqlite::params![
                        cp.id.to_string(),
                        cp.task_id.to_string(),
                        cp.instance_id.to_string(),
                        cp.snapshot_ref,
                        scope,
                        state,
                        cp.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_checkpoint(&self, id: Uuid) -> Result<Option<Checkpoint>> {
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1"),
                        rusqlite::params![id.to_string()],
                        row_to_checkpoint,
                    )
                    .optional()?)
            })
            .await?;
        row.map(checkpoint_from_columns).transpose()
    }

    async fn active_checkpoint_for(&self, instance_id: Uuid) -> Result<Option<Checkpoint>> {
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
                             WHERE instance_id = ?1 AND state = 'active'
                             ORDER BY created_at DESC LIMIT 1"
                        ),
                        rusqlite::params![instance_id.to_string()],
                        row_to_checkpoint,
                    )
                    .optional()?)
            })
            .await?;
        row.map(checkpoint_from_columns).transpose()
    }

    async fn set_checkpoint_state(&self, id: Uuid, state: CheckpointState) -> Result<()> {
        let state = enum_to_sql(&state)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE checkpoints SET state = ?2 WHERE id = ?1",
                    rusqlite::params![id.to_string(), state],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // QA reports
    // -----------------------------------------------------------------------

    async fn insert_report(&self, report: &QaValidationReport) -> Result<()> {
        let data = serde_json::to_string(report)?;
        let status = enum_to_sql(&report.status)?;
        let id = report.id.to_string();
        let task_id = report.task_id.to_string();
        let created_at = report.created_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO qa_reports (id, task_id, status, created_at, data)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![id, task_id, status, created_at, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<QaValidationReport>> {
        let data: Option<String> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT data FROM qa_reports WHERE id = ?1",
                        rusqlite::params![id.to_string()],
                        |r| r.get(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    async fn reports_for_task(&self, task_id: Uuid) -> Result<Vec<QaValidationReport>> {
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT data FROM qa_reports WHERE task_id = ?1 ORDER BY created_at",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![task_id.to_string()], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter()
            .map(|d| serde_json::from_str(d).map_err(StoreError::from))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// FileLockRegistry
// ---------------------------------------------------------------------------

/// Locks live in the same database as tasks, so every process that opens it
/// shares one registry.
#[async_trait]
impl FileLockRegistry for SqliteStore {
    async fn acquire(&self, path: &str, instance: Uuid, mode: LockMode) -> locks::Result<bool> {
        let path = path.to_string();
        let wanted = enum_to_sql(&mode)?;
        let granted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let holders = {
                    let mut stmt =
                        tx.prepare("SELECT holder, mode FROM file_locks WHERE path = ?1")?;
                    let rows = stmt
                        .query_map(rusqlite::params![path], |r| {
                            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                };
                let me = instance.to_string();
                let conflict = holders.iter().any(|(holder, held)| {
                    *holder != me && (held == "exclusive" || wanted == "exclusive")
                });
                if conflict {
                    return Ok(false);
                }
                // An existing row is only ever upgraded, never downgraded.
                tx.execute(
                    "INSERT INTO file_locks (path, holder, mode, acquired_at) VALUES (?1,?2,?3,?4)
                     ON CONFLICT(path, holder) DO UPDATE SET mode = 'exclusive'
                     WHERE excluded.mode = 'exclusive'",
                    rusqlite::params![path, me, wanted, Utc::now().to_rfc3339()],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await
            .map_err(StoreError::from)?;
        Ok(granted)
    }

    async fn release(&self, path: &str, instance: Uuid) -> locks::Result<()> {
        let path = path.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM file_locks WHERE path = ?1 AND holder = ?2",
                    rusqlite::params![path, instance.to_string()],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn release_all(&self, instance: Uuid) -> locks::Result<Vec<String>> {
        let paths = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let paths = {
                    let mut stmt =
                        tx.prepare("SELECT path FROM file_locks WHERE holder = ?1 ORDER BY path")?;
                    let rows = stmt
                        .query_map(rusqlite::params![instance.to_string()], |r| r.get(0))?
                        .collect::<rusqlite::Result<Vec<String>>>()?;
                    rows
                };
                tx.execute(
                    "DELETE FROM file_locks WHERE holder = ?1",
                    rusqlite::params![instance.to_string()],
                )?;
                tx.commit()?;
                Ok(paths)
            })
            .await
            .map_err(StoreError::from)?;
        Ok(paths)
    }

    async fn holder(&self, path: &str) -> locks::Result<Option<Uuid>> {
        let path = path.to_string();
        let holder: Option<String> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT holder FROM file_locks WHERE path = ?1
                         ORDER BY mode = 'exclusive' DESC, acquired_at LIMIT 1",
                        rusqlite::params![path],
                        |r| r.get(0),
                    )
                    .optional()?)
            })
            .await
            .map_err(StoreError::from)?;
        Ok(holder.map(|h| parse_uuid(&h)).transpose()?)
    }

    async fn list(&self) -> locks::Result<Vec<FileLock>> {
        let rows: Vec<(String, String, String, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT path, holder, mode, acquired_at FROM file_locks
                     ORDER BY path, acquired_at",
                )?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(StoreError::from)?;
        let mut out = Vec::with_capacity(rows.len());
        for (path, holder, mode, acquired_at) in rows {
            out.push(FileLock {
                path,
                holder_instance_id: parse_uuid(&holder)?,
                mode: enum_from_sql("file_locks.mode", &mode)?,
                acquired_at: parse_time(&acquired_at)?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_status_is_rejected_at_the_boundary() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let list = TaskList::new("l");
        store.create_task_list(&list).await.unwrap();
        let task = Task::new(list.id, "T-1", "task");
        store.insert_task(&task).await.unwrap();

        let id = task.id.to_string();
        store
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET status = 'half_done' WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.get_task(task.id).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnknownState { column: "tasks.status", ref value } if value == "half_done"
        ));
    }

    #[test]
    fn enum_sql_strings_are_snake_case() {
        assert_eq!(enum_to_sql(&TaskStatus::InProgress).unwrap(), "in_progress");
        let s: TaskStatus = enum_from_sql("tasks.status", "in_progress").unwrap();
        assert_eq!(s, TaskStatus::InProgress);
        assert!(enum_from_sql::<TaskStatus>("tasks.status", "bogus").is_err());
    }
}
