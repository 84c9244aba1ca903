use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    Ready,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Stuck,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Completed -> Failed` is reserved for the QA engine reverting a
    /// completion claim. `Blocked -> Pending/Ready` happens when re-planning
    /// rewires a dependency onto a fix task.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Ready)
                | (Pending, Blocked)
                | (Pending, Skipped)
                | (Ready, InProgress)
                | (Ready, Pending)
                | (Ready, Blocked)
                | (Ready, Skipped)
                | (InProgress, Ready)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Stuck)
                | (Completed, Failed)
                | (Blocked, Pending)
                | (Blocked, Ready)
        )
    }

    /// Terminal for the purpose of wave closure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Skipped
                | TaskStatus::Stuck
                | TaskStatus::Blocked
        )
    }

    /// Whether a dependent may treat this dependency as done.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Stuck => "stuck",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// FileImpact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileOperation {
    Create,
    Update,
    Delete,
    Read,
}

impl FileOperation {
    /// Operations that mutate the file and therefore need a lock.
    pub fn is_write(&self) -> bool {
        !matches!(self, FileOperation::Read)
    }
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileOperation::Create => "CREATE",
            FileOperation::Update => "UPDATE",
            FileOperation::Delete => "DELETE",
            FileOperation::Read => "READ",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImpactSource {
    #[default]
    Declared,
    Inferred,
    Validated,
}

/// A declared or inferred effect a task will have on one path. Used only for
/// conflict planning and lock selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileImpact {
    pub path: String,
    pub operation: FileOperation,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub source: ImpactSource,
}

fn default_confidence() -> f64 {
    1.0
}

impl FileImpact {
    pub fn new(path: impl Into<String>, operation: FileOperation) -> Self {
        Self {
            path: path.into(),
            operation,
            confidence: 1.0,
            source: ImpactSource::Declared,
        }
    }

    pub fn with_confidence(mut self, confidence: f64, source: ImpactSource) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self.source = source;
        self
    }

    /// Path with `./` prefixes, backslashes and duplicate separators removed.
    pub fn normalized_path(&self) -> String {
        normalize_path(&self.path)
    }
}

pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut out = String::with_capacity(unified.len());
    let mut last_slash = false;
    for ch in unified.chars() {
        if ch == '/' {
            if !last_slash {
                out.push(ch);
            }
            last_slash = true;
        } else {
            out.push(ch);
            last_slash = false;
        }
    }
    let mut trimmed = out.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.to_string()
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Back-reference carried by a task generated from a failed QA report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixReference {
    pub original_task_id: Uuid,
    pub report_id: Uuid,
    pub failed_checks: Vec<String>,
    pub generation: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub display_id: String,
    pub title: String,
    /// Specification text; QA parses pass criteria out of it.
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: BTreeSet<Uuid>,
    #[serde(default)]
    pub file_impacts: Vec<FileImpact>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub validation_command: Option<String>,
    #[serde(default)]
    pub qa_level: Option<ValidationLevel>,
    pub task_list_id: Uuid,
    #[serde(default)]
    pub wave_number: Option<u32>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_error_signature: Option<String>,
    /// Consecutive failures sharing `last_error_signature`.
    #[serde(default)]
    pub signature_streak: u32,
    #[serde(default)]
    pub error_history: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub failure_context: Vec<String>,
    #[serde(default)]
    pub fix_for: Option<FixReference>,
    /// Set on an original task once a fix task has been generated for it.
    #[serde(default)]
    pub superseded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        task_list_id: Uuid,
        display_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            display_id: display_id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            depends_on: BTreeSet::new(),
            file_impacts: Vec::new(),
            priority: 0,
            validation_command: None,
            qa_level: None,
            task_list_id,
            wave_number: None,
            attempts: 0,
            consecutive_failures: 0,
            last_error_signature: None,
            signature_streak: 0,
            error_history: Vec::new(),
            reason: None,
            failure_context: Vec::new(),
            fix_for: None,
            superseded_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_impact(mut self, path: impl Into<String>, operation: FileOperation) -> Self {
        self.file_impacts.push(FileImpact::new(path, operation));
        self
    }

    pub fn with_dependency(mut self, id: Uuid) -> Self {
        self.depends_on.insert(id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_validation_command(mut self, command: impl Into<String>) -> Self {
        self.validation_command = Some(command.into());
        self
    }

    /// Locks this task needs while it runs, one per normalized path and
    /// sorted so that every agent acquires them in the same order. A path
    /// the task only reads is held shared; any write makes it exclusive.
    pub fn lock_requests(&self) -> Vec<(String, LockMode)> {
        let mut modes: BTreeMap<String, LockMode> = BTreeMap::new();
        for impact in &self.file_impacts {
            let mode = if impact.operation.is_write() {
                LockMode::Exclusive
            } else {
                LockMode::Shared
            };
            let entry = modes.entry(impact.normalized_path()).or_insert(mode);
            *entry = (*entry).max(mode);
        }
        modes.into_iter().collect()
    }

    /// Paths the task may modify. Checkpoints, rollbacks and commits are
    /// scoped to these so concurrent agents never touch each other's files.
    pub fn write_paths(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .file_impacts
            .iter()
            .filter(|i| i.operation.is_write())
            .map(FileImpact::normalized_path)
            .collect();
        set.into_iter().collect()
    }

    pub fn fix_generation(&self) -> u32 {
        self.fix_for.as_ref().map(|f| f.generation).unwrap_or(0)
    }
}

/// Optional fields applied together with a status change.
#[derive(Debug, Clone, Default)]
pub struct TaskMeta {
    pub reason: Option<String>,
    pub attempts: Option<u32>,
    pub consecutive_failures: Option<u32>,
    pub last_error_signature: Option<Option<String>>,
    pub signature_streak: Option<u32>,
    pub push_error: Option<String>,
    pub failure_context: Option<Vec<String>>,
    pub wave_number: Option<u32>,
}

impl TaskMeta {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Apply the meta fields onto `task`. `error_history` keeps at most
    /// `ERROR_HISTORY_LIMIT` entries.
    pub fn apply(self, task: &mut Task) {
        if let Some(reason) = self.reason {
            task.reason = Some(reason);
        }
        if let Some(attempts) = self.attempts {
            task.attempts = attempts;
        }
        if let Some(n) = self.consecutive_failures {
            task.consecutive_failures = n;
        }
        if let Some(sig) = self.last_error_signature {
            task.last_error_signature = sig;
        }
        if let Some(streak) = self.signature_streak {
            task.signature_streak = streak;
        }
        if let Some(err) = self.push_error {
            task.error_history.push(err);
            let overflow = task.error_history.len().saturating_sub(ERROR_HISTORY_LIMIT);
            task.error_history.drain(..overflow);
        }
        if let Some(ctx) = self.failure_context {
            task.failure_context = ctx;
        }
        if let Some(wave) = self.wave_number {
            task.wave_number = Some(wave);
        }
    }
}

pub const ERROR_HISTORY_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskList {
    pub id: Uuid,
    pub name: String,
    /// Bumped whenever a dependency edge or file impact changes.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

impl TaskList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            revision: 0,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionRun / Wave
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveStatus {
    Pending,
    Running,
    Completed,
}

impl WaveStatus {
    /// Started or completed waves are never re-planned.
    pub fn is_frozen(&self) -> bool {
        !matches!(self, WaveStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wave {
    pub number: u32,
    pub task_ids: Vec<Uuid>,
    pub status: WaveStatus,
}

impl Wave {
    pub fn new(number: u32, task_ids: Vec<Uuid>) -> Self {
        Self {
            number,
            task_ids,
            status: WaveStatus::Pending,
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.task_ids.contains(id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: Uuid,
    pub task_list_id: Uuid,
    pub status: RunStatus,
    pub waves: Vec<Wave>,
    pub planned_revision: u64,
    pub stop_requested: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRun {
    pub fn new(task_list_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_list_id,
            status: RunStatus::Running,
            waves: Vec::new(),
            planned_revision: 0,
            stop_requested: false,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn wave_of(&self, task_id: &Uuid) -> Option<u32> {
        self.waves
            .iter()
            .find(|w| w.contains(task_id))
            .map(|w| w.number)
    }
}

// ---------------------------------------------------------------------------
// BuildAgentInstance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initializing,
    Running,
    Idle,
    Completed,
    Failed,
    Stuck,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Stuck
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Initializing => "initializing",
            AgentStatus::Running => "running",
            AgentStatus::Idle => "idle",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Stuck => "stuck",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAgentInstance {
    pub id: Uuid,
    pub execution_run_id: Uuid,
    pub wave_number: u32,
    pub task_id: Uuid,
    pub status: AgentStatus,
    pub attempt: u32,
    pub spawned_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl BuildAgentInstance {
    pub fn new(execution_run_id: Uuid, wave_number: u32, task_id: Uuid, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            execution_run_id,
            wave_number,
            task_id,
            status: AgentStatus::Initializing,
            attempt,
            spawned_at: now,
            last_heartbeat_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// FileLock / Checkpoint
// ---------------------------------------------------------------------------

/// Readers share a path; a writer needs it alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    /// Whether a holder in `self` mode blocks another instance asking for
    /// `other`.
    pub fn blocks(self, other: LockMode) -> bool {
        self == LockMode::Exclusive || other == LockMode::Exclusive
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLock {
    pub path: String,
    pub holder_instance_id: Uuid,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Active,
    Restored,
    Discarded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub task_id: Uuid,
    pub instance_id: Uuid,
    /// Opaque version-control reference.
    pub snapshot_ref: String,
    /// Paths the snapshot covers. Restoring touches nothing else.
    pub scope: Vec<String>,
    pub state: CheckpointState,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// QA
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationLevel {
    Quick,
    Standard,
    Thorough,
    Release,
}

impl ValidationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationLevel::Quick => "QUICK",
            ValidationLevel::Standard => "STANDARD",
            ValidationLevel::Thorough => "THOROUGH",
            ValidationLevel::Release => "RELEASE",
        }
    }
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaStatus {
    Passed,
    Failed,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaState {
    PendingVerification,
    Verifying,
    QaPassed,
    QaFailed,
}

impl QaState {
    pub fn can_transition_to(&self, target: &QaState) -> bool {
        matches!(
            (self, target),
            (QaState::PendingVerification, QaState::Verifying)
                | (QaState::Verifying, QaState::QaPassed)
                | (QaState::Verifying, QaState::QaFailed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Timeout,
    BudgetExhausted,
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub command: String,
    pub required: bool,
    pub status: CheckStatus,
    pub skip_reason: Option<SkipReason>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub output_tail: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    Passed,
    Failed,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub mapped_check: Option<String>,
    pub status: CriterionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaValidationReport {
    pub id: Uuid,
    pub task_id: Uuid,
    pub level: ValidationLevel,
    pub status: QaStatus,
    pub checks: Vec<CheckResult>,
    pub pass_criteria: Vec<CriterionResult>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl QaValidationReport {
    pub fn failed_checks(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| match c.status {
                CheckStatus::Failed => true,
                CheckStatus::Skipped => c.required,
                CheckStatus::Passed => false,
            })
            .collect()
    }
}

/// Input to `TaskStore::create_fix_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixTaskSpec {
    pub original_task_id: Uuid,
    pub report_id: Uuid,
    pub failed_checks: Vec<String>,
    pub suggestions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_requires_completed_or_skipped_dependencies() {
        assert!(TaskStatus::Completed.satisfies_dependency());
        assert!(TaskStatus::Skipped.satisfies_dependency());
        assert!(!TaskStatus::Failed.satisfies_dependency());
        assert!(!TaskStatus::InProgress.satisfies_dependency());
    }

    #[test]
    fn qa_revert_is_the_only_exit_from_completed() {
        assert!(TaskStatus::Completed.can_transition_to(&TaskStatus::Failed));
        assert!(!TaskStatus::Completed.can_transition_to(&TaskStatus::Ready));
        assert!(!TaskStatus::Stuck.can_transition_to(&TaskStatus::Ready));
    }

    #[test]
    fn normalize_strips_dot_prefix_and_duplicate_separators() {
        assert_eq!(normalize_path("./src//lib.ts"), "src/lib.ts");
        assert_eq!(normalize_path("src\\app\\main.ts"), "src/app/main.ts");
        assert_eq!(normalize_path("././a.ts"), "a.ts");
    }

    #[test]
    fn reads_take_shared_locks_and_writes_win() {
        let task = Task::new(Uuid::new_v4(), "T-1", "t")
            .with_impact("./b.ts", FileOperation::Update)
            .with_impact("a.ts", FileOperation::Create)
            .with_impact("b.ts", FileOperation::Delete)
            .with_impact("c.ts", FileOperation::Read)
            .with_impact("a.ts", FileOperation::Read);
        assert_eq!(
            task.lock_requests(),
            vec![
                ("a.ts".to_string(), LockMode::Exclusive),
                ("b.ts".to_string(), LockMode::Exclusive),
                ("c.ts".to_string(), LockMode::Shared),
            ]
        );
        assert_eq!(task.write_paths(), vec!["a.ts".to_string(), "b.ts".to_string()]);
    }

    #[test]
    fn only_shared_with_shared_coexist() {
        assert!(!LockMode::Shared.blocks(LockMode::Shared));
        assert!(LockMode::Shared.blocks(LockMode::Exclusive));
        assert!(LockMode::Exclusive.blocks(LockMode::Shared));
        assert!(LockMode::Exclusive.blocks(LockMode::Exclusive));
    }

    #[test]
    fn error_history_is_bounded() {
        let mut task = Task::new(Uuid::new_v4(), "T-1", "t");
        for i in 0..8 {
            TaskMeta {
                push_error: Some(format!("err {i}")),
                ..TaskMeta::default()
            }
            .apply(&mut task);
        }
        assert_eq!(task.error_history.len(), ERROR_HISTORY_LIMIT);
        assert_eq!(task.error_history.last().map(String::as_str), Some("err 7"));
    }

    #[test]
    fn validation_level_serializes_uppercase() {
        let json = serde_json::to_string(&ValidationLevel::Standard).unwrap();
        assert_eq!(json, "\"STANDARD\"");
    }
}
