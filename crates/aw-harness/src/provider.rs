//! Boundaries to the two external collaborators of a build attempt.
//!
//! - [`Executor`] produces a file change for a task (code generation).
//! - [`Validator`] runs a shell command and reports its exit status.
//!
//! Both fail with errors that classify themselves as transient or not, so
//! the agent can decide between an in-attempt backoff retry and failing the
//! attempt. [`CommandExecutor`] and [`ShellValidator`] are the process-backed
//! implementations the `aw` binary uses; [`ScriptedExecutor`] and
//! [`ScriptedValidator`] replay canned results for tests and dry runs.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use aw_core::types::{FileImpact, Task};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Context / results
// ---------------------------------------------------------------------------

/// Everything the executor gets to know about the attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub display_id: String,
    pub title: String,
    pub description: String,
    pub file_impacts: Vec<FileImpact>,
    pub validation_command: String,
    /// 1-based.
    pub attempt: u32,
    /// Error output of earlier failed attempts, oldest first.
    pub previous_errors: Vec<String>,
    pub workdir: PathBuf,
}

impl TaskContext {
    pub fn for_task(task: &Task, validation_command: &str, attempt: u32, workdir: PathBuf) -> Self {
        Self {
            task_id: task.id,
            display_id: task.display_id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            file_impacts: task.file_impacts.clone(),
            validation_command: validation_command.to_string(),
            attempt,
            previous_errors: task.error_history.clone(),
            workdir,
        }
    }
}

/// What the executor claims to have changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ValidationOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, line by line.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().chain(self.stderr.lines())
    }

    /// The text an error signature is computed from: stderr when there is
    /// any, otherwise stdout.
    pub fn error_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutorError {
    /// Network, rate limit or timeout. Worth retrying as-is.
    #[error("transient executor error: {0}")]
    Transient(String),
    /// The executor could not produce a change for this context.
    #[error("executor failed: {0}")]
    Permanent(String),
}

impl ExecutorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutorError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ExecutorError::Transient(m) | ExecutorError::Permanent(m) => m,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidatorError {
    #[error("validation command timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn validation command: {0}")]
    Spawn(String),
}

impl ValidatorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ValidatorError::Timeout(_))
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Executor: Send + Sync {
    async fn generate(&self, ctx: &TaskContext) -> Result<FileChange, ExecutorError>;
}

#[async_trait]
pub trait Validator: Send + Sync {
    /// Run `command` to completion or until `timeout`. A non-zero exit is a
    /// normal `Ok` result.
    async fn run(&self, command: &str, timeout: Duration)
        -> Result<ValidationOutput, ValidatorError>;
}

// ---------------------------------------------------------------------------
// Transient classification
// ---------------------------------------------------------------------------

const TRANSIENT_PATTERNS: &[&str] = &[
    "timed out",
    "timeout",
    "rate limit",
    "rate-limit",
    "too many requests",
    "econnreset",
    "econnrefused",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
    "service unavailable",
    "overloaded",
    " 429",
    " 500",
    " 502",
    " 503",
    " 504",
];

/// Whether error output looks like a transient infrastructure failure rather
/// than a problem with the generated code.
pub fn looks_transient(output: &str) -> bool {
    let lower = format!(" {}", output.to_lowercase());
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

// ---------------------------------------------------------------------------
// CommandExecutor
// ---------------------------------------------------------------------------

/// Runs a configured command with the task context as JSON on stdin. A zero
/// exit is success; stdout may be a `FileChange` JSON document, otherwise it
/// becomes the change summary.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn generate(&self, ctx: &TaskContext) -> Result<FileChange, ExecutorError> {
        let input = serde_json::to_vec(ctx)
            .map_err(|e| ExecutorError::Permanent(format!("encode context: {e}")))?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.workdir)
            .env("AW_TASK_ID", ctx.task_id.to_string())
            .env("AW_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Permanent(format!("spawn executor: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!(error = %e, "executor closed stdin");
            }
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return Err(ExecutorError::Transient(format!("wait for executor: {e}"))),
            Err(_) => {
                return Err(ExecutorError::Transient(format!(
                    "executor timed out after {:?}",
                    self.timeout
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let text = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(if looks_transient(&text) {
                ExecutorError::Transient(text)
            } else {
                ExecutorError::Permanent(text)
            });
        }

        Ok(serde_json::from_str::<FileChange>(stdout.trim()).unwrap_or(FileChange {
            files: Vec::new(),
            summary: stdout.trim().to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// ShellValidator
// ---------------------------------------------------------------------------

/// `sh -c <command>` in the working directory. The child is killed when the
/// timeout fires.
#[derive(Debug, Clone)]
pub struct ShellValidator {
    workdir: PathBuf,
}

impl ShellValidator {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Validator for ShellValidator {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ValidationOutput, ValidatorError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ValidatorError::Spawn(e.to_string()))?;

        // Dropping the timed-out future drops the child, which kills it.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ValidatorError::Timeout(timeout))?
            .map_err(|e| ValidatorError::Spawn(e.to_string()))?;

        Ok(ValidationOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Scripted stand-ins
// ---------------------------------------------------------------------------

/// Replays a fixed sequence of executor results, then repeats the last one.
/// Records every context it was called with.
#[derive(Debug)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<FileChange, ExecutorError>>>,
    last: Mutex<Result<FileChange, ExecutorError>>,
    calls: Mutex<Vec<TaskContext>>,
    delay: Duration,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Result<FileChange, ExecutorError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Ok(FileChange::default())),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Always succeeds with an empty change.
    pub fn succeeding() -> Self {
        Self::new(Vec::new())
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<TaskContext> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn generate(&self, ctx: &TaskContext) -> Result<FileChange, ExecutorError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(ctx.clone());
        let next = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        match next {
            Some(result) => {
                *last = result.clone();
                result
            }
            None => last.clone(),
        }
    }
}

/// Scripted validator outcome for one command invocation.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// Report a timeout without waiting.
    Timeout,
    /// Sleep, then exit 0. Honours the caller's timeout.
    Sleep(Duration),
}

impl ScriptedRun {
    pub fn pass() -> Self {
        ScriptedRun::Exit {
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn fail(stderr: impl Into<String>) -> Self {
        ScriptedRun::Exit {
            code: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Validator keyed by exact command string. Each command has its own queue;
/// the last entry repeats. Unknown commands pass.
#[derive(Debug, Default)]
pub struct ScriptedValidator {
    scripts: DashMap<String, VecDeque<ScriptedRun>>,
    invocations: AtomicUsize,
    commands: Mutex<Vec<String>>,
}

impl ScriptedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, command: &str, runs: Vec<ScriptedRun>) -> Self {
        self.scripts.insert(command.to_string(), runs.into());
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ValidationOutput, ValidatorError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.commands
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(command.to_string());

        let step = match self.scripts.get_mut(command) {
            Some(mut queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };

        match step.unwrap_or_else(ScriptedRun::pass) {
            ScriptedRun::Exit {
                code,
                stdout,
                stderr,
            } => Ok(ValidationOutput {
                exit_code: code,
                stdout,
                stderr,
            }),
            ScriptedRun::Timeout => Err(ValidatorError::Timeout(timeout)),
            ScriptedRun::Sleep(d) => {
                if d > timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(ValidatorError::Timeout(timeout));
                }
                tokio::time::sleep(d).await;
                Ok(ValidationOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
        }
    }
}
