use std::path::PathBuf;
use std::time::{Duration, Instant};

use aw_core::types::{FileOperation, Task};
use aw_harness::provider::{
    CommandExecutor, Executor, ExecutorError, ShellValidator, TaskContext, Validator,
    ValidatorError,
};
use uuid::Uuid;

fn context(workdir: PathBuf) -> TaskContext {
    let task = Task::new(Uuid::new_v4(), "T-7", "add button")
        .with_impact("src/Button.tsx", FileOperation::Create);
    TaskContext::for_task(&task, "true", 2, workdir)
}

#[tokio::test]
async fn shell_validator_reports_exit_code_and_output() {
    let dir = tempfile::tempdir().unwrap();
    let v = ShellValidator::new(dir.path());

    let ok = v.run("echo hello", Duration::from_secs(5)).await.unwrap();
    assert!(ok.success());
    assert_eq!(ok.stdout.trim(), "hello");

    let bad = v
        .run("echo broken >&2; exit 3", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(bad.exit_code, 3);
    assert_eq!(bad.error_text().trim(), "broken");
}

#[tokio::test]
async fn shell_validator_runs_in_workdir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
    let v = ShellValidator::new(dir.path());
    let out = v.run("test -f marker.txt", Duration::from_secs(5)).await.unwrap();
    assert!(out.success());
}

#[tokio::test]
async fn shell_validator_kills_on_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let v = ShellValidator::new(dir.path());
    let started = Instant::now();
    let err = v
        .run("sleep 5", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ValidatorError::Timeout(_)));
    assert!(err.is_transient());
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn command_executor_receives_context_and_env() {
    let dir = tempfile::tempdir().unwrap();
    let exec = CommandExecutor::new(
        "cat > ctx.json; printf '{\"files\":[\"%s\"],\"summary\":\"attempt %s\"}' \"$AW_TASK_ID\" \"$AW_ATTEMPT\"",
        dir.path(),
        Duration::from_secs(5),
    );
    let ctx = context(dir.path().to_path_buf());
    let change = exec.generate(&ctx).await.unwrap();
    assert_eq!(change.files, vec![ctx.task_id.to_string()]);
    assert_eq!(change.summary, "attempt 2");

    let written: TaskContext =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("ctx.json")).unwrap())
            .unwrap();
    assert_eq!(written, ctx);
}

#[tokio::test]
async fn command_executor_plain_stdout_becomes_summary() {
    let dir = tempfile::tempdir().unwrap();
    let exec = CommandExecutor::new("echo wrote it", dir.path(), Duration::from_secs(5));
    let change = exec.generate(&context(dir.path().into())).await.unwrap();
    assert!(change.files.is_empty());
    assert_eq!(change.summary, "wrote it");
}

#[tokio::test]
async fn command_executor_classifies_failures() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path().into());

    let rate_limited = CommandExecutor::new(
        "echo 'HTTP 429 Too Many Requests' >&2; exit 1",
        dir.path(),
        Duration::from_secs(5),
    );
    assert!(matches!(
        rate_limited.generate(&ctx).await,
        Err(ExecutorError::Transient(_))
    ));

    let broken = CommandExecutor::new(
        "echo 'cannot parse task' >&2; exit 1",
        dir.path(),
        Duration::from_secs(5),
    );
    match broken.generate(&ctx).await {
        Err(ExecutorError::Permanent(msg)) => assert!(msg.contains("cannot parse task")),
        other => panic!("expected permanent error, got {other:?}"),
    }

    let slow = CommandExecutor::new("sleep 5", dir.path(), Duration::from_millis(100));
    assert!(slow.generate(&ctx).await.unwrap_err().is_transient());
}
