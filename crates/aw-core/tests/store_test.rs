use std::sync::Arc;

use aw_core::locks::{acquire_all, FileLockRegistry, LockOutcome};
use aw_core::store::{SqliteStore, StoreError, TaskStore};
use aw_core::types::*;
use uuid::Uuid;

async fn store_with_list() -> (SqliteStore, TaskList) {
    let store = SqliteStore::new_in_memory().await.unwrap();
    let list = TaskList::new("checkout flow");
    store.create_task_list(&list).await.unwrap();
    (store, list)
}

#[tokio::test]
async fn task_insert_and_get() {
    let (store, list) = store_with_list().await;
    let task = Task::new(list.id, "T-1", "add cart")
        .with_impact("src/cart.ts", FileOperation::Create)
        .with_priority(3);
    store.insert_task(&task).await.unwrap();

    let fetched = store.get_task(task.id).await.unwrap().expect("task should exist");
    assert_eq!(fetched.title, "add cart");
    assert_eq!(fetched.status, TaskStatus::Pending);
    assert_eq!(fetched.priority, 3);
    assert_eq!(fetched.file_impacts.len(), 1);
    assert!(store.get_task(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn valid_transitions_apply_meta_and_invalid_ones_are_rejected() {
    let (store, list) = store_with_list().await;
    let task = Task::new(list.id, "T-1", "t");
    store.insert_task(&task).await.unwrap();

    let err = store
        .update_task_status(task.id, TaskStatus::Completed, TaskMeta::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidTransition {
            from: TaskStatus::Pending,
            to: TaskStatus::Completed,
            ..
        }
    ));

    store
        .update_task_status(task.id, TaskStatus::Ready, TaskMeta::default())
        .await
        .unwrap();
    store
        .update_task_status(task.id, TaskStatus::InProgress, TaskMeta::default())
        .await
        .unwrap();
    let failed = store
        .update_task_status(
            task.id,
            TaskStatus::Failed,
            TaskMeta {
                attempts: Some(3),
                push_error: Some("boom".into()),
                ..TaskMeta::reason("retries exhausted")
            },
        )
        .await
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.reason.as_deref(), Some("retries exhausted"));
    assert_eq!(failed.error_history, vec!["boom".to_string()]);

    // Failed is terminal apart from QA reverts.
    assert!(store
        .update_task_status(task.id, TaskStatus::Ready, TaskMeta::default())
        .await
        .is_err());
}

#[tokio::test]
async fn error_history_is_bounded() {
    let (store, list) = store_with_list().await;
    let task = Task::new(list.id, "T-1", "t");
    store.insert_task(&task).await.unwrap();

    for i in 0..(ERROR_HISTORY_LIMIT + 3) {
        store
            .update_task_status(
                task.id,
                TaskStatus::Pending,
                TaskMeta {
                    push_error: Some(format!("e{i}")),
                    ..TaskMeta::default()
                },
            )
            .await
            .unwrap();
    }
    let t = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(t.error_history.len(), ERROR_HISTORY_LIMIT);
    assert_eq!(t.error_history.last().map(String::as_str), Some("e7"));
}

#[tokio::test]
async fn readiness_follows_dependency_status() {
    let (store, list) = store_with_list().await;
    let a = Task::new(list.id, "A", "a");
    let b = Task::new(list.id, "B", "b").with_dependency(a.id);
    store.insert_task(&a).await.unwrap();
    store.insert_task(&b).await.unwrap();

    let changed = store.refresh_readiness(list.id).await.unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].id, a.id);

    let ready = store.get_ready_tasks(list.id).await.unwrap();
    assert_eq!(ready.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a.id]);

    store
        .update_task_status(a.id, TaskStatus::InProgress, TaskMeta::default())
        .await
        .unwrap();
    store
        .update_task_status(a.id, TaskStatus::Completed, TaskMeta::default())
        .await
        .unwrap();
    store.refresh_readiness(list.id).await.unwrap();
    let b = store.get_task(b.id).await.unwrap().unwrap();
    assert_eq!(b.status, TaskStatus::Ready);
}

#[tokio::test]
async fn ready_tasks_are_ordered_by_priority_then_age() {
    let (store, list) = store_with_list().await;
    let old = Task::new(list.id, "OLD", "old");
    let young = Task::new(list.id, "YOUNG", "young");
    let urgent = Task::new(list.id, "URGENT", "urgent").with_priority(5);
    for t in [&old, &young, &urgent] {
        store.insert_task(t).await.unwrap();
    }
    store.refresh_readiness(list.id).await.unwrap();

    let ids: Vec<Uuid> = store
        .get_ready_tasks(list.id)
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec![urgent.id, old.id, young.id]);
}

#[tokio::test]
async fn graph_edits_bump_revision() {
    let (store, list) = store_with_list().await;
    let a = Task::new(list.id, "A", "a");
    let b = Task::new(list.id, "B", "b");
    store.insert_task(&a).await.unwrap();
    store.insert_task(&b).await.unwrap();
    let before = store.list_revision(list.id).await.unwrap();

    store
        .record_file_impact(a.id, FileImpact::new("src/a.ts", FileOperation::Update))
        .await
        .unwrap();
    store
        .set_dependencies(b.id, [a.id].into_iter().collect())
        .await
        .unwrap();

    assert_eq!(store.list_revision(list.id).await.unwrap(), before + 2);
    let b = store.get_task(b.id).await.unwrap().unwrap();
    assert!(b.depends_on.contains(&a.id));
}

#[tokio::test]
async fn fix_task_rewires_dependents() {
    let (store, list) = store_with_list().await;
    let a = Task::new(list.id, "A", "a").with_impact("src/a.ts", FileOperation::Update);
    let b = Task::new(list.id, "B", "b").with_dependency(a.id);
    store.insert_task(&a).await.unwrap();
    store.insert_task(&b).await.unwrap();

    for s in [TaskStatus::Ready, TaskStatus::InProgress, TaskStatus::Completed, TaskStatus::Failed] {
        store.update_task_status(a.id, s, TaskMeta::default()).await.unwrap();
    }
    store
        .update_task_status(b.id, TaskStatus::Blocked, TaskMeta::reason("dependency A failed"))
        .await
        .unwrap();
    let rev = store.list_revision(list.id).await.unwrap();

    let report_id = Uuid::new_v4();
    let fix = store
        .create_fix_task(FixTaskSpec {
            original_task_id: a.id,
            report_id,
            failed_checks: vec!["Tests".into()],
            suggestions: vec!["Run the failing tests locally".into()],
        })
        .await
        .unwrap();

    assert_eq!(fix.display_id, "A-fix1");
    assert_eq!(fix.status, TaskStatus::Ready);
    assert_eq!(fix.file_impacts, a.file_impacts);
    let reference = fix.fix_for.as_ref().unwrap();
    assert_eq!(reference.original_task_id, a.id);
    assert_eq!(reference.report_id, report_id);
    assert_eq!(reference.generation, 1);
    assert!(fix.description.contains("Tests"));

    let b = store.get_task(b.id).await.unwrap().unwrap();
    assert!(b.depends_on.contains(&fix.id));
    assert!(!b.depends_on.contains(&a.id));
    assert_eq!(b.status, TaskStatus::Pending);

    let a = store.get_task(a.id).await.unwrap().unwrap();
    assert_eq!(a.superseded_by, Some(fix.id));
    assert!(store.list_revision(list.id).await.unwrap() > rev);
}

#[tokio::test]
async fn stop_flag_survives_save_run() {
    let (store, list) = store_with_list().await;
    let mut run = ExecutionRun::new(list.id);
    store.create_run(&run).await.unwrap();
    assert!(!store.is_stop_requested(run.id).await.unwrap());

    store.request_stop(run.id).await.unwrap();
    run.waves.push(Wave::new(0, vec![]));
    store.save_run(&run).await.unwrap();

    assert!(store.is_stop_requested(run.id).await.unwrap());
    let loaded = store.get_run(run.id).await.unwrap().unwrap();
    assert!(loaded.stop_requested);
    assert_eq!(loaded.waves.len(), 1);

    assert!(matches!(
        store.request_stop(Uuid::new_v4()).await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn mark_agent_stuck_has_one_winner() {
    let (store, list) = store_with_list().await;
    let store = Arc::new(store);
    let run = ExecutionRun::new(list.id);
    store.create_run(&run).await.unwrap();
    let agent = BuildAgentInstance::new(run.id, 0, Uuid::new_v4(), 1);
    store.upsert_agent(&agent).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let id = agent.id;
        handles.push(tokio::spawn(async move { store.mark_agent_stuck(id).await.unwrap() }));
    }
    let mut winners = 0;
    for h in handles {
        if h.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    let a = store.get_agent(agent.id).await.unwrap().unwrap();
    assert_eq!(a.status, AgentStatus::Stuck);
}

#[tokio::test]
async fn heartbeats_stop_once_agent_is_terminal() {
    let (store, list) = store_with_list().await;
    let run = ExecutionRun::new(list.id);
    store.create_run(&run).await.unwrap();
    let agent = BuildAgentInstance::new(run.id, 0, Uuid::new_v4(), 1);
    store.upsert_agent(&agent).await.unwrap();

    let later = agent.last_heartbeat_at + chrono::Duration::seconds(10);
    store.record_heartbeat(agent.id, later).await.unwrap();
    assert_eq!(
        store.get_agent(agent.id).await.unwrap().unwrap().last_heartbeat_at,
        later
    );

    store.set_agent_status(agent.id, AgentStatus::Completed).await.unwrap();
    store
        .record_heartbeat(agent.id, later + chrono::Duration::seconds(10))
        .await
        .unwrap();
    assert_eq!(
        store.get_agent(agent.id).await.unwrap().unwrap().last_heartbeat_at,
        later
    );
}

#[tokio::test]
async fn file_locks_are_shared_across_lists_through_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    let first = SqliteStore::new(&db).await.unwrap();
    let second = SqliteStore::new(&db).await.unwrap();

    let list1_agent = Uuid::new_v4();
    let list2_agent = Uuid::new_v4();
    let requests = vec![
        ("src/shared.ts".to_string(), LockMode::Exclusive),
        ("src/a.ts".to_string(), LockMode::Exclusive),
    ];
    let shared = [("src/shared.ts".to_string(), LockMode::Shared)];

    let got = acquire_all(&first, &requests, list1_agent).await.unwrap();
    assert_eq!(
        got,
        LockOutcome::Acquired(vec!["src/a.ts".into(), "src/shared.ts".into()])
    );

    let contended = acquire_all(&second, &shared, list2_agent)
        .await
        .unwrap();
    assert_eq!(
        contended,
        LockOutcome::Deferred {
            path: "src/shared.ts".into(),
            holder: Some(list1_agent),
        }
    );

    let released = first.release_all(list1_agent).await.unwrap();
    assert_eq!(released.len(), 2);
    let after = acquire_all(&second, &shared, list2_agent)
        .await
        .unwrap();
    assert!(matches!(after, LockOutcome::Acquired(_)));
    assert_eq!(second.holder("src/shared.ts").await.unwrap(), Some(list2_agent));
}

#[tokio::test]
async fn partial_acquisition_is_rolled_back() {
    let store = SqliteStore::new_in_memory().await.unwrap();
    let holder = Uuid::new_v4();
    let other = Uuid::new_v4();
    assert!(store.acquire("b.ts", holder, LockMode::Exclusive).await.unwrap());

    let requests = [
        ("a.ts".to_string(), LockMode::Exclusive),
        ("b.ts".to_string(), LockMode::Shared),
    ];
    let outcome = acquire_all(&store, &requests, other).await.unwrap();
    assert!(matches!(outcome, LockOutcome::Deferred { .. }));
    assert_eq!(store.holder("a.ts").await.unwrap(), None);
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn readers_share_a_path_until_a_writer_wants_it() {
    let store = SqliteStore::new_in_memory().await.unwrap();
    let reader = Uuid::new_v4();
    let other_reader = Uuid::new_v4();
    let deleter = Uuid::new_v4();

    assert!(store.acquire("src/config.ts", reader, LockMode::Shared).await.unwrap());
    assert!(store.acquire("src/config.ts", other_reader, LockMode::Shared).await.unwrap());
    assert!(!store.acquire("src/config.ts", deleter, LockMode::Exclusive).await.unwrap());

    let held = store.list().await.unwrap();
    assert_eq!(held.len(), 2);
    assert!(held.iter().all(|l| l.mode == LockMode::Shared));

    store.release_all(reader).await.unwrap();
    store.release_all(other_reader).await.unwrap();
    assert!(store.acquire("src/config.ts", deleter, LockMode::Exclusive).await.unwrap());
    assert!(!store.acquire("src/config.ts", reader, LockMode::Shared).await.unwrap());
    assert_eq!(store.holder("src/config.ts").await.unwrap(), Some(deleter));

    // Re-acquiring as a reader never downgrades the writer's hold.
    assert!(store.acquire("src/config.ts", deleter, LockMode::Shared).await.unwrap());
    assert_eq!(store.list().await.unwrap()[0].mode, LockMode::Exclusive);
}

#[tokio::test]
async fn qa_reports_round_trip() {
    let (store, list) = store_with_list().await;
    let task = Task::new(list.id, "T-1", "t");
    store.insert_task(&task).await.unwrap();

    let report = QaValidationReport {
        id: Uuid::new_v4(),
        task_id: task.id,
        level: ValidationLevel::Standard,
        status: QaStatus::Partial,
        checks: vec![],
        pass_criteria: vec![],
        duration_ms: 12,
        created_at: chrono::Utc::now(),
    };
    store.insert_report(&report).await.unwrap();

    let fetched = store.get_report(report.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, QaStatus::Partial);
    assert_eq!(store.reports_for_task(task.id).await.unwrap().len(), 1);
}
