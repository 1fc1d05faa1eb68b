use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use filewright::lock::LockManager;
use filewright::models::session::{SessionKey, SessionState};
use filewright::models::task::{AwaitingType, Task, TaskFlags, TaskStatus};
use filewright::store::{db, SessionStore};
use filewright::AppError;
use sqlx::SqlitePool;

const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

async fn setup() -> (SessionStore, Arc<LockManager>, SqlitePool, tempfile::TempDir) {
    let pool = db::connect_memory().await.expect("in-memory db");
    let dir = tempfile::tempdir().expect("tempdir");
    let locks = Arc::new(LockManager::new(
        dir.path().join(".locks"),
        Duration::from_secs(300),
    ));
    (SessionStore::new(pool.clone()), locks, pool, dir)
}

fn key(chat_id: &str) -> SessionKey {
    SessionKey::new(chat_id, "http")
}

async fn create(
    store: &SessionStore,
    locks: &LockManager,
    k: &SessionKey,
    input: &str,
) -> (String, usize) {
    let store = store.clone();
    let input = input.to_owned();
    locks
        .with_lock(k, LOCK_TIMEOUT, |guard| async move {
            store
                .create_task(&guard, guard.key(), &input, TaskFlags::default())
                .await
        })
        .await
        .expect("create_task")
}

async fn set_status(
    store: &SessionStore,
    locks: &LockManager,
    k: &SessionKey,
    task_id: &str,
    status: TaskStatus,
) -> Task {
    let store = store.clone();
    let task_id = task_id.to_owned();
    locks
        .with_lock(k, LOCK_TIMEOUT, |guard| async move {
            store.update_status(&guard, &task_id, status).await
        })
        .await
        .expect("update_status")
}

async fn finish(
    store: &SessionStore,
    locks: &LockManager,
    k: &SessionKey,
    task_id: &str,
) -> Option<String> {
    let store = store.clone();
    let task_id = task_id.to_owned();
    locks
        .with_lock(k, LOCK_TIMEOUT, |guard| async move {
            store.mark_completed(&guard, guard.key(), &task_id).await
        })
        .await
        .expect("mark_completed")
}

#[tokio::test]
async fn first_task_becomes_active_and_later_tasks_queue() {
    let (store, locks, _pool, _dir) = setup().await;
    let k = key("fifo-positions");

    let (t1, p1) = create(&store, &locks, &k, "first").await;
    let (_t2, p2) = create(&store, &locks, &k, "second").await;
    let (_t3, p3) = create(&store, &locks, &k, "third").await;

    assert_eq!(p1, 0);
    assert_eq!(p2, 1);
    assert_eq!(p3, 2);

    let state = store.load(&k).await.unwrap().unwrap();
    assert_eq!(state.session.active_task_id, Some(t1));
    assert_eq!(state.session.task_queue.len(), 2);
}

#[tokio::test]
async fn queue_advances_strictly_fifo() {
    let (store, locks, _pool, _dir) = setup().await;
    let k = key("fifo-advance");

    let (t1, _) = create(&store, &locks, &k, "t1").await;
    let (t2, _) = create(&store, &locks, &k, "t2").await;
    let (t3, _) = create(&store, &locks, &k, "t3").await;

    assert_eq!(finish(&store, &locks, &k, &t1).await, Some(t2.clone()));
    let state = store.load(&k).await.unwrap().unwrap();
    assert_eq!(state.session.active_task_id, Some(t2.clone()));
    assert_eq!(state.session.task_queue, vec![t3.clone()]);

    assert_eq!(finish(&store, &locks, &k, &t2).await, Some(t3.clone()));
    let state = store.load(&k).await.unwrap().unwrap();
    assert_eq!(state.session.active_task_id, Some(t3.clone()));
    assert!(state.session.task_queue.is_empty(), "queue empty once t3 is active");

    assert_eq!(finish(&store, &locks, &k, &t3).await, None);
    let state = store.load(&k).await.unwrap().unwrap();
    assert_eq!(state.session.active_task_id, None);
}

#[tokio::test]
async fn terminal_status_survives_stale_non_terminal_writes() {
    let (store, locks, _pool, _dir) = setup().await;
    let k = key("terminal-guard");
    let (task_id, _) = create(&store, &locks, &k, "guarded").await;

    set_status(&store, &locks, &k, &task_id, TaskStatus::Failed).await;
    // A racing worker retry tries to resurrect the task.
    let task = set_status(&store, &locks, &k, &task_id, TaskStatus::Planning).await;
    assert_eq!(task.status, TaskStatus::Failed, "terminal status must win");

    let stored = store.find_by_task_id(&task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
}

#[tokio::test]
async fn failed_to_rolled_back_is_permitted() {
    let (store, locks, _pool, _dir) = setup().await;
    let k = key("terminal-terminal");
    let (task_id, _) = create(&store, &locks, &k, "rollback me").await;

    set_status(&store, &locks, &k, &task_id, TaskStatus::Failed).await;
    let task = set_status(&store, &locks, &k, &task_id, TaskStatus::RolledBack).await;
    assert_eq!(task.status, TaskStatus::RolledBack);
}

#[tokio::test]
async fn rolled_back_from_planning_is_an_error() {
    let (store, locks, _pool, _dir) = setup().await;
    let k = key("illegal-rollback");
    let (task_id, _) = create(&store, &locks, &k, "nope").await;

    let store_inner = store.clone();
    let task_id_inner = task_id.clone();
    let result = locks
        .with_lock(&k, LOCK_TIMEOUT, |guard| async move {
            store_inner
                .update_status(&guard, &task_id_inner, TaskStatus::RolledBack)
                .await
        })
        .await;
    assert!(matches!(result, Err(AppError::InvalidInput(_))));
}

#[tokio::test]
async fn entering_a_terminal_status_stamps_completed_at() {
    let (store, locks, _pool, _dir) = setup().await;
    let k = key("completed-at");
    let (task_id, _) = create(&store, &locks, &k, "stamp").await;

    assert!(store
        .find_by_task_id(&task_id)
        .await
        .unwrap()
        .unwrap()
        .completed_at
        .is_none());
    let task = set_status(&store, &locks, &k, &task_id, TaskStatus::Failed).await;
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn errors_append_and_never_overwrite() {
    let (store, locks, _pool, _dir) = setup().await;
    let k = key("errors");
    let (task_id, _) = create(&store, &locks, &k, "err").await;

    for message in ["worker_timeout: timed out after 600s", "second failure"] {
        let store_inner = store.clone();
        let task_id_inner = task_id.clone();
        locks
            .with_lock(&k, LOCK_TIMEOUT, |guard| async move {
                store_inner.append_error(&guard, &task_id_inner, message).await
            })
            .await
            .expect("append_error");
    }

    let task = store.find_by_task_id(&task_id).await.unwrap().unwrap();
    assert_eq!(task.errors.len(), 2);
    assert!(task.errors[0].message.contains("worker_timeout"));
    assert_eq!(task.errors[1].message, "second failure");
}

#[tokio::test]
async fn mark_completed_keeps_a_failed_status() {
    let (store, locks, _pool, _dir) = setup().await;
    let k = key("keep-failed");
    let (task_id, _) = create(&store, &locks, &k, "fail then advance").await;

    set_status(&store, &locks, &k, &task_id, TaskStatus::Failed).await;
    finish(&store, &locks, &k, &task_id).await;

    let task = store.find_by_task_id(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed, "finalize must not overwrite Failed");
}

#[tokio::test]
async fn load_repairs_a_ghost_active_task_id() {
    let (store, locks, _pool, _dir) = setup().await;
    let k = key("ghost");

    let real = Task::new("real".into(), TaskFlags::default());
    let real_id = real.task_id.clone();
    let mut state = SessionState::new(k.clone());
    state.tasks.insert(real_id.clone(), real);
    state.session.active_task_id = Some("ghost-id".into());
    state.session.task_queue = vec![real_id.clone(), "orphan-id".into()];

    let store_inner = store.clone();
    locks
        .with_lock(&k, LOCK_TIMEOUT, |guard| async move {
            store_inner.save(&guard, &state).await
        })
        .await
        .expect("save corrupted state");

    let loaded = store.load(&k).await.unwrap().unwrap();
    assert_eq!(loaded.session.active_task_id, None, "ghost cleared");
    assert_eq!(loaded.session.task_queue, vec![real_id.clone()], "orphan dropped");
    assert!(loaded.tasks.contains_key(&real_id), "real task untouched");

    // Repair was persisted, not just applied in memory.
    let reloaded = store.load(&k).await.unwrap().unwrap();
    assert_eq!(reloaded.session.active_task_id, None);
}

#[tokio::test]
async fn task_field_mutators_round_trip() {
    let (store, locks, _pool, _dir) = setup().await;
    let k = key("fields");
    let (task_id, _) = create(&store, &locks, &k, "fields").await;

    let store_inner = store.clone();
    let task_id_inner = task_id.clone();
    locks
        .with_lock(&k, LOCK_TIMEOUT, |guard| async move {
            let mut diffs = BTreeMap::new();
            diffs.insert("a.php".to_owned(), "--- a\n+++ b\n".to_owned());
            store_inner.store_diffs(&guard, &task_id_inner, diffs).await?;

            let mut contents = BTreeMap::new();
            contents.insert("a.php".to_owned(), "<?php new();\n".to_owned());
            store_inner
                .store_new_contents(&guard, &task_id_inner, contents)
                .await?;

            store_inner
                .set_plan(&guard, &task_id_inner, serde_json::json!({"summary": "s"}))
                .await?;
            store_inner
                .record_written_file(&guard, &task_id_inner, "a.php", Some("a.bak".into()))
                .await?;
            store_inner
                .set_awaiting(&guard, &task_id_inner, Some(AwaitingType::Approval))
                .await?;
            let count = store_inner.bump_retry_count(&guard, &task_id_inner).await?;
            assert_eq!(count, 1);
            Ok(())
        })
        .await
        .expect("mutations");

    let task = store.find_by_task_id(&task_id).await.unwrap().unwrap();
    assert_eq!(task.diffs.len(), 1);
    assert_eq!(task.new_contents.get("a.php").map(String::as_str), Some("<?php new();\n"));
    assert_eq!(task.plan.as_ref().and_then(|p| p["summary"].as_str()), Some("s"));
    assert_eq!(task.backups().get("a.php").map(String::as_str), Some("a.bak"));
    assert!(task.awaiting_response);
    assert_eq!(task.awaiting_type, Some(AwaitingType::Approval));
    assert_eq!(task.retry_count, 1);
}

#[tokio::test]
async fn lookup_by_task_id_finds_the_owning_session() {
    let (store, locks, _pool, _dir) = setup().await;
    let k = key("lookup");
    let (task_id, _) = create(&store, &locks, &k, "find me").await;

    let owner = store.find_session_by_task_id(&task_id).await.unwrap();
    assert_eq!(owner, Some(k));
    assert_eq!(store.find_session_by_task_id("no-such-task").await.unwrap(), None);
    assert!(store.find_by_task_id("no-such-task").await.unwrap().is_none());
}

#[tokio::test]
async fn delete_session_removes_tasks_too() {
    let (store, locks, _pool, _dir) = setup().await;
    let k = key("delete");
    let (task_id, _) = create(&store, &locks, &k, "doomed").await;

    store.delete_session(&k).await.unwrap();
    assert!(store.load(&k).await.unwrap().is_none());
    assert!(store.find_by_task_id(&task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn counts_reflect_sessions_and_queues() {
    let (store, locks, _pool, _dir) = setup().await;
    let a = key("counts-a");
    let b = key("counts-b");
    create(&store, &locks, &a, "a1").await;
    create(&store, &locks, &a, "a2").await;
    create(&store, &locks, &b, "b1").await;

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.sessions, 2);
    assert_eq!(counts.active_tasks, 2);
    assert_eq!(counts.queued_tasks, 1);
    assert_eq!(counts.total_tasks, 3);
}

#[tokio::test]
async fn list_keys_updated_before_honors_the_cutoff() {
    let (store, locks, pool, _dir) = setup().await;
    let old = key("old-session");
    let fresh = key("fresh-session");
    create(&store, &locks, &old, "ancient").await;
    create(&store, &locks, &fresh, "recent").await;

    let long_ago = (chrono::Utc::now() - chrono::Duration::days(90)).to_rfc3339();
    sqlx::query("UPDATE session SET updated_at = ? WHERE chat_id = ?")
        .bind(&long_ago)
        .bind(&old.chat_id)
        .execute(&pool)
        .await
        .unwrap();

    let cutoff = chrono::Utc::now() - chrono::Duration::days(30);
    let expired = store.list_keys_updated_before(cutoff).await.unwrap();
    assert_eq!(expired, vec![old]);
}
