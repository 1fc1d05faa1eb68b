use std::sync::Arc;
use std::time::Duration;

use filewright::lock::LockManager;
use filewright::models::session::SessionKey;
use filewright::AppError;

fn manager(dir: &tempfile::TempDir) -> Arc<LockManager> {
    Arc::new(LockManager::new(
        dir.path().join(".locks"),
        Duration::from_secs(300),
    ))
}

fn key(chat_id: &str) -> SessionKey {
    SessionKey::new(chat_id, "http")
}

#[tokio::test]
async fn lock_acquire_and_release() {
    let dir = tempfile::tempdir().unwrap();
    let locks = manager(&dir);
    let k = key("basic");

    let value = locks
        .with_lock(&k, Duration::from_secs(1), |guard| async move {
            assert_eq!(guard.key().chat_id, "basic");
            Ok(7)
        })
        .await
        .unwrap();
    assert_eq!(value, 7);
    // Marker removed on release.
    assert!(!locks.is_locked(&k));
}

#[tokio::test]
async fn marker_present_while_held() {
    let dir = tempfile::tempdir().unwrap();
    let locks = manager(&dir);
    let k = key("held");

    let locks_inner = Arc::clone(&locks);
    let k_inner = k.clone();
    locks
        .with_lock(&k, Duration::from_secs(1), |_guard| async move {
            assert!(locks_inner.is_locked(&k_inner));
            Ok(())
        })
        .await
        .unwrap();
    assert!(!locks.is_locked(&k));
}

#[tokio::test]
async fn reentrant_call_chain_does_not_deadlock() {
    let dir = tempfile::tempdir().unwrap();
    let locks = manager(&dir);
    let k = key("reentrant");

    let locks_outer = Arc::clone(&locks);
    let k_outer = k.clone();
    let value = locks
        .with_lock(&k, Duration::from_secs(1), |_guard| async move {
            // An operation inside the locked section that itself takes the
            // same session lock must complete as a no-op re-entry.
            locks_outer
                .with_lock(&k_outer, Duration::from_secs(1), |_inner| async move { Ok(5) })
                .await
        })
        .await
        .unwrap();
    assert_eq!(value, 5);
    assert!(!locks.is_locked(&k));
}

#[tokio::test]
async fn contended_lock_times_out_with_lock_error() {
    let dir = tempfile::tempdir().unwrap();
    let locks = manager(&dir);
    let k = key("contended");

    let holder_locks = Arc::clone(&locks);
    let holder_key = k.clone();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let holder = tokio::spawn(async move {
        holder_locks
            .with_lock(&holder_key, Duration::from_secs(1), |_guard| async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await
    });

    started_rx.await.unwrap();
    let result = locks
        .with_lock(&k, Duration::from_millis(50), |_guard| async move { Ok(()) })
        .await;
    match result {
        Err(AppError::LockTimeout(msg)) => assert!(msg.contains("contended")),
        other => panic!("expected LockTimeout, got {other:?}"),
    }

    holder.await.unwrap().unwrap();
}

#[tokio::test]
async fn stale_foreign_marker_is_force_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let locks_dir = dir.path().join(".locks");
    std::fs::create_dir_all(&locks_dir).unwrap();
    // Simulate a marker left behind by a dead process.
    let k = key("stale");
    std::fs::write(locks_dir.join(format!("{}.lock", k.lock_id())), "old").unwrap();

    let locks = Arc::new(LockManager::new(locks_dir, Duration::from_millis(50)));
    tokio::time::sleep(Duration::from_millis(120)).await;

    // Marker is past the staleness threshold: not considered locked, and
    // acquisition clears it instead of waiting out the timeout.
    assert!(!locks.is_locked(&k));
    locks
        .with_lock(&k, Duration::from_secs(1), |_guard| async move { Ok(()) })
        .await
        .unwrap();
    assert!(!locks.is_locked(&k));
}

#[tokio::test]
async fn fresh_foreign_marker_blocks_until_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let locks_dir = dir.path().join(".locks");
    std::fs::create_dir_all(&locks_dir).unwrap();
    let k = key("foreign");
    std::fs::write(locks_dir.join(format!("{}.lock", k.lock_id())), "other-process").unwrap();

    let locks = Arc::new(LockManager::new(locks_dir, Duration::from_secs(300)));
    assert!(locks.is_locked(&k));

    let result = locks
        .with_lock(&k, Duration::from_millis(150), |_guard| async move { Ok(()) })
        .await;
    assert!(matches!(result, Err(AppError::LockTimeout(_))));
}

#[tokio::test]
async fn force_unlock_removes_marker() {
    let dir = tempfile::tempdir().unwrap();
    let locks_dir = dir.path().join(".locks");
    std::fs::create_dir_all(&locks_dir).unwrap();
    let k = key("forced");
    std::fs::write(locks_dir.join(format!("{}.lock", k.lock_id())), "stuck").unwrap();

    let locks = Arc::new(LockManager::new(locks_dir, Duration::from_secs(300)));
    assert!(locks.is_locked(&k));
    assert!(locks.force_unlock(&k));
    assert!(!locks.is_locked(&k));
    assert!(!locks.force_unlock(&k));
}

#[tokio::test]
async fn sequential_acquisitions_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let locks = manager(&dir);
    let k = key("sequential");

    for i in 0..3 {
        let got = locks
            .with_lock(&k, Duration::from_secs(1), |_guard| async move { Ok(i) })
            .await
            .unwrap();
        assert_eq!(got, i);
    }
}

#[tokio::test]
async fn independent_sessions_do_not_contend() {
    let dir = tempfile::tempdir().unwrap();
    let locks = manager(&dir);

    let locks_a = Arc::clone(&locks);
    let a = tokio::spawn(async move {
        locks_a
            .with_lock(&key("session-a"), Duration::from_secs(1), |_g| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .await
    });
    // While session-a is held, session-b acquires immediately.
    locks
        .with_lock(&key("session-b"), Duration::from_millis(200), |_g| async move { Ok(()) })
        .await
        .unwrap();
    a.await.unwrap().unwrap();
}
