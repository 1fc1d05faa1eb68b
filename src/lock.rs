//! Per-session mutual exclusion with reentrancy and stale-lock recovery.
//!
//! Every mutation of a session's task records happens while that session's
//! lock is held. The lock has two layers:
//!
//! - an in-process `tokio::sync::Mutex` per session key, serializing
//!   concurrent call chains inside this process;
//! - a durable marker file per session key, excluding other processes and
//!   surviving crashes. A marker older than the staleness threshold is
//!   treated as abandoned and force-cleared before acquisition.
//!
//! Re-entry is a no-op: a task-local set records which keys the current
//! logical call chain already holds, so a handler that calls another
//! locked operation on the same session cannot deadlock against itself.
//!
//! [`LockGuard`] doubles as compile-time proof of lock ownership — store
//! methods that mutate task state require a `&LockGuard` parameter.
//! Dropping the guard (including mid-closure cancellation) releases the
//! in-process holder entry and removes the marker, so cancellation never
//! leaves the lock held.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use crate::models::session::SessionKey;
use crate::{AppError, Result};

tokio::task_local! {
    /// Lock ids held by the current logical call chain.
    static HELD_KEYS: RefCell<HashSet<String>>;
}

/// Proof that the session lock for `key` is held by the current call chain.
pub struct LockGuard {
    lock_id: String,
    key: SessionKey,
    /// Marker to remove on release; `None` for reentrant guards, which
    /// release nothing.
    marker_path: Option<PathBuf>,
    _permit: Option<OwnedMutexGuard<()>>,
}

impl LockGuard {
    fn reentrant(lock_id: String, key: SessionKey) -> Self {
        Self {
            lock_id,
            key,
            marker_path: None,
            _permit: None,
        }
    }

    /// The session key this guard covers.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(marker) = self.marker_path.take() {
            let _ = std::fs::remove_file(marker);
            let _ = HELD_KEYS.try_with(|held| {
                held.borrow_mut().remove(&self.lock_id);
            });
        }
    }
}

/// Manager of per-session locks.
///
/// Constructed once at startup and injected; the key-to-mutex table is
/// guarded by its own fine-grained mutex, independent of any session lock.
pub struct LockManager {
    locks_dir: PathBuf,
    stale_after: Duration,
    mutexes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockManager {
    /// Construct a manager writing markers under `locks_dir`.
    #[must_use]
    pub fn new(locks_dir: PathBuf, stale_after: Duration) -> Self {
        Self {
            locks_dir,
            stale_after,
            mutexes: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` while holding the session lock for `key`.
    ///
    /// Re-entry from a call chain that already holds this key runs `f`
    /// immediately with a non-releasing guard. Otherwise acquisition is
    /// bounded by `timeout`; a marker left behind by a dead holder is
    /// force-cleared once it exceeds the staleness threshold.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockTimeout` when the lock cannot be acquired
    /// within `timeout`; otherwise whatever `f` returns.
    pub async fn with_lock<T, F, Fut>(&self, key: &SessionKey, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce(LockGuard) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock_id = key.lock_id();

        let already_held = HELD_KEYS
            .try_with(|held| held.borrow().contains(&lock_id))
            .unwrap_or(false);
        if already_held {
            return f(LockGuard::reentrant(lock_id, key.clone())).await;
        }

        let deadline = tokio::time::Instant::now() + timeout;

        let mutex = self.mutex_for(&lock_id);
        let permit = tokio::time::timeout_at(deadline, mutex.lock_owned())
            .await
            .map_err(|_| {
                AppError::LockTimeout(format!(
                    "could not acquire lock for {key} within {}s",
                    timeout.as_secs()
                ))
            })?;

        let marker = self.marker_path(&lock_id);
        loop {
            match self.marker_age(&marker) {
                None => break,
                Some(age) if age > self.stale_after => {
                    tracing::warn!(
                        session = %key,
                        age_secs = age.as_secs(),
                        "removing stale lock marker"
                    );
                    let _ = std::fs::remove_file(&marker);
                    break;
                }
                Some(_) => {
                    // A fresh foreign marker: another process holds the lock.
                    if tokio::time::Instant::now() >= deadline {
                        return Err(AppError::LockTimeout(format!(
                            "could not acquire lock for {key} within {}s",
                            timeout.as_secs()
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        std::fs::create_dir_all(&self.locks_dir)
            .map_err(|err| AppError::Io(format!("failed to create locks dir: {err}")))?;
        std::fs::write(&marker, chrono::Utc::now().to_rfc3339())
            .map_err(|err| AppError::Io(format!("failed to write lock marker: {err}")))?;

        let guard = LockGuard {
            lock_id: lock_id.clone(),
            key: key.clone(),
            marker_path: Some(marker),
            _permit: Some(permit),
        };

        // Track the held key in the task-local set so nested locked
        // operations on the same session become no-ops. Outside any
        // existing scope, open a fresh one around the closure.
        let in_scope = HELD_KEYS.try_with(|_| ()).is_ok();
        if in_scope {
            HELD_KEYS.with(|held| {
                held.borrow_mut().insert(lock_id);
            });
            f(guard).await
        } else {
            let mut initial = HashSet::new();
            initial.insert(lock_id);
            HELD_KEYS.scope(RefCell::new(initial), f(guard)).await
        }
    }

    /// Whether a fresh lock marker exists for `key`.
    ///
    /// A marker past the staleness threshold counts as unlocked.
    #[must_use]
    pub fn is_locked(&self, key: &SessionKey) -> bool {
        let marker = self.marker_path(&key.lock_id());
        self.marker_age(&marker)
            .is_some_and(|age| age <= self.stale_after)
    }

    /// Force-remove the lock marker for `key` (operator escape hatch).
    ///
    /// Returns `true` if a marker was removed.
    pub fn force_unlock(&self, key: &SessionKey) -> bool {
        let marker = self.marker_path(&key.lock_id());
        if marker.exists() {
            if let Err(err) = std::fs::remove_file(&marker) {
                tracing::warn!(session = %key, %err, "failed to force-unlock");
                return false;
            }
            return true;
        }
        false
    }

    fn marker_path(&self, lock_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{lock_id}.lock"))
    }

    fn marker_age(&self, marker: &Path) -> Option<Duration> {
        let modified = std::fs::metadata(marker).and_then(|meta| meta.modified()).ok()?;
        Some(modified.elapsed().unwrap_or(Duration::ZERO))
    }

    fn mutex_for(&self, lock_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut mutexes = self.mutexes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            mutexes
                .entry(lock_id.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}
