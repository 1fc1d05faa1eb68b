//! Scheduler loop: periodic scan over all sessions.
//!
//! One cooperative loop drives task execution. Task bodies run on spawned
//! tokio tasks under a hard timeout, so a slow task can never stall the
//! scan. Per session and per tick the loop does exactly one of:
//!
//! - skip — the session is lock-held (in-flight work is never preempted)
//!   or already has a running execution;
//! - advance — the active task is terminal and no longer awaiting input;
//! - fail stale — the active task has been awaiting external input past
//!   the staleness threshold;
//! - execute — a fresh active task, or the queue head after activation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::session::{SessionKey, SessionState};
use crate::models::task::{Task, TaskStatus};
use crate::worker::Runner;
use crate::{AppError, Result};

/// The scheduler loop driving task execution for all sessions.
pub struct WorkerLoop {
    runner: Arc<Runner>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl WorkerLoop {
    /// Construct a loop over the given runner.
    #[must_use]
    pub fn new(runner: Arc<Runner>) -> Self {
        Self {
            runner,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the periodic scan task.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let poll_interval = self.runner.config().poll_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("worker loop shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = self.scan().await {
                            error!(%err, "worker loop scan failed");
                        }
                    }
                }
            }
        })
    }

    /// One scan over every session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the session listing fails; per-session
    /// trouble is logged and does not abort the scan.
    pub async fn scan(&self) -> Result<()> {
        let keys = self.runner.store().list_session_keys().await?;
        for key in keys {
            if let Err(err) = self.scan_session(&key).await {
                warn!(session = %key, %err, "session scan failed");
            }
        }
        Ok(())
    }

    async fn scan_session(&self, key: &SessionKey) -> Result<()> {
        let lock_id = key.lock_id();
        if self.has_running_execution(&lock_id) {
            return Ok(());
        }
        // A held lock means another call chain (or process) is mid-work on
        // this session; never preempt it, not even for staleness.
        if self.runner.locks().is_locked(key) {
            debug!(session = %key, "session locked, skipping");
            return Ok(());
        }

        let Some(state) = self.runner.store().load(key).await? else {
            return Ok(());
        };

        if let Some(active_id) = state.session.active_task_id.clone() {
            let Some(task) = state.tasks.get(&active_id) else {
                // Ghost was repaired during load; pick it up next tick.
                return Ok(());
            };
            self.drive_active(key, &lock_id, task).await?;
        } else if !state.session.task_queue.is_empty() {
            self.activate_and_run(key, &lock_id, &state).await?;
        }
        Ok(())
    }

    async fn drive_active(&self, key: &SessionKey, lock_id: &str, task: &Task) -> Result<()> {
        let staleness = self.runner.config().awaiting_staleness();
        let task_id = task.task_id.clone();

        if task.status.is_terminal() {
            // Terminal but still awaiting (deploy confirmation) is left to
            // the human until it goes stale, then finalized as-is.
            if !task.awaiting_response || age_of(task) > staleness {
                self.advance_past(key, &task_id).await;
            }
            return Ok(());
        }

        if task.awaiting_response {
            if age_of(task) > staleness {
                let reason = format!(
                    "worker_stale_task: awaiting {} past threshold {}min",
                    task.awaiting_type.map_or("input", |t| t.as_str()),
                    staleness.as_secs() / 60,
                );
                warn!(session = %key, task_id, reason, "failing stale task");
                self.spawn_fail(key.clone(), lock_id.to_owned(), task_id, reason);
            }
            return Ok(());
        }

        // Mid-flight non-awaiting states belong to the startup recovery
        // path; only a fresh task is picked up here.
        if task.status == TaskStatus::Planning {
            self.spawn_run(key.clone(), lock_id.to_owned(), task_id);
        }
        Ok(())
    }

    async fn activate_and_run(
        &self,
        key: &SessionKey,
        lock_id: &str,
        state: &SessionState,
    ) -> Result<()> {
        debug_assert!(state.session.active_task_id.is_none());
        let runner = &self.runner;
        let store = runner.store().clone();
        let activated = runner
            .locks()
            .with_lock(key, runner.config().lock_timeout(), |guard| async move {
                store.clear_active_and_advance(&guard, guard.key()).await
            })
            .await;
        match activated {
            Ok(Some(next_id)) => {
                info!(session = %key, task_id = next_id, "activated queue head");
                self.spawn_run(key.clone(), lock_id.to_owned(), next_id);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(AppError::LockTimeout(msg)) => {
                debug!(session = %key, msg, "lock contention during activation");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Advance the queue past a finished active task, tolerating lock
    /// contention (retried next tick).
    async fn advance_past(&self, key: &SessionKey, task_id: &str) {
        let runner = &self.runner;
        let store = runner.store().clone();
        let task_id = task_id.to_owned();
        let outcome = runner
            .locks()
            .with_lock(key, runner.config().lock_timeout(), |guard| async move {
                store.mark_completed(&guard, guard.key(), &task_id).await
            })
            .await;
        match outcome {
            Ok(next) => {
                if let Some(next_id) = next {
                    info!(session = %key, next_id, "queue advanced");
                }
            }
            Err(err) => warn!(session = %key, %err, "queue advance failed"),
        }
    }

    fn spawn_run(&self, key: SessionKey, lock_id: String, task_id: String) {
        let runner = Arc::clone(&self.runner);
        let task_timeout = runner.config().task_timeout();
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(task_timeout, runner.run_active(&key, &task_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    // run_active records pipeline failures itself; what
                    // escapes is lock contention or a store failure.
                    warn!(session = %key, task_id, %err, "task run aborted");
                }
                Err(_) => {
                    let reason = format!(
                        "worker_timeout: timed out after {}s",
                        task_timeout.as_secs()
                    );
                    error!(session = %key, task_id, reason, "task execution timed out");
                    if let Err(err) = runner.fail_task(&key, &task_id, &reason).await {
                        error!(session = %key, task_id, %err, "failed to record timeout");
                    }
                }
            }
        });
        self.track(lock_id, handle);
    }

    fn spawn_fail(&self, key: SessionKey, lock_id: String, task_id: String, reason: String) {
        let runner = Arc::clone(&self.runner);
        let handle = tokio::spawn(async move {
            if let Err(err) = runner.fail_task(&key, &task_id, &reason).await {
                warn!(session = %key, task_id, %err, "failed to fail stale task");
            }
        });
        self.track(lock_id, handle);
    }

    fn track(&self, lock_id: String, handle: JoinHandle<()>) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.insert(lock_id, handle);
    }

    fn has_running_execution(&self, lock_id: &str) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match running.get(lock_id) {
            Some(handle) if handle.is_finished() => {
                running.remove(lock_id);
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// Age of a task's last mutation, clamped at zero against clock skew.
fn age_of(task: &Task) -> Duration {
    (chrono::Utc::now() - task.updated_at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}
