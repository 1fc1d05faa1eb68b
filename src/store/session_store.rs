//! Session/task repository — the sole owner of session and task records.
//!
//! All other components read and mutate through this API. Methods that
//! mutate take a [`&LockGuard`](crate::lock::LockGuard) as compile-time
//! proof that the caller holds the session lock; read-only lookups do not.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::lock::LockGuard;
use crate::models::session::{Session, SessionKey, SessionState};
use crate::models::task::{AwaitingType, Task, TaskError, TaskFlags, TaskStatus, WrittenFile};
use crate::{AppError, Result};

/// Aggregate counts for the health endpoint.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StoreCounts {
    /// Number of sessions on record.
    pub sessions: u64,
    /// Sessions with an active task set.
    pub active_tasks: u64,
    /// Tasks waiting in queues across all sessions.
    pub queued_tasks: u64,
    /// Total task records.
    pub total_tasks: u64,
}

/// Internal row struct for `SQLite` deserialization of sessions.
#[derive(sqlx::FromRow)]
struct SessionRow {
    chat_id: String,
    source: String,
    active_task_id: Option<String>,
    task_queue: String,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        Ok(Session {
            key: SessionKey::new(self.chat_id, self.source),
            active_task_id: self.active_task_id,
            task_queue: parse_json(&self.task_queue, "task_queue")?,
            created_at: parse_timestamp(&self.created_at, "created_at")?,
            updated_at: parse_timestamp(&self.updated_at, "updated_at")?,
        })
    }
}

/// Internal row struct for `SQLite` deserialization of tasks.
#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    status: String,
    user_input: String,
    dry_run: i64,
    test_mode: i64,
    webhook_url: Option<String>,
    plan: Option<String>,
    diffs: String,
    new_contents: String,
    written_files: String,
    errors: String,
    retry_count: i64,
    awaiting_response: i64,
    awaiting_type: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| AppError::Db(format!("invalid task status: {}", self.status)))?;
        let awaiting_type = self
            .awaiting_type
            .as_deref()
            .map(|s| {
                AwaitingType::parse(s)
                    .ok_or_else(|| AppError::Db(format!("invalid awaiting_type: {s}")))
            })
            .transpose()?;
        let plan = self
            .plan
            .as_deref()
            .map(|raw| {
                serde_json::from_str(raw).map_err(|err| AppError::Db(format!("invalid plan: {err}")))
            })
            .transpose()?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(|raw| parse_timestamp(raw, "completed_at"))
            .transpose()?;
        Ok(Task {
            task_id: self.task_id,
            status,
            user_input: self.user_input,
            dry_run: self.dry_run != 0,
            test_mode: self.test_mode != 0,
            webhook_url: self.webhook_url,
            plan,
            diffs: parse_json(&self.diffs, "diffs")?,
            new_contents: parse_json(&self.new_contents, "new_contents")?,
            written_files: parse_json(&self.written_files, "written_files")?,
            errors: parse_json(&self.errors, "errors")?,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            awaiting_response: self.awaiting_response != 0,
            awaiting_type,
            created_at: parse_timestamp(&self.created_at, "created_at")?,
            updated_at: parse_timestamp(&self.updated_at, "updated_at")?,
            completed_at,
        })
    }
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| AppError::Db(format!("invalid {field}: {err}")))
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, field: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|err| AppError::Db(format!("invalid {field}: {err}")))
}

fn to_json<T: serde::Serialize>(value: &T, field: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|err| AppError::Db(format!("cannot encode {field}: {err}")))
}

/// Repository wrapper around `SQLite` for session and task records.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Create a new store instance over a connected pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load a session and its full task set.
    ///
    /// Structural invariants are checked on every load; safe-to-fix damage
    /// (ghost active id, orphan queue entries) is repaired in place and the
    /// repaired session row persisted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on query or decode failure.
    pub async fn load(&self, key: &SessionKey) -> Result<Option<SessionState>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT chat_id, source, active_task_id, task_queue, created_at, updated_at \
             FROM session WHERE chat_id = ? AND source = ?",
        )
        .bind(&key.chat_id)
        .bind(&key.source)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let session = row.into_session()?;

        let task_rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT task_id, status, user_input, dry_run, test_mode, webhook_url, plan, \
             diffs, new_contents, written_files, errors, retry_count, awaiting_response, \
             awaiting_type, created_at, updated_at, completed_at \
             FROM task WHERE chat_id = ? AND source = ? ORDER BY created_at",
        )
        .bind(&key.chat_id)
        .bind(&key.source)
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = BTreeMap::new();
        for task_row in task_rows {
            let task = task_row.into_task()?;
            tasks.insert(task.task_id.clone(), task);
        }

        let mut state = SessionState { session, tasks };
        let repairs = state.check_invariants();
        if !repairs.is_empty() {
            for repair in &repairs {
                tracing::warn!(session = %key, repair, "session invariant repaired");
            }
            self.persist_session_row(&state.session).await?;
        }

        Ok(Some(state))
    }

    /// Persist a full session state (session row plus every task) as a
    /// single transaction. Partial writes across tasks are forbidden.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on any statement failure; the transaction
    /// rolls back as a unit.
    pub async fn save(&self, _guard: &LockGuard, state: &SessionState) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_session(&mut tx, &state.session).await?;
        for task in state.tasks.values() {
            upsert_task(&mut tx, &state.session.key, task).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Create a task for a session, creating the session lazily.
    ///
    /// The task starts in `Planning`. It becomes active when the session
    /// has no active task, otherwise it is appended to the queue. Returns
    /// the task id and its queue position (0 = active, 1-based otherwise).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on persistence failure.
    pub async fn create_task(
        &self,
        guard: &LockGuard,
        key: &SessionKey,
        user_input: &str,
        flags: TaskFlags,
    ) -> Result<(String, usize)> {
        let mut state = match self.load(key).await? {
            Some(state) => state,
            None => SessionState::new(key.clone()),
        };

        let task = Task::new(user_input.to_owned(), flags);
        let task_id = task.task_id.clone();

        let position = if state.session.active_task_id.is_none() {
            state.session.active_task_id = Some(task_id.clone());
            0
        } else {
            state.session.task_queue.push(task_id.clone());
            state.session.task_queue.len()
        };
        state.session.updated_at = Utc::now();
        state.tasks.insert(task_id.clone(), task);

        self.save(guard, &state).await?;
        tracing::info!(session = %key, task_id, position, "task created");
        Ok((task_id, position))
    }

    /// Update a task's status, honoring the terminal-status guard.
    ///
    /// A terminal status is never replaced by a non-terminal one — the
    /// stale write is dropped with a warning and the stored task returned
    /// unchanged. Entering `RolledBack` from a status it is unreachable
    /// from is an error. Terminal-to-terminal transitions are applied.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task,
    /// `AppError::InvalidInput` for an illegal `RolledBack` entry, or
    /// `AppError::Db` on persistence failure.
    pub async fn update_status(
        &self,
        _guard: &LockGuard,
        task_id: &str,
        new_status: TaskStatus,
    ) -> Result<Task> {
        let mut task = self.require_task(task_id).await?;
        let prev = task.status;

        if prev.is_terminal() && !new_status.is_terminal() {
            tracing::warn!(
                task_id,
                prev_status = prev.as_str(),
                rejected_status = new_status.as_str(),
                "terminal status protected, dropping stale transition"
            );
            return Ok(task);
        }
        if !prev.can_transition_to(new_status) {
            return Err(AppError::InvalidInput(format!(
                "task {task_id}: cannot transition {} -> {}",
                prev.as_str(),
                new_status.as_str()
            )));
        }

        task.status = new_status;
        task.updated_at = Utc::now();
        if new_status.is_terminal() && task.completed_at.is_none() {
            task.completed_at = Some(task.updated_at);
        }
        if new_status == TaskStatus::Failed {
            tracing::warn!(
                task_id,
                prev_status = prev.as_str(),
                awaiting = task.awaiting_response,
                "task marked failed"
            );
        }
        self.persist_task_fields(&task).await?;
        Ok(task)
    }

    /// Attach the opaque plan blob to a task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::Db`.
    pub async fn set_plan(
        &self,
        _guard: &LockGuard,
        task_id: &str,
        plan: serde_json::Value,
    ) -> Result<()> {
        let mut task = self.require_task(task_id).await?;
        task.plan = Some(plan);
        task.updated_at = Utc::now();
        self.persist_task_fields(&task).await
    }

    /// Store generated per-file diffs.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::Db`.
    pub async fn store_diffs(
        &self,
        _guard: &LockGuard,
        task_id: &str,
        diffs: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut task = self.require_task(task_id).await?;
        task.diffs = diffs;
        task.updated_at = Utc::now();
        self.persist_task_fields(&task).await
    }

    /// Store generated per-file replacement contents.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::Db`.
    pub async fn store_new_contents(
        &self,
        _guard: &LockGuard,
        task_id: &str,
        contents: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut task = self.require_task(task_id).await?;
        task.new_contents = contents;
        task.updated_at = Utc::now();
        self.persist_task_fields(&task).await
    }

    /// Record a successful file write and its backup reference.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::Db`.
    pub async fn record_written_file(
        &self,
        _guard: &LockGuard,
        task_id: &str,
        path: &str,
        backup: Option<String>,
    ) -> Result<()> {
        let mut task = self.require_task(task_id).await?;
        task.written_files.insert(
            path.to_owned(),
            WrittenFile {
                timestamp: Utc::now(),
                backup,
            },
        );
        task.updated_at = Utc::now();
        self.persist_task_fields(&task).await
    }

    /// Append a timestamped entry to the task's error log.
    ///
    /// Prior entries are never overwritten.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::Db`.
    pub async fn append_error(&self, _guard: &LockGuard, task_id: &str, message: &str) -> Result<()> {
        let mut task = self.require_task(task_id).await?;
        task.errors.push(TaskError {
            timestamp: Utc::now(),
            message: message.to_owned(),
        });
        task.updated_at = Utc::now();
        tracing::info!(task_id, message, "task error recorded");
        self.persist_task_fields(&task).await
    }

    /// Set or clear the awaiting flag and type.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::Db`.
    pub async fn set_awaiting(
        &self,
        _guard: &LockGuard,
        task_id: &str,
        awaiting: Option<AwaitingType>,
    ) -> Result<()> {
        let mut task = self.require_task(task_id).await?;
        task.awaiting_response = awaiting.is_some();
        task.awaiting_type = awaiting;
        task.updated_at = Utc::now();
        self.persist_task_fields(&task).await
    }

    /// Increment the generation retry counter, returning the new value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::Db`.
    pub async fn bump_retry_count(&self, _guard: &LockGuard, task_id: &str) -> Result<u32> {
        let mut task = self.require_task(task_id).await?;
        task.retry_count += 1;
        task.updated_at = Utc::now();
        self.persist_task_fields(&task).await?;
        Ok(task.retry_count)
    }

    /// Finalize a task and advance the session queue.
    ///
    /// The task is marked `Completed` unless already terminal (terminal
    /// statuses are kept). The active slot is cleared and the queue head,
    /// if any, is popped and activated. Returns the next task id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on persistence failure.
    pub async fn mark_completed(
        &self,
        guard: &LockGuard,
        key: &SessionKey,
        task_id: &str,
    ) -> Result<Option<String>> {
        let Some(mut state) = self.load(key).await? else {
            return Ok(None);
        };

        let mut prev_status = None;
        if let Some(task) = state.tasks.get_mut(task_id) {
            prev_status = Some(task.status);
            if !task.status.is_terminal() {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(Utc::now());
            }
            task.awaiting_response = false;
            task.awaiting_type = None;
            task.updated_at = Utc::now();
        }

        if state.session.active_task_id.as_deref() == Some(task_id) {
            state.session.active_task_id = None;
        }
        let next_task_id = if state.session.task_queue.is_empty() {
            None
        } else {
            let next = state.session.task_queue.remove(0);
            state.session.active_task_id = Some(next.clone());
            Some(next)
        };
        state.session.updated_at = Utc::now();

        self.save(guard, &state).await?;
        tracing::info!(
            session = %key,
            task_id,
            prev_status = prev_status.map_or("?", TaskStatus::as_str),
            next_task_id = next_task_id.as_deref().unwrap_or("none"),
            "task finalized, queue advanced"
        );
        Ok(next_task_id)
    }

    /// Clear the active slot without touching any task status, then advance
    /// the queue. Pure queue management for ghost cleanup.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on persistence failure.
    pub async fn clear_active_and_advance(
        &self,
        guard: &LockGuard,
        key: &SessionKey,
    ) -> Result<Option<String>> {
        let Some(mut state) = self.load(key).await? else {
            return Ok(None);
        };
        state.session.active_task_id = None;
        let next_task_id = if state.session.task_queue.is_empty() {
            None
        } else {
            let next = state.session.task_queue.remove(0);
            state.session.active_task_id = Some(next.clone());
            Some(next)
        };
        state.session.updated_at = Utc::now();
        self.persist_session_row(&state.session).await?;
        Ok(next_task_id)
    }

    /// Find a task by id across all sessions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on query failure.
    pub async fn find_by_task_id(&self, task_id: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT task_id, status, user_input, dry_run, test_mode, webhook_url, plan, \
             diffs, new_contents, written_files, errors, retry_count, awaiting_response, \
             awaiting_type, created_at, updated_at, completed_at \
             FROM task WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Find the session key owning a task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on query failure.
    pub async fn find_session_by_task_id(&self, task_id: &str) -> Result<Option<SessionKey>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT chat_id, source FROM task WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(chat_id, source)| SessionKey::new(chat_id, source)))
    }

    /// List every session key on record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on query failure.
    pub async fn list_session_keys(&self) -> Result<Vec<SessionKey>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT chat_id, source FROM session ORDER BY chat_id, source")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(chat_id, source)| SessionKey::new(chat_id, source))
            .collect())
    }

    /// List session keys last touched before `cutoff` (retention input).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on query failure.
    pub async fn list_keys_updated_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionKey>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT chat_id, source FROM session WHERE updated_at < ?")
                .bind(cutoff.to_rfc3339())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(chat_id, source)| SessionKey::new(chat_id, source))
            .collect())
    }

    /// Delete a session and all of its tasks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on statement failure.
    pub async fn delete_session(&self, key: &SessionKey) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM task WHERE chat_id = ? AND source = ?")
            .bind(&key.chat_id)
            .bind(&key.source)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM session WHERE chat_id = ? AND source = ?")
            .bind(&key.chat_id)
            .bind(&key.source)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Aggregate counts for the health endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on query failure.
    pub async fn counts(&self) -> Result<StoreCounts> {
        let (sessions,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM session")
            .fetch_one(&self.pool)
            .await?;
        let (active,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM session WHERE active_task_id IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task")
            .fetch_one(&self.pool)
            .await?;

        let queues: Vec<(String,)> = sqlx::query_as("SELECT task_queue FROM session")
            .fetch_all(&self.pool)
            .await?;
        let queued: usize = queues
            .iter()
            .map(|(raw,)| {
                parse_json::<Vec<String>>(raw, "task_queue").map_or(0, |queue| queue.len())
            })
            .sum();

        Ok(StoreCounts {
            sessions: u64::try_from(sessions).unwrap_or(0),
            active_tasks: u64::try_from(active).unwrap_or(0),
            queued_tasks: u64::try_from(queued).unwrap_or(u64::MAX),
            total_tasks: u64::try_from(total).unwrap_or(0),
        })
    }

    async fn require_task(&self, task_id: &str) -> Result<Task> {
        self.find_by_task_id(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))
    }

    async fn persist_session_row(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "UPDATE session SET active_task_id = ?, task_queue = ?, updated_at = ? \
             WHERE chat_id = ? AND source = ?",
        )
        .bind(&session.active_task_id)
        .bind(to_json(&session.task_queue, "task_queue")?)
        .bind(session.updated_at.to_rfc3339())
        .bind(&session.key.chat_id)
        .bind(&session.key.source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_task_fields(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "UPDATE task SET status = ?, plan = ?, diffs = ?, new_contents = ?, \
             written_files = ?, errors = ?, retry_count = ?, awaiting_response = ?, \
             awaiting_type = ?, updated_at = ?, completed_at = ? WHERE task_id = ?",
        )
        .bind(task.status.as_str())
        .bind(
            task.plan
                .as_ref()
                .map(|plan| to_json(plan, "plan"))
                .transpose()?,
        )
        .bind(to_json(&task.diffs, "diffs")?)
        .bind(to_json(&task.new_contents, "new_contents")?)
        .bind(to_json(&task.written_files, "written_files")?)
        .bind(to_json(&task.errors, "errors")?)
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.awaiting_response))
        .bind(task.awaiting_type.map(AwaitingType::as_str))
        .bind(task.updated_at.to_rfc3339())
        .bind(task.completed_at.map(|at| at.to_rfc3339()))
        .bind(&task.task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn upsert_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session: &Session,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO session (chat_id, source, active_task_id, task_queue, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(chat_id, source) DO UPDATE SET \
         active_task_id = excluded.active_task_id, \
         task_queue = excluded.task_queue, \
         updated_at = excluded.updated_at",
    )
    .bind(&session.key.chat_id)
    .bind(&session.key.source)
    .bind(&session.active_task_id)
    .bind(to_json(&session.task_queue, "task_queue")?)
    .bind(session.created_at.to_rfc3339())
    .bind(session.updated_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_task(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: &SessionKey,
    task: &Task,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task (task_id, chat_id, source, status, user_input, dry_run, test_mode, \
         webhook_url, plan, diffs, new_contents, written_files, errors, retry_count, \
         awaiting_response, awaiting_type, created_at, updated_at, completed_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(task_id) DO UPDATE SET \
         status = excluded.status, \
         plan = excluded.plan, \
         diffs = excluded.diffs, \
         new_contents = excluded.new_contents, \
         written_files = excluded.written_files, \
         errors = excluded.errors, \
         retry_count = excluded.retry_count, \
         awaiting_response = excluded.awaiting_response, \
         awaiting_type = excluded.awaiting_type, \
         updated_at = excluded.updated_at, \
         completed_at = excluded.completed_at",
    )
    .bind(&task.task_id)
    .bind(&key.chat_id)
    .bind(&key.source)
    .bind(task.status.as_str())
    .bind(&task.user_input)
    .bind(i64::from(task.dry_run))
    .bind(i64::from(task.test_mode))
    .bind(&task.webhook_url)
    .bind(
        task.plan
            .as_ref()
            .map(|plan| to_json(plan, "plan"))
            .transpose()?,
    )
    .bind(to_json(&task.diffs, "diffs")?)
    .bind(to_json(&task.new_contents, "new_contents")?)
    .bind(to_json(&task.written_files, "written_files")?)
    .bind(to_json(&task.errors, "errors")?)
    .bind(i64::from(task.retry_count))
    .bind(i64::from(task.awaiting_response))
    .bind(task.awaiting_type.map(AwaitingType::as_str))
    .bind(task.created_at.to_rfc3339())
    .bind(task.updated_at.to_rfc3339())
    .bind(task.completed_at.map(|at| at.to_rfc3339()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}
