//! Pipeline runner: drives one task through its status machine.
//!
//! Collaborator I/O (planner, transport, probe) happens outside any
//! session lock; every store mutation happens inside a short
//! [`with_lock`](crate::lock::LockManager::with_lock) closure. A run
//! cancelled mid-flight therefore never leaves a lock held.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::breaker::BreakerRegistry;
use crate::config::GlobalConfig;
use crate::healing;
use crate::lock::LockManager;
use crate::models::session::SessionKey;
use crate::models::task::{AwaitingType, Task, TaskFlags, TaskStatus};
use crate::notify::CompletionNotifier;
use crate::planner::{
    parse_plan, validate_generated, ChatMessage, Complexity, Plan, Planner, Role,
    GENERATE_FILE_MARKER, PLAN_MARKER,
};
use crate::probe::HealthProbe;
use crate::retry::{at_least_one_attempt, retry_async, RetryPolicy};
use crate::store::SessionStore;
use crate::transport::{FileTransport, PathKind};
use crate::worker::{classify, StepOutcome};
use crate::{AppError, Result};

/// Breaker key isolating the remote file transport.
pub const TRANSPORT_BREAKER_KEY: &str = "transport";

/// Quick-ack receipt returned on submission.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubmitReceipt {
    /// Assigned task identifier.
    pub task_id: String,
    /// Always `queued` — submission never executes inline.
    pub status: String,
    /// 0 when the task became active, 1-based queue index otherwise.
    pub position_in_queue: usize,
}

/// Human input forwarded to an awaiting task.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TaskInput {
    /// Yes/no decision for an approval gate.
    pub approval: Option<bool>,
    /// Free-text answer to open planning questions.
    pub answer: Option<String>,
}

/// Executes tasks against the store and the external collaborators.
pub struct Runner {
    config: Arc<GlobalConfig>,
    store: SessionStore,
    locks: Arc<LockManager>,
    breakers: Arc<BreakerRegistry>,
    planner: Arc<dyn Planner>,
    transport: Arc<dyn FileTransport>,
    probe: Arc<dyn HealthProbe>,
    notifier: Arc<dyn CompletionNotifier>,
}

impl Runner {
    /// Assemble a runner from its injected parts.
    #[must_use]
    #[allow(clippy::too_many_arguments)] // Startup wiring; called once from main.
    pub fn new(
        config: Arc<GlobalConfig>,
        store: SessionStore,
        locks: Arc<LockManager>,
        breakers: Arc<BreakerRegistry>,
        planner: Arc<dyn Planner>,
        transport: Arc<dyn FileTransport>,
        probe: Arc<dyn HealthProbe>,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> Self {
        Self {
            config,
            store,
            locks,
            breakers,
            planner,
            transport,
            probe,
            notifier,
        }
    }

    /// The session/task store this runner mutates.
    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// The lock manager guarding this runner's sessions.
    #[must_use]
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// The breaker registry isolating this runner's dependencies.
    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// The global configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<GlobalConfig> {
        &self.config
    }

    fn retry_policy(&self) -> RetryPolicy {
        at_least_one_attempt(RetryPolicy::new(
            self.config.generation.planner_attempts,
            Duration::from_millis(self.config.generation.retry_initial_delay_ms),
            self.config.generation.retry_backoff_multiplier,
        ))
    }

    fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout()
    }

    // ── Submission ───────────────────────────────────────────────

    /// Create a task and return a quick ack — never executes inline.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockTimeout` if the session lock cannot be
    /// acquired, or `AppError::Db` on persistence failure.
    pub async fn submit(
        &self,
        key: &SessionKey,
        instruction: &str,
        flags: TaskFlags,
    ) -> Result<SubmitReceipt> {
        let store = self.store.clone();
        let (task_id, position) = self
            .locks
            .with_lock(key, self.lock_timeout(), |guard| {
                let flags = flags.clone();
                async move { store.create_task(&guard, guard.key(), instruction, flags).await }
            })
            .await?;
        Ok(SubmitReceipt {
            task_id,
            status: "queued".into(),
            position_in_queue: position,
        })
    }

    // ── Execution ────────────────────────────────────────────────

    /// Run the active task's automatic stages until it pauses for input.
    ///
    /// Pipeline failures are recorded on the task (error entry, `Failed`,
    /// queue advanced) rather than propagated; only a lock timeout
    /// reaches the caller, who may simply retry next tick.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockTimeout` when the session lock was
    /// contended, or `AppError::Db` if even the failure could not be
    /// recorded.
    pub async fn run_active(&self, key: &SessionKey, task_id: &str) -> Result<()> {
        match self.pipeline(key, task_id).await {
            Ok(()) => Ok(()),
            Err(err) => match classify(&err) {
                StepOutcome::LockTimeout(msg) => Err(AppError::LockTimeout(msg)),
                StepOutcome::Retryable(msg)
                | StepOutcome::Fatal(msg)
                | StepOutcome::BreakerOpen(msg) => self.fail_task(key, task_id, &msg).await,
            },
        }
    }

    async fn pipeline(&self, key: &SessionKey, task_id: &str) -> Result<()> {
        let task = self.require_task(task_id).await?;
        if task.status.is_terminal() || task.awaiting_response {
            return Ok(());
        }

        let plan = if task.status == TaskStatus::Planning {
            match self.plan_stage(key, &task).await? {
                Some(plan) => plan,
                None => return Ok(()), // paused on open questions
            }
        } else {
            self.stored_plan(&task)?
        };

        let originals = self.read_stage(key, task_id, &plan).await?;
        self.generate_stage(key, &task, &plan, &originals).await?;
        Ok(())
    }

    /// Planning: one planner call, then either pause on open questions or
    /// hand the parsed plan to the next stage.
    async fn plan_stage(&self, key: &SessionKey, task: &Task) -> Result<Option<Plan>> {
        let mut messages = vec![
            ChatMessage::new(Role::System, PLAN_MARKER),
            ChatMessage::new(Role::User, &task.user_input),
        ];
        for answer in stored_answers(task) {
            messages.push(ChatMessage::new(Role::User, answer));
        }

        let policy = self.retry_policy();
        let raw = retry_async(policy, "planner.plan", || {
            self.planner.generate(&messages, Complexity::Standard)
        })
        .await?;
        let plan = parse_plan(&raw)?;
        if plan.files.is_empty() && plan.questions.is_empty() {
            return Err(AppError::Planner("plan names no files and asks nothing".into()));
        }

        let mut blob = serde_json::to_value(&plan)
            .map_err(|err| AppError::Planner(format!("cannot encode plan: {err}")))?;
        if let Some(answers) = task.plan.as_ref().and_then(|p| p.get("answers")) {
            blob["answers"] = answers.clone();
        }

        let task_id = task.task_id.to_owned();
        let pause = !plan.questions.is_empty();
        let store = self.store.clone();
        self.locks
            .with_lock(key, self.lock_timeout(), |guard| async move {
                store.set_plan(&guard, &task_id, blob).await?;
                if pause {
                    store
                        .set_awaiting(&guard, &task_id, Some(AwaitingType::AnswerQuestions))
                        .await?;
                }
                Ok(())
            })
            .await?;

        if pause {
            tracing::info!(session = %key, task_id = task.task_id, "plan has open questions, pausing");
            return Ok(None);
        }
        Ok(Some(plan))
    }

    /// Reading: fetch current content for every planned file through the
    /// transport breaker. Missing files read as empty (new file).
    async fn read_stage(
        &self,
        key: &SessionKey,
        task_id: &str,
        plan: &Plan,
    ) -> Result<BTreeMap<String, String>> {
        self.set_status(key, task_id, TaskStatus::ReadingFiles).await?;

        let breaker = self.breakers.get(TRANSPORT_BREAKER_KEY);
        let policy = self.retry_policy();
        let mut originals = BTreeMap::new();
        for path in &plan.files {
            if !breaker.is_call_permitted() {
                return Err(AppError::BreakerOpen(format!(
                    "circuit breaker '{TRANSPORT_BREAKER_KEY}' is open"
                )));
            }
            let outcome = async {
                match retry_async(policy, "transport.path_type", || self.transport.path_type(path))
                    .await?
                {
                    PathKind::NotFound => Ok(String::new()),
                    PathKind::Directory => Err(AppError::Transport(format!(
                        "{path} is a directory, expected a file"
                    ))),
                    PathKind::File => {
                        retry_async(policy, "transport.read", || self.transport.read(path)).await
                    }
                }
            }
            .await;
            match outcome {
                Ok(content) => {
                    breaker.record_success();
                    originals.insert(path.clone(), content);
                }
                Err(err) => {
                    breaker.record_failure();
                    return Err(err);
                }
            }
        }
        Ok(originals)
    }

    /// Generation: produce replacement content per file, validating each
    /// result and regenerating within the bounded retry budget; then stage
    /// diffs and pause for approval.
    async fn generate_stage(
        &self,
        key: &SessionKey,
        task: &Task,
        plan: &Plan,
        originals: &BTreeMap<String, String>,
    ) -> Result<()> {
        let task_id = &task.task_id;
        self.set_status(key, task_id, TaskStatus::GeneratingCode).await?;

        let complexity = match plan.files.len() {
            0 | 1 => Complexity::Simple,
            2 | 3 => Complexity::Standard,
            _ => Complexity::Complex,
        };
        let policy = self.retry_policy();
        let max_retries = self.config.generation.max_generation_retries;

        let mut contents = BTreeMap::new();
        let mut diffs = BTreeMap::new();
        for path in &plan.files {
            let empty = String::new();
            let original = originals.get(path).unwrap_or(&empty);
            let content = loop {
                let messages = vec![
                    ChatMessage::new(Role::System, format!("{GENERATE_FILE_MARKER}{path}")),
                    ChatMessage::new(Role::Assistant, &plan.summary),
                    ChatMessage::new(Role::User, &task.user_input),
                ];
                let generated = retry_async(policy, "planner.generate_file", || {
                    self.planner.generate(&messages, complexity)
                })
                .await?;

                match validate_generated(path, &generated) {
                    Ok(()) => break generated,
                    Err(err) => {
                        let message = err.to_string();
                        let count = self.record_generation_retry(key, task_id, &message).await?;
                        if count > max_retries {
                            // Budget exhausted: surface the flawed result to
                            // the human approver instead of failing outright.
                            tracing::warn!(
                                task_id,
                                path,
                                retry_count = count,
                                "generation retries exhausted, surfacing to approver"
                            );
                            break generated;
                        }
                    }
                }
            };
            diffs.insert(path.clone(), diffy::create_patch(original, &content).to_string());
            contents.insert(path.clone(), content);
        }

        let store = self.store.clone();
        let task_id_owned = task_id.clone();
        self.locks
            .with_lock(key, self.lock_timeout(), |guard| async move {
                store
                    .store_new_contents(&guard, &task_id_owned, contents)
                    .await?;
                store.store_diffs(&guard, &task_id_owned, diffs).await?;
                store
                    .update_status(&guard, &task_id_owned, TaskStatus::DiffReady)
                    .await?;
                store
                    .set_awaiting(&guard, &task_id_owned, Some(AwaitingType::Approval))
                    .await?;
                Ok(())
            })
            .await?;
        tracing::info!(session = %key, task_id, "diff ready, awaiting approval");
        Ok(())
    }

    // ── Human input ──────────────────────────────────────────────

    /// Route human input (approval decision or answer) to the active task.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` — unknown task id;
    /// - `AppError::Conflict` — the task is queued, not active;
    /// - `AppError::InvalidInput` — neither approval nor answer supplied,
    ///   or the task is not awaiting that kind of input;
    /// - `AppError::LockTimeout` — session lock contention.
    pub async fn handle_input(&self, task_id: &str, input: TaskInput) -> Result<Task> {
        if input.approval.is_none() && input.answer.is_none() {
            return Err(AppError::InvalidInput(
                "provide either 'approval' (true/false) or 'answer' (string)".into(),
            ));
        }

        let key = self
            .store
            .find_session_by_task_id(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))?;
        let state = self
            .store
            .load(&key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))?;
        if state.session.active_task_id.as_deref() != Some(task_id) {
            return Err(AppError::Conflict(
                "task is queued; input only accepted for the active task".into(),
            ));
        }
        let task = self.require_task(task_id).await?;

        match task.awaiting_type {
            Some(AwaitingType::Approval) => {
                let approved = input.approval.ok_or_else(|| {
                    AppError::InvalidInput("task is awaiting an approval decision".into())
                })?;
                if approved {
                    if let Err(err) = self.execute_changes(&key, task_id).await {
                        match classify(&err) {
                            StepOutcome::LockTimeout(msg) => {
                                return Err(AppError::LockTimeout(msg));
                            }
                            StepOutcome::Retryable(msg)
                            | StepOutcome::Fatal(msg)
                            | StepOutcome::BreakerOpen(msg) => {
                                self.fail_task(&key, task_id, &msg).await?;
                            }
                        }
                    }
                } else {
                    self.reject_task(&key, task_id, "changes rejected by requester")
                        .await?;
                }
            }
            Some(AwaitingType::DeployApproval) => {
                let approved = input.approval.ok_or_else(|| {
                    AppError::InvalidInput("task is awaiting a deploy decision".into())
                })?;
                if approved {
                    self.confirm_deploy(&key, task_id).await?;
                } else {
                    self.roll_back_and_close(&key, task_id, "deploy rejected by requester")
                        .await?;
                }
            }
            Some(AwaitingType::AnswerQuestions) => {
                let answer = input.answer.ok_or_else(|| {
                    AppError::InvalidInput("task is awaiting answers, not an approval".into())
                })?;
                self.accept_answer(&key, task_id, &answer).await?;
                self.run_active(&key, task_id).await?;
            }
            Some(AwaitingType::ContinueOperation) => {
                let approved = input.approval.ok_or_else(|| {
                    AppError::InvalidInput("task is awaiting a resume decision".into())
                })?;
                if approved {
                    self.resume_task(&key, task_id).await?;
                } else {
                    self.reject_task(&key, task_id, "resume declined by requester")
                        .await?;
                }
            }
            None => {
                return Err(AppError::InvalidInput(
                    "task is not awaiting any input".into(),
                ));
            }
        }

        self.require_task(task_id).await
    }

    /// Approved diff: write files, verify the deployment, and either pause
    /// for deploy confirmation or auto-heal.
    async fn execute_changes(&self, key: &SessionKey, task_id: &str) -> Result<()> {
        let task = self.require_task(task_id).await?;

        if task.dry_run {
            let files: Vec<&String> = task.diffs.keys().collect();
            let result = json!({
                "dry_run": true,
                "files_modified": files,
            });
            self.finalize(key, task_id).await?;
            self.notify_task(&task, "completed", result).await;
            tracing::info!(session = %key, task_id, "dry-run complete, no files written");
            return Ok(());
        }

        if task.new_contents.is_empty() {
            return Err(AppError::InvalidInput("no generated contents to write".into()));
        }

        let store = self.store.clone();
        self.locks
            .with_lock(key, self.lock_timeout(), |guard| {
                let task_id = task_id.to_owned();
                async move {
                    store.set_awaiting(&guard, &task_id, None).await?;
                    store
                        .update_status(&guard, &task_id, TaskStatus::WritingFiles)
                        .await?;
                    Ok(())
                }
            })
            .await?;

        let breaker = self.breakers.get(TRANSPORT_BREAKER_KEY);
        let policy = self.retry_policy();
        let mut written = 0usize;
        let mut write_errors = Vec::new();
        for (path, content) in &task.new_contents {
            if !breaker.is_call_permitted() {
                write_errors.push(format!(
                    "{path}: circuit breaker '{TRANSPORT_BREAKER_KEY}' is open"
                ));
                continue;
            }
            match retry_async(policy, "transport.write", || self.transport.write(path, content))
                .await
            {
                Ok(backup) => {
                    breaker.record_success();
                    written += 1;
                    self.with_session_lock(key, |store, guard| {
                        let task_id = task_id.to_owned();
                        let path = path.clone();
                        async move {
                            store.record_written_file(&guard, &task_id, &path, backup).await
                        }
                    })
                    .await?;
                }
                Err(err) => {
                    breaker.record_failure();
                    let message = format!("write of {path} failed: {err}");
                    write_errors.push(message.clone());
                    self.with_session_lock(key, |store, guard| {
                        let task_id = task_id.to_owned();
                        async move { store.append_error(&guard, &task_id, &message).await }
                    })
                    .await?;
                }
            }
        }

        if written == 0 {
            return Err(AppError::Transport(format!(
                "all writes failed: {}",
                write_errors.join("; ")
            )));
        }

        self.set_status(key, task_id, TaskStatus::Completed).await?;

        // Post-write verification with automatic rollback.
        let task = self.require_task(task_id).await?;
        let report =
            healing::verify_deployment(&task, &self.config.healing, &*self.probe, &self.breakers)
                .await;
        self.record_verification(key, task_id, &report).await?;

        if report.healthy {
            self.with_session_lock(key, |store, guard| {
                let task_id = task_id.to_owned();
                async move {
                    store
                        .set_awaiting(&guard, &task_id, Some(AwaitingType::DeployApproval))
                        .await
                }
            })
            .await?;
            tracing::info!(session = %key, task_id, "deployment healthy, awaiting deploy approval");
            return Ok(());
        }

        // Unhealthy: restore every written file and close the task out
        // without asking a human to confirm a known-bad deployment.
        let summary = healing::roll_back_written_files(&task, &*self.transport).await;
        let reason = format!(
            "deployment health check failed (status {:?}): {}",
            report.status_code,
            report.error.as_deref().unwrap_or("non-2xx response")
        );
        self.with_session_lock(key, |store, guard| {
            let task_id = task_id.to_owned();
            let reason = reason.clone();
            async move {
                store.append_error(&guard, &task_id, &reason).await?;
                store
                    .update_status(&guard, &task_id, TaskStatus::RolledBack)
                    .await?;
                store.mark_completed(&guard, guard.key(), &task_id).await?;
                Ok(())
            }
        })
        .await?;

        let result = json!({
            "health_check": report,
            "files_restored": summary.restored,
            "restore_failures": summary.failures,
        });
        self.notify_task(&task, "auto_healed", result).await;
        tracing::warn!(session = %key, task_id, "deployment failed verification, auto-rollback executed");
        Ok(())
    }

    async fn confirm_deploy(&self, key: &SessionKey, task_id: &str) -> Result<()> {
        let task = self.require_task(task_id).await?;
        self.finalize(key, task_id).await?;
        let files: Vec<&String> = task.written_files.keys().collect();
        self.notify_task(&task, "completed", json!({ "files_modified": files }))
            .await;
        Ok(())
    }

    async fn roll_back_and_close(
        &self,
        key: &SessionKey,
        task_id: &str,
        reason: &str,
    ) -> Result<()> {
        let task = self.require_task(task_id).await?;
        let summary = healing::roll_back_written_files(&task, &*self.transport).await;
        self.with_session_lock(key, |store, guard| {
            let task_id = task_id.to_owned();
            let reason = reason.to_owned();
            async move {
                store.append_error(&guard, &task_id, &reason).await?;
                store
                    .update_status(&guard, &task_id, TaskStatus::RolledBack)
                    .await?;
                store.mark_completed(&guard, guard.key(), &task_id).await?;
                Ok(())
            }
        })
        .await?;
        let result = json!({
            "files_restored": summary.restored,
            "restore_failures": summary.failures,
        });
        self.notify_task(&task, "rolled_back", result).await;
        Ok(())
    }

    async fn accept_answer(&self, key: &SessionKey, task_id: &str, answer: &str) -> Result<()> {
        self.with_session_lock(key, |store, guard| {
            let task_id = task_id.to_owned();
            let answer = answer.to_owned();
            async move {
                let task = store
                    .find_by_task_id(&task_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))?;
                let mut blob = task.plan.unwrap_or_else(|| json!({}));
                let answers = blob
                    .as_object_mut()
                    .and_then(|obj| {
                        obj.entry("answers")
                            .or_insert_with(|| json!([]))
                            .as_array_mut()
                    })
                    .ok_or_else(|| AppError::Db("plan blob is not an object".into()))?;
                answers.push(json!(answer));
                store.set_plan(&guard, &task_id, blob).await?;
                store.set_awaiting(&guard, &task_id, None).await?;
                store
                    .update_status(&guard, &task_id, TaskStatus::Planning)
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn resume_task(&self, key: &SessionKey, task_id: &str) -> Result<()> {
        let task = self.require_task(task_id).await?;
        match task.status {
            TaskStatus::DiffReady => {
                self.with_session_lock(key, |store, guard| {
                    let task_id = task_id.to_owned();
                    async move {
                        store
                            .set_awaiting(&guard, &task_id, Some(AwaitingType::Approval))
                            .await
                    }
                })
                .await
            }
            TaskStatus::Completed => {
                self.with_session_lock(key, |store, guard| {
                    let task_id = task_id.to_owned();
                    async move {
                        store
                            .set_awaiting(&guard, &task_id, Some(AwaitingType::DeployApproval))
                            .await
                    }
                })
                .await
            }
            status if !status.is_terminal() => {
                // Mid-flight interruption: restart the automatic stages.
                self.with_session_lock(key, |store, guard| {
                    let task_id = task_id.to_owned();
                    async move {
                        store.set_awaiting(&guard, &task_id, None).await?;
                        store
                            .update_status(&guard, &task_id, TaskStatus::Planning)
                            .await?;
                        Ok(())
                    }
                })
                .await?;
                self.run_active(key, task_id).await
            }
            _ => Err(AppError::InvalidInput(
                "terminal task cannot be resumed".into(),
            )),
        }
    }

    // ── Failure & finalization ───────────────────────────────────

    /// Record a failure reason, mark the task `Failed`, and advance the
    /// session queue past it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockTimeout` or `AppError::Db`.
    pub async fn fail_task(&self, key: &SessionKey, task_id: &str, reason: &str) -> Result<()> {
        self.with_session_lock(key, |store, guard| {
            let task_id = task_id.to_owned();
            let reason = reason.to_owned();
            async move {
                store.append_error(&guard, &task_id, &reason).await?;
                store
                    .update_status(&guard, &task_id, TaskStatus::Failed)
                    .await?;
                store.mark_completed(&guard, guard.key(), &task_id).await?;
                Ok(())
            }
        })
        .await?;
        if let Some(task) = self.store.find_by_task_id(task_id).await? {
            self.notify_task(&task, "failed", json!({ "reason": reason }))
                .await;
        }
        Ok(())
    }

    async fn reject_task(&self, key: &SessionKey, task_id: &str, reason: &str) -> Result<()> {
        self.fail_task(key, task_id, reason).await
    }

    /// Mark interrupted mid-flight tasks as awaiting a resume decision.
    ///
    /// Called once at startup: nothing is running yet, so an active task
    /// stuck in a transient stage can only be a crash leftover.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the session scan fails.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for key in self.store.list_session_keys().await? {
            let Some(state) = self.store.load(&key).await? else {
                continue;
            };
            let Some(task) = state.active_task() else { continue };
            let mid_flight = matches!(
                task.status,
                TaskStatus::ReadingFiles | TaskStatus::GeneratingCode | TaskStatus::WritingFiles
            );
            if !mid_flight || task.awaiting_response {
                continue;
            }
            let task_id = task.task_id.clone();
            self.with_session_lock(&key, |store, guard| {
                let task_id = task_id.clone();
                async move {
                    store
                        .set_awaiting(&guard, &task_id, Some(AwaitingType::ContinueOperation))
                        .await
                }
            })
            .await?;
            tracing::info!(session = %key, task_id, "interrupted task awaiting resume decision");
            recovered += 1;
        }
        Ok(recovered)
    }

    // ── Internals ────────────────────────────────────────────────

    async fn require_task(&self, task_id: &str) -> Result<Task> {
        self.store
            .find_by_task_id(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))
    }

    fn stored_plan(&self, task: &Task) -> Result<Plan> {
        let blob = task
            .plan
            .as_ref()
            .ok_or_else(|| AppError::Planner("task has no stored plan".into()))?;
        serde_json::from_value(blob.clone())
            .map_err(|err| AppError::Planner(format!("stored plan unreadable: {err}")))
    }

    async fn set_status(&self, key: &SessionKey, task_id: &str, status: TaskStatus) -> Result<()> {
        self.with_session_lock(key, |store, guard| {
            let task_id = task_id.to_owned();
            async move {
                store.update_status(&guard, &task_id, status).await?;
                Ok(())
            }
        })
        .await
    }

    async fn record_generation_retry(
        &self,
        key: &SessionKey,
        task_id: &str,
        message: &str,
    ) -> Result<u32> {
        self.with_session_lock(key, |store, guard| {
            let task_id = task_id.to_owned();
            let message = message.to_owned();
            async move {
                store.append_error(&guard, &task_id, &message).await?;
                store.bump_retry_count(&guard, &task_id).await
            }
        })
        .await
    }

    async fn record_verification(
        &self,
        key: &SessionKey,
        task_id: &str,
        report: &crate::probe::HealthReport,
    ) -> Result<()> {
        let report_value = serde_json::to_value(report)
            .map_err(|err| AppError::Db(format!("cannot encode health report: {err}")))?;
        self.with_session_lock(key, |store, guard| {
            let task_id = task_id.to_owned();
            async move {
                let task = store
                    .find_by_task_id(&task_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))?;
                let mut blob = task.plan.unwrap_or_else(|| json!({}));
                blob["last_verification"] = report_value;
                store.set_plan(&guard, &task_id, blob).await
            }
        })
        .await
    }

    async fn finalize(&self, key: &SessionKey, task_id: &str) -> Result<()> {
        self.with_session_lock(key, |store, guard| {
            let task_id = task_id.to_owned();
            async move {
                store.set_awaiting(&guard, &task_id, None).await?;
                store.mark_completed(&guard, guard.key(), &task_id).await?;
                Ok(())
            }
        })
        .await
    }

    async fn notify_task(&self, task: &Task, status: &str, result: serde_json::Value) {
        if let Some(url) = &task.webhook_url {
            self.notifier.notify(url, &task.task_id, status, result).await;
        }
    }

    async fn with_session_lock<T, F, Fut>(&self, key: &SessionKey, f: F) -> Result<T>
    where
        F: FnOnce(SessionStore, crate::lock::LockGuard) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let store = self.store.clone();
        self.locks
            .with_lock(key, self.lock_timeout(), |guard| f(store, guard))
            .await
    }
}

fn stored_answers(task: &Task) -> Vec<String> {
    task.plan
        .as_ref()
        .and_then(|blob| blob.get("answers"))
        .and_then(|answers| answers.as_array())
        .map(|answers| {
            answers
                .iter()
                .filter_map(|a| a.as_str().map(ToOwned::to_owned))
                .collect()
        })
        .unwrap_or_default()
}
