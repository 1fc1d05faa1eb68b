//! One-time migration of first-generation JSON session files into `SQLite`.
//!
//! The original deployment persisted one JSON file per session under
//! `data/sessions/`. On startup, any such files are imported into the
//! database, renamed with a `.migrated` suffix, and a marker file is
//! written so the scan never runs twice. No other component ever sees the
//! legacy format — the store exposes a single backend.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::lock::LockManager;
use crate::models::session::{Session, SessionKey, SessionState};
use crate::models::task::{AwaitingType, Task, TaskError, TaskStatus};
use crate::store::SessionStore;
use crate::{AppError, Result};

const MIGRATION_MARKER: &str = ".migrated";

#[derive(Debug, Deserialize)]
struct LegacyState {
    #[serde(default = "default_chat_id")]
    chat_id: String,
    #[serde(default = "default_source")]
    source: String,
    #[serde(default)]
    tasks: BTreeMap<String, LegacyTask>,
    #[serde(default)]
    active_task_id: Option<String>,
    #[serde(default)]
    task_queue: Vec<String>,
}

fn default_chat_id() -> String {
    "default".into()
}

fn default_source() -> String {
    "http".into()
}

#[derive(Debug, Deserialize)]
struct LegacyTask {
    #[serde(default)]
    status: String,
    #[serde(default)]
    user_input: String,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    test_mode: bool,
    #[serde(default)]
    webhook_url: Option<String>,
    #[serde(default)]
    errors: Vec<LegacyError>,
    #[serde(default)]
    awaiting_response: bool,
    #[serde(default)]
    awaiting_type: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyError {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    message: String,
}

/// Import legacy JSON session files, returning how many were migrated.
///
/// Idempotent: a marker file short-circuits subsequent runs, and each
/// imported file is renamed so a crash mid-scan cannot double-import.
///
/// # Errors
///
/// Returns `AppError::Io` if the sessions directory cannot be scanned.
/// Individual unreadable files are logged and skipped, never fatal.
pub async fn migrate_legacy_sessions(
    store: &SessionStore,
    locks: &LockManager,
    sessions_dir: &Path,
    lock_timeout: std::time::Duration,
) -> Result<usize> {
    let marker = sessions_dir.join(MIGRATION_MARKER);
    if marker.exists() {
        return Ok(0);
    }
    if !sessions_dir.exists() {
        std::fs::create_dir_all(sessions_dir)
            .map_err(|err| AppError::Io(format!("failed to create sessions dir: {err}")))?;
        touch(&marker)?;
        return Ok(0);
    }

    let entries = std::fs::read_dir(sessions_dir)
        .map_err(|err| AppError::Io(format!("failed to scan sessions dir: {err}")))?;

    let mut migrated = 0;
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }

        match import_file(store, locks, &path, lock_timeout).await {
            Ok(key) => {
                migrated += 1;
                let renamed = path.with_extension("json.migrated");
                if let Err(err) = std::fs::rename(&path, &renamed) {
                    tracing::warn!(file = %path.display(), %err, "failed to rename migrated file");
                }
                tracing::info!(session = %key, file = %path.display(), "legacy session migrated");
            }
            Err(err) => {
                tracing::warn!(file = %path.display(), %err, "skipping unreadable legacy session");
            }
        }
    }

    touch(&marker)?;
    if migrated > 0 {
        tracing::info!(migrated, "legacy session migration complete");
    }
    Ok(migrated)
}

async fn import_file(
    store: &SessionStore,
    locks: &LockManager,
    path: &Path,
    lock_timeout: std::time::Duration,
) -> Result<SessionKey> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| AppError::Io(format!("read failed: {err}")))?;
    let legacy: LegacyState = serde_json::from_str(&raw)
        .map_err(|err| AppError::Io(format!("invalid legacy state: {err}")))?;

    let key = SessionKey::new(legacy.chat_id, legacy.source);
    let now = Utc::now();

    let mut tasks = BTreeMap::new();
    for (task_id, legacy_task) in legacy.tasks {
        tasks.insert(task_id.clone(), convert_task(task_id, legacy_task, now));
    }

    let mut state = SessionState {
        session: Session {
            key: key.clone(),
            active_task_id: legacy.active_task_id,
            task_queue: legacy.task_queue,
            created_at: now,
            updated_at: now,
        },
        tasks,
    };
    state.check_invariants();

    let store = store.clone();
    locks
        .with_lock(&key, lock_timeout, |guard| {
            let state = state.clone();
            async move { store.save(&guard, &state).await }
        })
        .await?;
    Ok(key)
}

fn convert_task(task_id: String, legacy: LegacyTask, fallback: DateTime<Utc>) -> Task {
    // First-generation files carried statuses the current machine dropped.
    let status = match legacy.status.as_str() {
        "queued" => TaskStatus::Planning,
        "approved" => TaskStatus::WritingFiles,
        other => TaskStatus::parse(other).unwrap_or(TaskStatus::Failed),
    };
    let parse_ts = |raw: Option<&str>| {
        raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or(fallback, |dt| dt.with_timezone(&Utc))
    };
    Task {
        task_id,
        status,
        user_input: legacy.user_input,
        dry_run: legacy.dry_run,
        test_mode: legacy.test_mode,
        webhook_url: legacy.webhook_url,
        plan: None,
        diffs: BTreeMap::new(),
        new_contents: BTreeMap::new(),
        written_files: BTreeMap::new(),
        errors: legacy
            .errors
            .into_iter()
            .map(|err| TaskError {
                timestamp: parse_ts(err.timestamp.as_deref()),
                message: err.message,
            })
            .collect(),
        retry_count: 0,
        awaiting_response: legacy.awaiting_response,
        awaiting_type: legacy.awaiting_type.as_deref().and_then(AwaitingType::parse),
        created_at: parse_ts(legacy.created_at.as_deref()),
        updated_at: parse_ts(legacy.updated_at.as_deref()),
        completed_at: None,
    }
}

fn touch(marker: &Path) -> Result<()> {
    std::fs::write(marker, Utc::now().to_rfc3339())
        .map_err(|err| AppError::Io(format!("failed to write migration marker: {err}")))
}
