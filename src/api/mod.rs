//! HTTP submission surface and operator endpoints.
//!
//! Thin layer over the [`Runner`]: submission is a quick ack, task reads
//! are lock-free snapshots, and human input is routed to the awaiting
//! task. Operator routes expose breaker snapshots/reset and the session
//! retention sweep.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::session::SessionKey;
use crate::models::task::{Task, TaskError, TaskFlags};
use crate::store::retention;
use crate::worker::runner::{SubmitReceipt, TaskInput};
use crate::worker::Runner;
use crate::{AppError, Result};

/// Shared state handed to every handler.
pub struct AppState {
    /// The task runner.
    pub runner: Arc<Runner>,
}

/// JSON error body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Wrapper mapping [`AppError`] onto HTTP responses.
struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::LockTimeout(_) | AppError::BreakerOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Submission request body.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// The change instruction.
    pub instruction: String,
    /// Requester identifier.
    pub chat_id: String,
    /// Inbound channel; defaults to `http`.
    #[serde(default = "default_source")]
    pub source: String,
    /// Preview mode.
    #[serde(default)]
    pub dry_run: bool,
    /// Deterministic test scenario mode.
    #[serde(default)]
    pub test_mode: bool,
    /// Optional completion callback URL.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_source() -> String {
    "http".into()
}

/// Task snapshot returned by read and input endpoints.
#[derive(Debug, Serialize)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub task_id: String,
    /// Status string.
    pub status: String,
    /// 0 when active, 1-based queue index when queued.
    pub position_in_queue: usize,
    /// Whether the task is waiting on external input.
    pub awaiting_input: bool,
    /// Which input it waits on, if any.
    pub awaiting_type: Option<String>,
    /// Preview mode flag.
    pub dry_run: bool,
    /// Test scenario flag.
    pub test_mode: bool,
    /// Paths the staged change touches.
    pub files: Vec<String>,
    /// Accumulated error log.
    pub errors: Vec<TaskError>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Terminal timestamp, if reached.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    fn from_task(task: Task, position_in_queue: usize) -> Self {
        Self {
            task_id: task.task_id,
            status: task.status.as_str().to_owned(),
            position_in_queue,
            awaiting_input: task.awaiting_response,
            awaiting_type: task.awaiting_type.map(|t| t.as_str().to_owned()),
            dry_run: task.dry_run,
            test_mode: task.test_mode,
            files: task.diffs.keys().cloned().collect(),
            errors: task.errors,
            created_at: task.created_at,
            updated_at: task.updated_at,
            completed_at: task.completed_at,
        }
    }
}

/// Build the API router.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/worker/task", post(submit_task))
        .route("/worker/task/{task_id}", get(get_task))
        .route("/worker/task/{task_id}/input", post(task_input))
        .route("/health", get(health))
        .route("/breaker/{key}/reset", post(reset_breaker))
        .route("/sessions/sweep", post(sweep_sessions))
        .with_state(state)
}

/// Serve the router until the cancellation token fires.
///
/// # Errors
///
/// Returns `AppError::Io` if the listener cannot bind or the server fails.
pub async fn serve(state: Arc<AppState>, cancel: CancellationToken) -> Result<()> {
    let port = state.runner.config().http_port;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|err| AppError::Io(format!("cannot bind port {port}: {err}")))?;
    info!(port, "submission surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("http server failed: {err}")))
}

async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitRequest>,
) -> std::result::Result<Json<SubmitReceipt>, ApiError> {
    if body.instruction.trim().is_empty() {
        return Err(AppError::InvalidInput("instruction must not be empty".into()).into());
    }
    let key = SessionKey::new(body.chat_id, body.source);
    let flags = TaskFlags {
        dry_run: body.dry_run,
        test_mode: body.test_mode,
        webhook_url: body.webhook_url,
    };
    let receipt = state.runner.submit(&key, &body.instruction, flags).await?;
    Ok(Json(receipt))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<TaskSnapshot>, ApiError> {
    let task = state
        .runner
        .store()
        .find_by_task_id(&task_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))?;
    let position = snapshot_position(&state, &task_id).await?;
    Ok(Json(TaskSnapshot::from_task(task, position)))
}

async fn task_input(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(input): Json<TaskInput>,
) -> std::result::Result<Json<TaskSnapshot>, ApiError> {
    let task = state.runner.handle_input(&task_id, input).await?;
    let position = snapshot_position(&state, &task_id).await?;
    Ok(Json(TaskSnapshot::from_task(task, position)))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    sessions: u64,
    active_tasks: u64,
    queued_tasks: u64,
    total_tasks: u64,
    breakers: std::collections::HashMap<String, crate::breaker::BreakerSnapshot>,
}

async fn health(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<Json<HealthResponse>, ApiError> {
    let counts = state.runner.store().counts().await?;
    Ok(Json(HealthResponse {
        status: "ok".into(),
        sessions: counts.sessions,
        active_tasks: counts.active_tasks,
        queued_tasks: counts.queued_tasks,
        total_tasks: counts.total_tasks,
        breakers: state.runner.breakers().snapshot_all(),
    }))
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    key: String,
    reset: bool,
}

async fn reset_breaker(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> std::result::Result<Json<ResetResponse>, ApiError> {
    if !state.runner.breakers().reset(&key) {
        return Err(AppError::NotFound(format!("breaker {key} has never been used")).into());
    }
    info!(key, "breaker reset by operator");
    Ok(Json(ResetResponse { key, reset: true }))
}

#[derive(Debug, Deserialize)]
struct SweepRequest {
    days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SweepResponse {
    removed: usize,
}

async fn sweep_sessions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SweepRequest>,
) -> std::result::Result<Json<SweepResponse>, ApiError> {
    let days = body.days.unwrap_or(state.runner.config().retention_days);
    let removed = retention::purge(state.runner.store(), i64::from(days)).await?;
    info!(days, removed, "operator retention sweep");
    Ok(Json(SweepResponse { removed }))
}

async fn snapshot_position(state: &Arc<AppState>, task_id: &str) -> Result<usize> {
    let Some(key) = state.runner.store().find_session_by_task_id(task_id).await? else {
        return Ok(0);
    };
    let Some(session_state) = state.runner.store().load(&key).await? else {
        return Ok(0);
    };
    Ok(session_state.queue_position(task_id).unwrap_or(0))
}
