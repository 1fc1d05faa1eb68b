//! Task model: status state machine, awaiting axis, and accumulated artifacts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status for a change task.
///
/// Terminal statuses ([`Completed`](Self::Completed), [`Failed`](Self::Failed),
/// [`RolledBack`](Self::RolledBack)) are protected: once reached, a task may
/// only move to another terminal status, never back to a non-terminal one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Planning the change from the user's instruction.
    Planning,
    /// Reading current file contents from the remote tree.
    ReadingFiles,
    /// Generating replacement file contents.
    GeneratingCode,
    /// Diff preview ready; waiting for human approval.
    DiffReady,
    /// Writing approved contents to the remote tree.
    WritingFiles,
    /// All writes applied.
    Completed,
    /// Task failed; reason recorded in `errors`.
    Failed,
    /// Written files restored from their backups.
    RolledBack,
}

impl TaskStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Determine whether a status transition is permitted.
    ///
    /// Terminal statuses refuse non-terminal successors (duplicate or
    /// out-of-order writes racing a worker retry must not resurrect a
    /// finished task). Terminal-to-terminal transitions are allowed —
    /// `Failed` → `RolledBack` via an explicit rollback, and `Completed` →
    /// `RolledBack` via self-healing or operator rollback. `RolledBack` is
    /// unreachable from any non-terminal status.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() && !next.is_terminal() {
            return false;
        }
        if next == Self::RolledBack {
            return matches!(self, Self::Failed | Self::Completed | Self::RolledBack);
        }
        true
    }

    /// Stable string form used in the database and API payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::ReadingFiles => "reading_files",
            Self::GeneratingCode => "generating_code",
            Self::DiffReady => "diff_ready",
            Self::WritingFiles => "writing_files",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planning" => Some(Self::Planning),
            "reading_files" => Some(Self::ReadingFiles),
            "generating_code" => Some(Self::GeneratingCode),
            "diff_ready" => Some(Self::DiffReady),
            "writing_files" => Some(Self::WritingFiles),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

/// Which external input the task needs next.
///
/// Orthogonal to [`TaskStatus`]; not covered by the terminal guard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AwaitingType {
    /// Approval of the generated diff preview.
    Approval,
    /// Confirmation that the deployed change looks good.
    DeployApproval,
    /// Confirmation to resume an interrupted task.
    ContinueOperation,
    /// Answers to open questions raised during planning.
    AnswerQuestions,
}

impl AwaitingType {
    /// Stable string form used in the database and API payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::DeployApproval => "deploy_approval",
            Self::ContinueOperation => "continue_operation",
            Self::AnswerQuestions => "answer_questions",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approval" => Some(Self::Approval),
            "deploy_approval" => Some(Self::DeployApproval),
            "continue_operation" => Some(Self::ContinueOperation),
            "answer_questions" => Some(Self::AnswerQuestions),
            _ => None,
        }
    }
}

/// One timestamped entry in a task's append-only error list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskError {
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
    /// Human-readable description.
    pub message: String,
}

/// Record of one successful file write: when it happened and where the
/// prior content was backed up (absent for newly created files).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrittenFile {
    /// When the write completed.
    pub timestamp: DateTime<Utc>,
    /// Backup reference returned by the transport, if prior content existed.
    pub backup: Option<String>,
}

/// Immutable creation flags for a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskFlags {
    /// Preview mode: stop after the diff, never write.
    pub dry_run: bool,
    /// Deterministic test scenario mode.
    pub test_mode: bool,
    /// Optional completion callback URL.
    pub webhook_url: Option<String>,
}

/// Task domain entity — one requested change operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique task identifier (UUID v4).
    pub task_id: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// The original change instruction.
    pub user_input: String,
    /// Preview mode flag; immutable after creation.
    pub dry_run: bool,
    /// Test scenario flag; immutable after creation.
    pub test_mode: bool,
    /// Optional completion callback URL.
    pub webhook_url: Option<String>,
    /// Opaque plan blob owned by the planning collaborator.
    pub plan: Option<serde_json::Value>,
    /// Unified diff per file path.
    pub diffs: BTreeMap<String, String>,
    /// Generated replacement content per file path.
    pub new_contents: BTreeMap<String, String>,
    /// Write records per file path, populated only by the write step.
    pub written_files: BTreeMap<String, WrittenFile>,
    /// Append-only error log.
    pub errors: Vec<TaskError>,
    /// Generation retries consumed so far (bounded).
    pub retry_count: u32,
    /// Whether the task is waiting on external input.
    pub awaiting_response: bool,
    /// Which input the task is waiting on, if any.
    pub awaiting_type: Option<AwaitingType>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// When the task reached a terminal status, if it has.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Construct a new task in `Planning` with a generated identifier.
    #[must_use]
    pub fn new(user_input: String, flags: TaskFlags) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            status: TaskStatus::Planning,
            user_input,
            dry_run: flags.dry_run,
            test_mode: flags.test_mode,
            webhook_url: flags.webhook_url,
            plan: None,
            diffs: BTreeMap::new(),
            new_contents: BTreeMap::new(),
            written_files: BTreeMap::new(),
            errors: Vec::new(),
            retry_count: 0,
            awaiting_response: false,
            awaiting_type: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Backup references for every written file that has one.
    #[must_use]
    pub fn backups(&self) -> BTreeMap<String, String> {
        self.written_files
            .iter()
            .filter_map(|(path, record)| {
                record
                    .backup
                    .as_ref()
                    .map(|backup| (path.clone(), backup.clone()))
            })
            .collect()
    }
}
