//! Session model: one continuity scope per requester/channel pair.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::Task;

/// Composite session key — the requester (`chat_id`) plus the inbound
/// channel (`source`, e.g. `http` or `chatbot`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey {
    /// Requester identifier.
    pub chat_id: String,
    /// Inbound channel identifier.
    pub source: String,
}

impl SessionKey {
    /// Construct a key from its parts.
    #[must_use]
    pub fn new(chat_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            source: source.into(),
        }
    }

    /// Filesystem-safe identifier for lock markers and legacy state files.
    ///
    /// Strips anything outside `[A-Za-z0-9_-]` from both parts.
    #[must_use]
    pub fn lock_id(&self) -> String {
        let sanitize = |s: &str| -> String {
            s.chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect()
        };
        format!("{}__{}", sanitize(&self.source), sanitize(&self.chat_id))
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source, self.chat_id)
    }
}

/// Session domain entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Owning requester/channel pair.
    pub key: SessionKey,
    /// Currently active task, if any.
    pub active_task_id: Option<String>,
    /// FIFO backlog of task ids, excluding the active task.
    pub task_queue: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Construct an empty session for a key.
    #[must_use]
    pub fn new(key: SessionKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            active_task_id: None,
            task_queue: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A session together with its full task set — the unit the store loads
/// and saves atomically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    /// The session record.
    pub session: Session,
    /// All tasks owned by the session, keyed by task id.
    pub tasks: BTreeMap<String, Task>,
}

impl SessionState {
    /// Construct an empty state for a key.
    #[must_use]
    pub fn new(key: SessionKey) -> Self {
        Self {
            session: Session::new(key),
            tasks: BTreeMap::new(),
        }
    }

    /// Self-repair structural invariants, returning a description of every
    /// repair applied.
    ///
    /// - A ghost `active_task_id` (referencing no existing task) is cleared.
    /// - Queue entries referencing missing tasks are dropped.
    ///
    /// Real tasks are never touched. Run on every load to contain damage
    /// from a crashed writer.
    pub fn check_invariants(&mut self) -> Vec<String> {
        let mut repairs = Vec::new();

        if let Some(active_id) = self.session.active_task_id.clone() {
            if !self.tasks.contains_key(&active_id) {
                repairs.push(format!(
                    "cleared ghost active_task_id={active_id} for {}",
                    self.session.key
                ));
                self.session.active_task_id = None;
            }
        }

        let before = self.session.task_queue.len();
        let tasks = &self.tasks;
        self.session
            .task_queue
            .retain(|task_id| tasks.contains_key(task_id));
        if self.session.task_queue.len() != before {
            repairs.push(format!(
                "dropped {} orphan task_queue entries for {}",
                before - self.session.task_queue.len(),
                self.session.key
            ));
        }

        repairs
    }

    /// Queue position for a task: 0 when active, 1-based index when queued.
    #[must_use]
    pub fn queue_position(&self, task_id: &str) -> Option<usize> {
        if self.session.active_task_id.as_deref() == Some(task_id) {
            return Some(0);
        }
        self.session
            .task_queue
            .iter()
            .position(|queued| queued == task_id)
            .map(|idx| idx + 1)
    }

    /// The active task record, if an active id is set and resolves.
    #[must_use]
    pub fn active_task(&self) -> Option<&Task> {
        self.session
            .active_task_id
            .as_ref()
            .and_then(|id| self.tasks.get(id))
    }
}
