//! Planning/generation collaborator contract.
//!
//! The core hands the collaborator a list of role-tagged messages plus a
//! complexity hint and gets text back — either a structured plan or the
//! replacement content for one file. Everything else about the text
//! service (model, prompt wording) is outside this crate.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Message role tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Framing instructions.
    System,
    /// Requester input.
    User,
    /// Prior collaborator output.
    Assistant,
}

/// One role-tagged message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// Message role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Shorthand constructor.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Complexity hint forwarded to the collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Single-file or trivial change.
    Simple,
    /// Default.
    Standard,
    /// Multi-file or structural change.
    Complex,
}

/// Structured plan parsed from the collaborator's planning response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    /// One-paragraph description of the intended change.
    #[serde(default)]
    pub summary: String,
    /// Tree-relative paths the change will touch.
    #[serde(default)]
    pub files: Vec<String>,
    /// Open questions the requester must answer before proceeding.
    #[serde(default)]
    pub questions: Vec<String>,
}

/// Text generation service.
///
/// Failures are transient from the caller's perspective and retried up to
/// the submission's retry budget.
pub trait Planner: Send + Sync {
    /// Generate text for the given conversation.
    fn generate<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        complexity: Complexity,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

/// Marker the runner places in the system message of a per-file
/// generation request. Lets deterministic planners key off the target.
pub const GENERATE_FILE_MARKER: &str = "generate_file:";

/// Marker the runner places in the system message of a planning request.
pub const PLAN_MARKER: &str = "plan";

/// Parse the collaborator's planning response into a [`Plan`].
///
/// Tolerates a fenced JSON block — collaborators routinely wrap output in
/// markdown fences.
///
/// # Errors
///
/// Returns `AppError::Planner` if no JSON plan can be extracted.
pub fn parse_plan(raw: &str) -> Result<Plan> {
    let cleaned = strip_fences(raw);
    serde_json::from_str(cleaned)
        .map_err(|err| AppError::Planner(format!("unparseable plan response: {err}")))
}

/// Static validation of generated file content.
///
/// The deep content rules live with the generation collaborator; this
/// catches the failure modes that would corrupt a write outright.
///
/// # Errors
///
/// Returns `AppError::Validation` describing the first rule violated.
pub fn validate_generated(path: &str, content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(AppError::Validation(format!("{path}: generated content is empty")));
    }
    if content.trim_start().starts_with("```") {
        return Err(AppError::Validation(format!(
            "{path}: generated content still carries a markdown fence"
        )));
    }
    Ok(())
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json"), then the closing fence.
    let body = rest.split_once('\n').map_or(rest, |(_, body)| body);
    body.trim().strip_suffix("```").unwrap_or(body).trim()
}

/// Planner backed by an HTTP text service.
///
/// Posts the role-tagged conversation plus the complexity hint and takes
/// the response body verbatim as the generated text.
pub struct HttpPlanner {
    client: reqwest::Client,
    endpoint: String,
    timeout: std::time::Duration,
}

impl HttpPlanner {
    /// Construct a planner against `endpoint` with a 120s request timeout.
    #[must_use]
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            timeout: std::time::Duration::from_secs(120),
        }
    }
}

impl Planner for HttpPlanner {
    fn generate<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        complexity: Complexity,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let body = serde_json::json!({
                "messages": messages,
                "complexity": complexity,
            });
            let response = self
                .client
                .post(&self.endpoint)
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await
                .map_err(|err| AppError::Planner(format!("request failed: {err}")))?
                .error_for_status()
                .map_err(|err| AppError::Planner(format!("service error: {err}")))?;
            response
                .text()
                .await
                .map_err(|err| AppError::Planner(format!("unreadable response: {err}")))
        })
    }
}

/// Deterministic planner for `test_mode` tasks and automated scenarios.
///
/// Responds to a planning request with a canned plan and to per-file
/// generation requests with canned contents, keyed off the markers the
/// runner embeds in its system message.
pub struct ScriptedPlanner {
    plan: Plan,
    contents: BTreeMap<String, String>,
}

impl ScriptedPlanner {
    /// Construct a planner that answers with `plan` and `contents`.
    #[must_use]
    pub fn new(plan: Plan, contents: BTreeMap<String, String>) -> Self {
        Self { plan, contents }
    }
}

impl Planner for ScriptedPlanner {
    fn generate<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        _complexity: Complexity,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let system = messages
                .iter()
                .find(|msg| msg.role == Role::System)
                .map(|msg| msg.content.as_str())
                .unwrap_or_default();

            if let Some(path) = system.strip_prefix(GENERATE_FILE_MARKER) {
                return self.contents.get(path).cloned().ok_or_else(|| {
                    AppError::Planner(format!("scripted planner has no content for {path}"))
                });
            }

            serde_json::to_string(&self.plan)
                .map_err(|err| AppError::Planner(format!("cannot encode scripted plan: {err}")))
        })
    }
}
