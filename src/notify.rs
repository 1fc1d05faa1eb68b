//! Completion notifier collaborator: fire-and-forget webhooks.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

/// Payload posted to a completion callback.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionPayload {
    /// Task the notification concerns.
    pub task_id: String,
    /// Final status string (`completed`, `failed`, `auto_healed`, ...).
    pub status: String,
    /// Notification time.
    pub timestamp: chrono::DateTime<Utc>,
    /// Status-specific result details.
    pub result: serde_json::Value,
}

/// Completion callback sink. Failures are logged, never raised.
pub trait CompletionNotifier: Send + Sync {
    /// Deliver a notification to `webhook_url`.
    fn notify<'a>(
        &'a self,
        webhook_url: &'a str,
        task_id: &'a str,
        status: &'a str,
        result: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// HTTP POST notifier.
pub struct WebhookNotifier {
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookNotifier {
    /// Construct a notifier with a fresh HTTP client and a 10s timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionNotifier for WebhookNotifier {
    fn notify<'a>(
        &'a self,
        webhook_url: &'a str,
        task_id: &'a str,
        status: &'a str,
        result: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if webhook_url.is_empty() {
                return;
            }
            let payload = CompletionPayload {
                task_id: task_id.to_owned(),
                status: status.to_owned(),
                timestamp: Utc::now(),
                result,
            };
            let outcome = self
                .client
                .post(webhook_url)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);
            match outcome {
                Ok(response) => {
                    info!(task_id, status, code = response.status().as_u16(), "webhook delivered");
                }
                Err(err) => {
                    warn!(task_id, status, %err, "webhook delivery failed");
                }
            }
        })
    }
}
