//! Health probe collaborator: one timeout-bounded HTTP GET.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Outcome of one health probe.
///
/// Probe trouble (connect failure, timeout) is folded into the report as
/// unhealthy rather than raised — an unreachable target and a 500 both
/// mean the deployment is bad.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    /// Whether the target answered with a 2xx status.
    pub healthy: bool,
    /// HTTP status code, when a response arrived at all.
    pub status_code: Option<u16>,
    /// Round-trip time in milliseconds.
    pub latency_ms: u64,
    /// Transport-level failure description, if any.
    pub error: Option<String>,
}

impl HealthReport {
    /// A synthesized unhealthy report (forced-failure test scenarios).
    #[must_use]
    pub fn forced_failure(reason: &str) -> Self {
        Self {
            healthy: false,
            status_code: Some(599),
            latency_ms: 0,
            error: Some(reason.to_owned()),
        }
    }
}

/// Health check service.
pub trait HealthProbe: Send + Sync {
    /// Probe `url`, bounded by `timeout`.
    fn check<'a>(
        &'a self,
        url: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = HealthReport> + Send + 'a>>;
}

/// HTTP GET probe.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Construct a probe with a fresh HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProbe for HttpProbe {
    fn check<'a>(
        &'a self,
        url: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = HealthReport> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            let outcome = self.client.get(url).timeout(timeout).send().await;
            let latency_ms =
                u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            match outcome {
                Ok(response) => {
                    let status = response.status();
                    HealthReport {
                        healthy: status.is_success(),
                        status_code: Some(status.as_u16()),
                        latency_ms,
                        error: None,
                    }
                }
                Err(err) => HealthReport {
                    healthy: false,
                    status_code: None,
                    latency_ms,
                    error: Some(err.to_string()),
                },
            }
        })
    }
}
