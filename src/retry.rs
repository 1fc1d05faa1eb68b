//! Generic bounded-retry wrapper with exponential backoff.
//!
//! Exists in a suspendable form for scheduler-driven tasks and a blocking
//! form for synchronous I/O helpers; both share the same backoff math.

use std::future::Future;
use std::time::Duration;

use crate::{AppError, Result};

/// Retry bounds and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Construct a policy.
    #[must_use]
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
        }
    }

    /// Delay slept after the given 1-based attempt fails:
    /// `initial_delay * backoff_multiplier^(attempt - 1)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        self.initial_delay
            .mul_f64(self.backoff_multiplier.powi(exponent))
    }
}

/// Run a fallible async operation under the policy.
///
/// The final failure is returned unchanged after `max_attempts` tries.
/// Each retry emits a structured log event carrying the attempt number,
/// the upcoming delay, and the cause — never operation payloads.
///
/// # Errors
///
/// Returns the last error produced by `op` once attempts are exhausted.
pub async fn retry_async<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    cause = %err,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Run a fallible blocking operation under the policy.
///
/// Identical semantics to [`retry_async`], sleeping on the current thread.
///
/// # Errors
///
/// Returns the last error produced by `op` once attempts are exhausted.
pub fn retry_blocking<T, F>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    cause = %err,
                    "attempt failed, retrying"
                );
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Guard against a zero-attempt policy: normalize to at least one try.
///
/// Callers constructing policies from configuration use this to avoid a
/// loop that never runs the operation.
#[must_use]
pub fn at_least_one_attempt(policy: RetryPolicy) -> RetryPolicy {
    if policy.max_attempts == 0 {
        RetryPolicy {
            max_attempts: 1,
            ..policy
        }
    } else {
        policy
    }
}

/// Convenience: classify whether an error is worth retrying at all.
///
/// Breaker rejections and lock timeouts are not transient in the retry
/// sense — backing off and hammering the same call defeats their purpose.
#[must_use]
pub fn is_retryable(err: &AppError) -> bool {
    !matches!(err, AppError::BreakerOpen(_) | AppError::LockTimeout(_))
}
