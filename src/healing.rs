//! Self-healing deployment verification.
//!
//! After a non-dry-run write, the verifier waits out a grace period, then
//! probes the configured health target. A non-2xx (or unreachable) target
//! is a designed trigger, not a bug condition: every file the task wrote
//! is restored from its backup reference and the task is closed out
//! without asking a human to confirm a deployment that is already known
//! bad.

use std::time::Duration;

use crate::breaker::BreakerRegistry;
use crate::config::HealingConfig;
use crate::models::task::Task;
use crate::probe::{HealthProbe, HealthReport};
use crate::transport::FileTransport;

/// Marker in a `test_mode` task's instruction that forces a synthesized
/// unhealthy verdict, exercising the rollback path deterministically
/// without probing anything real.
pub const FORCE_ROLLBACK_MARKER: &str = "[FORCE_ROLLBACK]";

/// Result of restoring a task's written files.
#[derive(Debug, Clone, Default)]
pub struct RollbackSummary {
    /// Paths restored from their backups.
    pub restored: Vec<String>,
    /// Paths that could not be restored, with reasons.
    pub failures: Vec<String>,
}

/// Whether this task requests a forced-unhealthy verification.
///
/// Only honored in `test_mode`; production tasks always run the real probe.
#[must_use]
pub fn wants_forced_rollback(task: &Task) -> bool {
    task.test_mode && task.user_input.contains(FORCE_ROLLBACK_MARKER)
}

/// Run the post-write health verification for a task.
///
/// Waits the configured grace period so downstream caches can settle,
/// then probes the health target through its circuit breaker. When the
/// breaker for the target is open the deployment is unverifiable, which
/// counts as unhealthy.
pub async fn verify_deployment(
    task: &Task,
    config: &HealingConfig,
    probe: &dyn HealthProbe,
    breakers: &BreakerRegistry,
) -> HealthReport {
    if wants_forced_rollback(task) {
        tracing::info!(task_id = task.task_id, "forced-failure verification (test_mode)");
        return HealthReport::forced_failure("forced failure marker present (test_mode)");
    }

    tokio::time::sleep(Duration::from_secs(config.grace_seconds)).await;

    let breaker_key = format!("health:{}", config.health_url);
    let breaker = breakers.get(&breaker_key);
    if !breaker.is_call_permitted() {
        tracing::warn!(
            task_id = task.task_id,
            breaker = breaker_key,
            "health breaker open, treating deployment as unverifiable"
        );
        return HealthReport {
            healthy: false,
            status_code: None,
            latency_ms: 0,
            error: Some(format!("circuit breaker '{breaker_key}' is open")),
        };
    }

    let report = probe
        .check(
            &config.health_url,
            Duration::from_secs(config.probe_timeout_seconds),
        )
        .await;

    if report.error.is_some() {
        breaker.record_failure();
    } else {
        breaker.record_success();
    }

    tracing::info!(
        task_id = task.task_id,
        healthy = report.healthy,
        status_code = report.status_code,
        latency_ms = report.latency_ms,
        "deployment verification finished"
    );
    report
}

/// Restore every file the task wrote from its backup reference.
///
/// Files written without a backup (they did not exist before) have
/// nothing to restore to and are skipped with a note.
pub async fn roll_back_written_files(
    task: &Task,
    transport: &dyn FileTransport,
) -> RollbackSummary {
    let mut summary = RollbackSummary::default();
    for (path, record) in &task.written_files {
        match &record.backup {
            Some(backup_ref) => match transport.restore(path, backup_ref).await {
                Ok(()) => summary.restored.push(path.clone()),
                Err(err) => {
                    tracing::error!(task_id = task.task_id, path, %err, "restore failed");
                    summary.failures.push(format!("{path}: {err}"));
                }
            },
            None => {
                // Newly created file; there is no prior content to restore.
                summary
                    .failures
                    .push(format!("{path}: no backup reference (new file)"));
            }
        }
    }
    tracing::info!(
        task_id = task.task_id,
        restored = summary.restored.len(),
        failures = summary.failures.len(),
        "rollback finished"
    );
    summary
}
