//! Retention service for time-based session purge.
//!
//! Runs as a background task deleting sessions (and their tasks) whose
//! last activity is older than `retention_days`. Also callable on demand
//! from the operator sweep endpoint.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::SessionStore;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly. On each tick it deletes every session whose
/// `updated_at` is older than `retention_days`.
#[must_use]
pub fn spawn_retention_task(
    store: SessionStore,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match purge(&store, i64::from(retention_days)).await {
                        Ok(removed) if removed > 0 => {
                            info!(removed, retention_days, "retention purge completed");
                        }
                        Ok(_) => {}
                        Err(err) => error!(%err, "retention purge failed"),
                    }
                }
            }
        }
    })
}

/// Delete sessions idle longer than `days`, returning how many were removed.
///
/// # Errors
///
/// Returns `AppError::Db` if listing or deletion fails.
pub async fn purge(store: &SessionStore, days: i64) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(days);
    let expired = store.list_keys_updated_before(cutoff).await?;
    let mut removed = 0;
    for key in expired {
        match store.delete_session(&key).await {
            Ok(()) => {
                removed += 1;
                info!(session = %key, "expired session removed");
            }
            Err(err) => error!(session = %key, %err, "failed to remove expired session"),
        }
    }
    Ok(removed)
}
