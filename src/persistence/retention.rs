//! Retention service for time-based data purge.
//!
//! Runs hourly, deleting terminal session records older than
//! `retention_days` and then their session directories.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::session_repo::SessionRepo;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
#[must_use]
pub fn spawn_retention_task(
    repo: SessionRepo,
    sessions_dir: PathBuf,
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
                    if let Err(err) = purge(&repo, &sessions_dir, retention_days).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Run one purge pass. Returns the number of sessions removed.
///
/// # Errors
///
/// Returns `AppError::Db` if the delete query fails. Directory removal
/// failures are logged and skipped.
pub async fn purge(repo: &SessionRepo, sessions_dir: &Path, retention_days: u32) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let removed = repo.delete_terminal_before(cutoff).await?;

    for id in &removed {
        let dir = sessions_dir.join(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(session_id = id.as_str(), %err, "failed to remove session directory");
            }
        }
    }

    info!(retention_days, purged = removed.len(), "retention purge completed");
    Ok(removed.len())
}
