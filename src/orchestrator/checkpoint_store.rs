//! Durable per-session checkpoint records.
//!
//! Each session keeps one `checkpoint.json` beside the engine's restore file.
//! Writes go to a temporary file in the same directory and are renamed into
//! place via `tempfile::NamedTempFile::persist()`, so a crash mid-write
//! leaves the previous record intact.
//!
//! All file I/O runs on the blocking pool and is bounded by the configured
//! I/O timeout. Transient write failures are retried a few times before the
//! error is surfaced; callers never take an external lock.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::engine::command::SessionPaths;
use crate::models::checkpoint::CheckpointRecord;
use crate::{AppError, Result};

const WRITE_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// File-backed checkpoint store rooted at the sessions directory.
#[derive(Debug)]
pub struct CheckpointStore {
    sessions_dir: PathBuf,
    io_timeout: Duration,
    // Serializes writers so two saves for one session never interleave renames.
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Create a store rooted at `sessions_dir`.
    #[must_use]
    pub fn new(sessions_dir: PathBuf, io_timeout: Duration) -> Self {
        Self {
            sessions_dir,
            io_timeout,
            write_lock: Mutex::new(()),
        }
    }

    /// File layout for `session_id`.
    #[must_use]
    pub fn paths(&self, session_id: &str) -> SessionPaths {
        SessionPaths::new(&self.sessions_dir, session_id)
    }

    /// Atomically persist `record` for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if every write attempt fails or times out.
    pub async fn save(&self, session_id: &str, record: &CheckpointRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|err| AppError::Io(format!("failed to serialize checkpoint: {err}")))?;
        let target = self.paths(session_id).checkpoint_file;

        let _guard = self.write_lock.lock().await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write_once(&target, bytes.clone()).await {
                Ok(()) => {
                    debug!(session_id, path = %target.display(), "checkpoint saved");
                    return Ok(());
                }
                Err(err) if attempt < WRITE_ATTEMPTS => {
                    warn!(session_id, attempt, %err, "checkpoint write failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Load and validate the checkpoint record for `session_id`.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` when no record exists.
    /// - `AppError::CorruptCheckpoint` when the record cannot be parsed,
    ///   fails its checksum, belongs to another session, or its restore file
    ///   is missing or older than the record says.
    /// - `AppError::Io` on read failure or timeout.
    pub async fn load(&self, session_id: &str) -> Result<CheckpointRecord> {
        let path = self.paths(session_id).checkpoint_file;
        let read_path = path.clone();
        let raw = self
            .bounded(move || match std::fs::read(&read_path) {
                Ok(raw) => Ok(Some(raw)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(AppError::from(err)),
            })
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no checkpoint for session {session_id}")))?;

        let record: CheckpointRecord = serde_json::from_slice(&raw).map_err(|err| {
            AppError::CorruptCheckpoint(format!("unreadable record {}: {err}", path.display()))
        })?;
        record.verify()?;

        if record.session_id != session_id {
            return Err(AppError::CorruptCheckpoint(format!(
                "record belongs to session {}",
                record.session_id
            )));
        }

        let restore_path = record.restore_path.clone();
        let modified = self
            .bounded(move || Ok(restore_file_mtime(&restore_path)))
            .await?
            .ok_or_else(|| {
                AppError::CorruptCheckpoint(format!(
                    "restore file {} is missing",
                    record.restore_path.display()
                ))
            })?;
        if let Some(recorded) = record.restore_modified_at {
            if modified < recorded {
                return Err(AppError::CorruptCheckpoint(format!(
                    "restore file {} is older than its record",
                    record.restore_path.display()
                )));
            }
        }

        Ok(record)
    }

    /// Remove the record for `session_id`. Missing records are ignored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file exists but cannot be removed.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.paths(session_id).checkpoint_file;
        let _guard = self.write_lock.lock().await;
        self.bounded(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::from(err)),
        })
        .await?;
        info!(session_id, "checkpoint deleted");
        Ok(())
    }

    /// Atomically write inline hash material for `session_id`, one digest
    /// per line. Returns the file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the write fails or times out.
    pub async fn write_target(&self, session_id: &str, hashes: &[String]) -> Result<PathBuf> {
        let target = self.paths(session_id).target_file;
        let mut body = hashes.join("\n");
        body.push('\n');
        self.write_once(&target, body.into_bytes()).await?;
        Ok(target)
    }

    async fn write_once(&self, target: &Path, bytes: Vec<u8>) -> Result<()> {
        let target = target.to_path_buf();
        self.bounded(move || write_atomic(&target, &bytes)).await
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        match tokio::time::timeout(self.io_timeout, tokio::task::spawn_blocking(op)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(AppError::Io(format!(
                "checkpoint task failed: {join_err}"
            ))),
            Err(_) => Err(AppError::Io(format!(
                "checkpoint I/O timed out after {:?}",
                self.io_timeout
            ))),
        }
    }
}

/// Modification time of the engine's restore file, if present.
#[must_use]
pub fn restore_file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Write `bytes` to `target` via a same-directory temporary file and rename.
///
/// # Errors
///
/// Returns `AppError::Io` on directory creation, write, or rename failure.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| AppError::Io("checkpoint path has no parent directory".into()))?;
    std::fs::create_dir_all(parent).map_err(|err| {
        AppError::Io(format!(
            "failed to create directory {}: {err}",
            parent.display()
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;
    tmp.write_all(bytes)
        .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|err| AppError::Io(format!("failed to sync temporary file: {err}")))?;
    tmp.persist(target).map_err(|err| {
        AppError::Io(format!(
            "failed to persist file to {}: {err}",
            target.display()
        ))
    })?;
    Ok(())
}
