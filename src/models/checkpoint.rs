//! Durable resume state for paused or interrupted sessions.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::progress::ProgressSnapshot;
use super::session::SessionState;
use crate::{AppError, Result};

/// Everything needed to restart a session from the engine's restore point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointRecord {
    /// Owning session identifier.
    pub session_id: String,
    /// Job identifier.
    pub job_id: String,
    /// Engine-owned restore file.
    pub restore_path: PathBuf,
    /// Modification time of the restore file when the record was written.
    pub restore_modified_at: Option<DateTime<Utc>>,
    /// Last accepted snapshot at checkpoint time.
    pub last_snapshot: Option<ProgressSnapshot>,
    /// Session state at checkpoint time.
    pub state: SessionState,
    /// When the record was written.
    pub saved_at: DateTime<Utc>,
    /// SHA-256 over every other field.
    #[serde(default)]
    pub checksum: String,
}

impl CheckpointRecord {
    /// Build a sealed record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the record cannot be serialized for hashing.
    pub fn new(
        session_id: String,
        job_id: String,
        restore_path: PathBuf,
        restore_modified_at: Option<DateTime<Utc>>,
        last_snapshot: Option<ProgressSnapshot>,
        state: SessionState,
    ) -> Result<Self> {
        let mut record = Self {
            session_id,
            job_id,
            restore_path,
            restore_modified_at,
            last_snapshot,
            state,
            saved_at: Utc::now(),
            checksum: String::new(),
        };
        record.checksum = record.compute_checksum()?;
        Ok(record)
    }

    /// Percent complete captured by this record.
    #[must_use]
    pub fn percent(&self) -> f64 {
        self.last_snapshot.as_ref().map_or(0.0, |s| s.percent)
    }

    /// Hash of the record with an empty checksum field.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if serialization fails.
    pub fn compute_checksum(&self) -> Result<String> {
        let mut unsealed = self.clone();
        unsealed.checksum = String::new();
        let bytes = serde_json::to_vec(&unsealed)
            .map_err(|err| AppError::Io(format!("failed to serialize checkpoint: {err}")))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Verify internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CorruptCheckpoint` if the checksum does not match
    /// or the record predates its own snapshot.
    pub fn verify(&self) -> Result<()> {
        let expected = self.compute_checksum()?;
        if expected != self.checksum {
            return Err(AppError::CorruptCheckpoint(format!(
                "checksum mismatch for session {}",
                self.session_id
            )));
        }
        if let Some(ref snapshot) = self.last_snapshot {
            if snapshot.timestamp > self.saved_at {
                return Err(AppError::CorruptCheckpoint(format!(
                    "record for session {} is older than its snapshot",
                    self.session_id
                )));
            }
        }
        Ok(())
    }
}
