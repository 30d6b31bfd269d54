//! Session model and lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::Job;
use super::progress::{ProgressHistory, ProgressSnapshot};
use crate::errors::ErrorKind;
use crate::{AppError, Result};

/// Session identifier.
pub type SessionId = String;

/// Lifecycle state for a cracking session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for admission.
    Queued,
    /// Engine process live and reporting.
    Running,
    /// Stopped with a checkpoint; resumable.
    Paused,
    /// Checkpoint validated; waiting for the new process to confirm it.
    Resuming,
    /// Engine finished (exhausted or recovered).
    Completed,
    /// Engine or checkpoint failure.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl SessionState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running | Self::Failed)
                | (
                    Self::Running,
                    Self::Completed | Self::Failed | Self::Paused
                )
                | (Self::Paused, Self::Resuming)
                | (Self::Resuming, Self::Running | Self::Failed)
                | (
                    Self::Queued | Self::Running | Self::Paused | Self::Resuming,
                    Self::Cancelled
                )
        )
    }

    /// Lower-case label used in persistence and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the label produced by [`SessionState::as_str`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for an unknown label.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "resuming" => Ok(Self::Resuming),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AppError::Db(format!("invalid session state: {other}"))),
        }
    }
}

/// Populated failure reason for a `Failed` session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct FailureReason {
    /// Stable error kind.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub detail: String,
    /// Engine exit code, when the process exited.
    pub exit_code: Option<i32>,
}

impl FailureReason {
    /// Build a reason from an error.
    #[must_use]
    pub fn from_error(err: &AppError, exit_code: Option<i32>) -> Self {
        Self {
            kind: err.kind(),
            detail: err.detail().to_owned(),
            exit_code,
        }
    }
}

/// Cumulative run statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionStats {
    /// Milliseconds spent running in completed run segments.
    pub accumulated_ms: u64,
    /// Start of the current run segment.
    pub running_since: Option<DateTime<Utc>>,
    /// Digests recovered so far.
    pub recovered_count: u64,
    /// Last accepted snapshot.
    pub last_snapshot: Option<ProgressSnapshot>,
}

impl SessionStats {
    /// Total running time including the current segment.
    #[must_use]
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        let current = self.running_since.map_or(0, |since| {
            u64::try_from((now - since).num_milliseconds()).unwrap_or(0)
        });
        self.accumulated_ms.saturating_add(current)
    }

    fn open_segment(&mut self, now: DateTime<Utc>) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    fn close_segment(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.running_since.take() {
            let ms = u64::try_from((now - since).num_milliseconds()).unwrap_or(0);
            self.accumulated_ms = self.accumulated_ms.saturating_add(ms);
        }
    }
}

/// Mutable run state for one job, kept across pause/resume cycles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// The job this session runs.
    pub job: Job,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Number of engine processes launched for this session.
    pub generation: u32,
    /// Set on completion when at least one digest was recovered.
    pub recovered: bool,
    /// Present once the session has failed.
    pub failure: Option<FailureReason>,
    /// Cumulative statistics.
    pub stats: SessionStats,
    /// Recent snapshots.
    pub history: ProgressHistory,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Construct a queued session for `job`.
    #[must_use]
    pub fn new(job: Job, history_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job,
            state: SessionState::Queued,
            generation: 0,
            recovered: false,
            failure: None,
            stats: SessionStats::default(),
            history: ProgressHistory::new(history_capacity),
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a state transition, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` without mutating anything when
    /// the state machine forbids `next`.
    pub fn transition(&mut self, next: SessionState) -> Result<SessionState> {
        let prev = self.state;
        if !prev.can_transition_to(next) {
            return Err(AppError::InvalidTransition(format!(
                "session {} cannot move from {} to {}",
                self.id,
                prev.as_str(),
                next.as_str()
            )));
        }

        let now = Utc::now();
        if next == SessionState::Running {
            self.stats.open_segment(now);
        } else {
            self.stats.close_segment(now);
        }
        self.state = next;
        self.updated_at = now;
        Ok(prev)
    }

    /// Accept a snapshot if it does not regress below `floor` or the last
    /// accepted snapshot. Returns whether it was recorded.
    pub fn record_snapshot(&mut self, snapshot: ProgressSnapshot, floor: f64) -> bool {
        let last = self
            .stats
            .last_snapshot
            .as_ref()
            .map_or(floor, |s| s.percent.max(floor));
        if snapshot.percent < last {
            return false;
        }
        self.stats.recovered_count = self.stats.recovered_count.max(snapshot.recovered);
        self.stats.last_snapshot = Some(snapshot.clone());
        self.history.push(snapshot);
        self.updated_at = Utc::now();
        true
    }

    /// Percent complete of the last accepted snapshot.
    #[must_use]
    pub fn percent(&self) -> f64 {
        self.stats.last_snapshot.as_ref().map_or(0.0, |s| s.percent)
    }

    /// Restore a session found `Running` or `Resuming` after the
    /// orchestrator itself stopped, given a valid checkpoint. Its last
    /// durable state is `Paused`. Returns the state it was found in.
    pub fn restore_paused(&mut self) -> SessionState {
        let prev = self.state;
        let now = Utc::now();
        self.stats.close_segment(now);
        self.state = SessionState::Paused;
        self.updated_at = now;
        prev
    }

    /// Read-only projection for callers.
    #[must_use]
    pub fn view(&self, queue_position: Option<usize>) -> SessionView {
        SessionView {
            id: self.id.clone(),
            job_id: self.job.id.clone(),
            state: self.state,
            priority: self.job.priority(),
            generation: self.generation,
            recovered: self.recovered,
            failure: self.failure.clone(),
            percent: self.percent(),
            recovered_count: self.stats.recovered_count,
            elapsed_ms: self.stats.elapsed_ms(Utc::now()),
            last_snapshot: self.stats.last_snapshot.clone(),
            history: self.history.iter().cloned().collect(),
            queue_position,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Snapshot of a session returned by queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionView {
    /// Session identifier.
    pub id: SessionId,
    /// Job identifier.
    pub job_id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Effective job priority.
    pub priority: i32,
    /// Engine processes launched so far.
    pub generation: u32,
    /// Completed with at least one recovered digest.
    pub recovered: bool,
    /// Failure reason for `Failed` sessions.
    pub failure: Option<FailureReason>,
    /// Percent complete.
    pub percent: f64,
    /// Digests recovered so far.
    pub recovered_count: u64,
    /// Total running time in milliseconds.
    pub elapsed_ms: u64,
    /// Last accepted snapshot.
    pub last_snapshot: Option<ProgressSnapshot>,
    /// Recent snapshots, oldest first.
    pub history: Vec<ProgressSnapshot>,
    /// Position in the admission queue while waiting.
    pub queue_position: Option<usize>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}
