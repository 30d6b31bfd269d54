//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// External engine invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Path to the hashcat binary.
    pub binary: PathBuf,
    /// Seconds between machine-readable status emissions.
    #[serde(default = "default_status_interval")]
    pub status_interval_seconds: u64,
    /// Workload profile passed as `-w` (1..=4).
    #[serde(default)]
    pub workload_profile: Option<u8>,
    /// Pass `-O` (optimized kernels).
    #[serde(default)]
    pub optimized_kernels: bool,
    /// Pass `--hwmon-disable`.
    #[serde(default)]
    pub hwmon_disable: bool,
    /// Accepted hash-type codes; empty means any code up to [`MAX_HASH_TYPE`].
    #[serde(default)]
    pub allowed_hash_types: Vec<u32>,
}

/// Largest hash-type code the engine understands.
pub const MAX_HASH_TYPE: u32 = 99_999;

fn default_status_interval() -> u64 {
    5
}

/// Directory layout.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    /// Directory that wordlist references resolve against.
    pub wordlists_dir: PathBuf,
    /// Directory that rule references resolve against.
    pub rules_dir: PathBuf,
    /// Root for per-session state, checkpoints, and the session database.
    pub data_dir: PathBuf,
}

/// Admission control settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Maximum concurrently running jobs.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

fn default_max_concurrent_jobs() -> u32 {
    1
}

/// Process supervision thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Seconds to wait for a graceful exit before killing the engine.
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,
    /// Seconds of silence on the status stream before a liveness check.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_seconds: u64,
    /// Consecutive silent periods tolerated from a live process.
    #[serde(default = "default_stall_limit")]
    pub stall_limit: u32,
    /// Consecutive malformed status records tolerated.
    #[serde(default = "default_malformed_threshold")]
    pub malformed_threshold: u32,
    /// Seconds between periodic checkpoint autosaves.
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_seconds: u64,
    /// Upper bound on any single checkpoint or session-record I/O.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_seconds: u64,
    /// Snapshots retained per session.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Milliseconds between potfile polls.
    #[serde(default = "default_potfile_poll")]
    pub potfile_poll_millis: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: default_grace_period(),
            inactivity_timeout_seconds: default_inactivity_timeout(),
            stall_limit: default_stall_limit(),
            malformed_threshold: default_malformed_threshold(),
            autosave_interval_seconds: default_autosave_interval(),
            io_timeout_seconds: default_io_timeout(),
            history_capacity: default_history_capacity(),
            potfile_poll_millis: default_potfile_poll(),
        }
    }
}

fn default_grace_period() -> u64 {
    10
}

fn default_inactivity_timeout() -> u64 {
    60
}

fn default_stall_limit() -> u32 {
    3
}

fn default_malformed_threshold() -> u32 {
    5
}

fn default_autosave_interval() -> u64 {
    60
}

fn default_io_timeout() -> u64 {
    10
}

fn default_history_capacity() -> usize {
    120
}

fn default_potfile_poll() -> u64 {
    500
}

/// Event fan-out settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EventsConfig {
    /// Events buffered per subscriber before the oldest is dropped.
    #[serde(default = "default_backlog")]
    pub subscriber_backlog: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_backlog: default_backlog(),
        }
    }
}

fn default_backlog() -> usize {
    256
}

fn default_retention_days() -> u32 {
    30
}

fn default_ipc_name() -> String {
    "crackq".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Engine invocation settings.
    pub engine: EngineConfig,
    /// Directory layout.
    pub paths: PathsConfig,
    /// Admission control.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Process supervision.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Event fan-out.
    #[serde(default)]
    pub events: EventsConfig,
    /// Named pipe / Unix socket identifier for the control surface.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Days after a session ends before its record is purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Directory holding one subdirectory per session.
    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.paths.data_dir.join("sessions")
    }

    /// Path of the session record database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.paths.data_dir.join("crackq.db")
    }

    /// Grace period for graceful termination.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.supervisor.grace_period_seconds)
    }

    /// Status-stream inactivity timeout.
    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.inactivity_timeout_seconds)
    }

    /// Interval between checkpoint autosaves.
    #[must_use]
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor.autosave_interval_seconds)
    }

    /// Bound on checkpoint and session-record I/O.
    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.io_timeout_seconds)
    }

    fn validate(&mut self) -> Result<()> {
        if self.scheduler.max_concurrent_jobs == 0 {
            return Err(AppError::Config(
                "max_concurrent_jobs must be greater than zero".into(),
            ));
        }

        if self.engine.status_interval_seconds == 0 {
            return Err(AppError::Config(
                "status_interval_seconds must be greater than zero".into(),
            ));
        }

        if let Some(profile) = self.engine.workload_profile {
            if !(1..=4).contains(&profile) {
                return Err(AppError::Config(format!(
                    "workload_profile must be between 1 and 4, got {profile}"
                )));
            }
        }

        if self.supervisor.inactivity_timeout_seconds == 0
            || self.supervisor.io_timeout_seconds == 0
        {
            return Err(AppError::Config(
                "supervisor timeouts must be greater than zero".into(),
            ));
        }

        if self.supervisor.history_capacity == 0 || self.events.subscriber_backlog == 0 {
            return Err(AppError::Config(
                "history_capacity and subscriber_backlog must be greater than zero".into(),
            ));
        }

        self.paths.wordlists_dir = canonical_dir("wordlists_dir", &self.paths.wordlists_dir)?;
        self.paths.rules_dir = canonical_dir("rules_dir", &self.paths.rules_dir)?;

        fs::create_dir_all(&self.paths.data_dir)
            .map_err(|err| AppError::Config(format!("cannot create data_dir: {err}")))?;
        self.paths.data_dir = canonical_dir("data_dir", &self.paths.data_dir)?;

        Ok(())
    }
}

fn canonical_dir(name: &str, path: &Path) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .map_err(|err| AppError::Config(format!("{name} invalid: {err}")))?;
    if !canonical.is_dir() {
        return Err(AppError::Config(format!("{name} is not a directory")));
    }
    Ok(canonical)
}
