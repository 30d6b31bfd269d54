//! Engine process supervisor.
//!
//! Spawns one hashcat process per admitted session with:
//! - `kill_on_drop(true)` so a process is reaped on every path, including a
//!   panic in its monitoring task.
//! - `env_clear()` plus an allowlist of variables the engine and its compute
//!   runtimes need.
//! - stdin, stdout, and stderr piped; stdin carries the checkpoint command
//!   used for graceful termination.
//!
//! Each process gets a dedicated monitoring task (see [`super::monitor`])
//! that owns the [`Child`](tokio::process::Child). The supervisor hands back
//! a [`ProcessHandle`] carrying a control channel and an exit watch; it never
//! shares mutable state with the coordinator.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, info_span, warn, Instrument};

use super::monitor::{self, MonitorSettings};
use crate::config::GlobalConfig;
use crate::engine::command::{self, LaunchMode, SessionPaths};
use crate::engine::potfile::PotEntry;
use crate::models::job::Job;
use crate::models::progress::ProgressSnapshot;
use crate::{AppError, Result};

/// Environment variables inherited by the engine process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "TMPDIR",
    "LANG",
    "LD_LIBRARY_PATH",
    "CUDA_VISIBLE_DEVICES",
    "HIP_VISIBLE_DEVICES",
    "ROCR_VISIBLE_DEVICES",
    "GPU_DEVICE_ORDINAL",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
];

/// How a terminate request should proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Ask the engine to checkpoint and quit; kill after the grace period.
    Graceful,
    /// Kill immediately.
    Forced,
}

/// Final status of one engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal on Unix.
    pub signal: Option<i32>,
    /// Termination that had been requested before the exit, if any.
    pub requested: Option<Termination>,
    /// Whether the supervisor had to kill the process.
    pub killed: bool,
    /// Human-readable summary.
    pub detail: String,
}

impl ExitOutcome {
    /// Outcome reported when the monitoring task itself failed.
    #[must_use]
    pub fn monitor_lost(detail: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: None,
            requested: None,
            killed: true,
            detail: detail.into(),
        }
    }
}

/// What a monitoring task observed.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEventKind {
    /// A well-formed status record.
    Progress(ProgressSnapshot),
    /// The engine reported a device failure.
    DeviceError {
        /// 1-based device id, when known.
        device: Option<u32>,
        /// Raw engine message.
        message: String,
    },
    /// Consecutive malformed status records exceeded the threshold.
    Malformed {
        /// Consecutive failures observed.
        consecutive: u32,
        /// Last parse error.
        detail: String,
    },
    /// The process is alive but silent past the stall limit.
    Unresponsive {
        /// Seconds since the last output line.
        silent_seconds: u64,
    },
    /// A digest was recovered.
    Recovered(PotEntry),
    /// The process has been reaped.
    Exited(ExitOutcome),
}

/// Message from a monitoring task to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorEvent {
    /// Owning session.
    pub session_id: String,
    /// Process generation the event belongs to.
    pub generation: u32,
    /// Observation.
    pub kind: MonitorEventKind,
}

/// Control messages accepted by a monitoring task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Terminate(Termination),
}

/// Handle to a live engine process.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Owning session.
    pub session_id: String,
    /// Process generation (1 for the first launch).
    pub generation: u32,
    /// OS process id, when available.
    pub pid: Option<u32>,
    control_tx: mpsc::Sender<Control>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ProcessHandle {
    /// Whether the process has been reaped.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

/// Launches and controls engine processes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: Arc<GlobalConfig>,
    events_tx: mpsc::Sender<MonitorEvent>,
}

impl Supervisor {
    /// Create a supervisor that reports to `events_tx`.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, events_tx: mpsc::Sender<MonitorEvent>) -> Self {
        Self { config, events_tx }
    }

    /// Spawn the engine for `job` and start its monitoring task.
    ///
    /// `known` lists digests already reported for this session so a resumed
    /// run does not report them again.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidJobSpec` if the job no longer validates.
    /// - `AppError::ProcessSpawnFailed` if the session directory cannot be
    ///   prepared or the OS refuses to start the binary.
    pub fn spawn(
        &self,
        job: &Job,
        session_id: &str,
        generation: u32,
        mode: LaunchMode,
        known: HashSet<String>,
    ) -> Result<ProcessHandle> {
        let paths = SessionPaths::new(&self.config.sessions_dir(), session_id);
        std::fs::create_dir_all(&paths.dir).map_err(|err| {
            AppError::ProcessSpawnFailed(format!(
                "cannot prepare session directory {}: {err}",
                paths.dir.display()
            ))
        })?;

        let invocation = command::build_invocation(job, session_id, &paths, &self.config, mode)?;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        cmd.current_dir(&invocation.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::ProcessSpawnFailed(format!(
                "failed to spawn {}: {err}",
                invocation.program.display()
            ))
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::ProcessSpawnFailed("failed to capture engine stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::ProcessSpawnFailed("failed to capture engine stderr".into()))?;

        info!(
            session_id,
            generation,
            pid,
            resume = mode == LaunchMode::Restore,
            "engine process spawned"
        );

        let (control_tx, control_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = watch::channel(None);

        let settings = MonitorSettings {
            session_id: session_id.to_owned(),
            generation,
            grace_period: self.config.grace_period(),
            inactivity_timeout: self.config.inactivity_timeout(),
            stall_limit: self.config.supervisor.stall_limit,
            malformed_threshold: self.config.supervisor.malformed_threshold,
            potfile: paths.potfile.clone(),
            potfile_poll: Duration::from_millis(self.config.supervisor.potfile_poll_millis),
            known,
        };

        let monitor_task = tokio::spawn(
            monitor::run(
                settings,
                child,
                stdin,
                stdout,
                stderr,
                control_rx,
                self.events_tx.clone(),
            )
            .instrument(info_span!("engine_monitor", session_id, generation, pid)),
        );

        // Reaper: report the exit whether the monitor returned or panicked.
        // A panicking monitor drops the child, which kills it.
        let events_tx = self.events_tx.clone();
        let reaper_session = session_id.to_owned();
        tokio::spawn(async move {
            let outcome = match monitor_task.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(session_id = %reaper_session, %join_err, "engine monitor task failed");
                    ExitOutcome::monitor_lost(format!("monitor task failed: {join_err}"))
                }
            };
            exit_tx.send_replace(Some(outcome.clone()));
            let event = MonitorEvent {
                session_id: reaper_session.clone(),
                generation,
                kind: MonitorEventKind::Exited(outcome),
            };
            if events_tx.send(event).await.is_err() {
                warn!(
                    session_id = %reaper_session,
                    "coordinator gone before exit could be delivered"
                );
            }
        });

        Ok(ProcessHandle {
            session_id: session_id.to_owned(),
            generation,
            pid,
            control_tx,
            exit_rx,
        })
    }

    /// Request termination of the process behind `handle`.
    ///
    /// A graceful request writes the engine's checkpoint command and
    /// escalates to a kill after the grace period. Requests against an
    /// already reaped process are ignored.
    pub async fn terminate(&self, handle: &ProcessHandle, how: Termination) {
        if handle.has_exited() {
            return;
        }
        if handle.control_tx.send(Control::Terminate(how)).await.is_err() {
            // Monitor already finished; the exit is on its way.
            info!(
                session_id = handle.session_id.as_str(),
                generation = handle.generation,
                "terminate requested after monitor exit"
            );
        }
    }

    /// Wait for the process behind `handle` to be reaped.
    pub async fn wait(&self, handle: &ProcessHandle) -> ExitOutcome {
        let mut rx = handle.exit_rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(current) => (*current).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| ExitOutcome::monitor_lost("exit watch closed"))
    }
}
