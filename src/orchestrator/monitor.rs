//! Per-process monitoring task.
//!
//! One task per engine process. It owns the child and multiplexes, in a
//! single `tokio::select!` loop:
//! - stdout/stderr lines framed by [`StatusCodec`] and classified by the
//!   status parser;
//! - control requests from the coordinator (graceful or forced stop);
//! - the grace-period deadline after a graceful stop;
//! - potfile polling for newly recovered digests;
//! - an inactivity timer that escalates to a liveness check;
//! - process exit.
//!
//! Observations are sent to the coordinator as [`MonitorEvent`]s. The task
//! never mutates session state itself.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};

use super::supervisor::{Control, ExitOutcome, MonitorEvent, MonitorEventKind, Termination};
use crate::engine::codec::StatusCodec;
use crate::engine::potfile::PotfileTail;
use crate::engine::status::{self, StatusLine};
use crate::Result;

/// Bytes written to the engine's stdin to request checkpoint-and-quit.
pub const CHECKPOINT_COMMAND: &[u8] = b"c\n";

/// How long to keep draining output after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-process monitoring parameters.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Owning session.
    pub session_id: String,
    /// Process generation.
    pub generation: u32,
    /// Wait after a graceful stop before killing.
    pub grace_period: Duration,
    /// Silence that triggers a liveness check.
    pub inactivity_timeout: Duration,
    /// Silent periods tolerated from a live process.
    pub stall_limit: u32,
    /// Consecutive malformed records tolerated.
    pub malformed_threshold: u32,
    /// Session potfile.
    pub potfile: PathBuf,
    /// Potfile poll interval.
    pub potfile_poll: Duration,
    /// Digests already reported by earlier generations.
    pub known: HashSet<String>,
}

struct LineState {
    malformed: u32,
    malformed_reported: bool,
}

/// Drive one engine process to completion and return how it ended.
pub(crate) async fn run(
    settings: MonitorSettings,
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: ChildStderr,
    mut control_rx: mpsc::Receiver<Control>,
    events_tx: mpsc::Sender<MonitorEvent>,
) -> ExitOutcome {
    let mut stdout = FramedRead::new(stdout, StatusCodec::new());
    let mut stderr = FramedRead::new(stderr, StatusCodec::new());
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut control_open = true;

    let mut potfile = PotfileTail::with_known(settings.potfile.clone(), settings.known.clone());
    let mut potfile_tick = tokio::time::interval(settings.potfile_poll);
    potfile_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let inactivity = tokio::time::sleep(settings.inactivity_timeout);
    tokio::pin!(inactivity);
    let mut silent_periods: u32 = 0;
    let mut last_output = Instant::now();

    let kill_deadline = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(kill_deadline);
    let mut kill_armed = false;

    let mut requested: Option<Termination> = None;
    let mut killed = false;
    let mut unresponsive_reported = false;
    let mut lines = LineState {
        malformed: 0,
        malformed_reported: false,
    };

    let wait_result = loop {
        tokio::select! {
            result = child.wait() => break result,

            ctrl = control_rx.recv(), if control_open => {
                match ctrl {
                    Some(Control::Terminate(Termination::Graceful)) => {
                        if requested.is_none() {
                            requested = Some(Termination::Graceful);
                        }
                        info!("graceful stop requested, asking engine to checkpoint");
                        if let Err(err) = send_checkpoint_command(stdin.as_mut()).await {
                            warn!(%err, "could not deliver checkpoint command");
                        }
                        kill_deadline
                            .as_mut()
                            .reset(Instant::now() + settings.grace_period);
                        kill_armed = true;
                    }
                    Some(Control::Terminate(Termination::Forced)) => {
                        requested = Some(Termination::Forced);
                        info!("forced stop requested");
                        killed |= start_kill(&mut child);
                    }
                    None => control_open = false,
                }
            }

            () = &mut kill_deadline, if kill_armed => {
                kill_armed = false;
                warn!(
                    grace_secs = settings.grace_period.as_secs(),
                    "engine did not exit within grace period, forcing kill"
                );
                killed |= start_kill(&mut child);
            }

            item = stdout.next(), if stdout_open => {
                match item {
                    Some(item) => {
                        note_activity(&mut last_output, &mut silent_periods);
                        inactivity.as_mut().reset(Instant::now() + settings.inactivity_timeout);
                        handle_item(&settings, &events_tx, &mut lines, item).await;
                    }
                    None => {
                        debug!("engine stdout closed");
                        stdout_open = false;
                    }
                }
            }

            item = stderr.next(), if stderr_open => {
                match item {
                    Some(item) => {
                        note_activity(&mut last_output, &mut silent_periods);
                        inactivity.as_mut().reset(Instant::now() + settings.inactivity_timeout);
                        handle_item(&settings, &events_tx, &mut lines, item).await;
                    }
                    None => {
                        debug!("engine stderr closed");
                        stderr_open = false;
                    }
                }
            }

            _ = potfile_tick.tick() => {
                poll_potfile(&settings, &events_tx, &mut potfile).await;
            }

            () = &mut inactivity => {
                inactivity.as_mut().reset(Instant::now() + settings.inactivity_timeout);
                match child.try_wait() {
                    Ok(Some(_)) => {
                        // Exited; the wait branch reaps it on the next turn.
                        debug!("liveness check: engine has exited");
                    }
                    Ok(None) => {
                        silent_periods += 1;
                        let silent_seconds = last_output.elapsed().as_secs();
                        warn!(silent_periods, silent_seconds, "engine alive but silent");
                        if silent_periods >= settings.stall_limit && !unresponsive_reported {
                            unresponsive_reported = true;
                            emit(
                                &settings,
                                &events_tx,
                                MonitorEventKind::Unresponsive { silent_seconds },
                            )
                            .await;
                        }
                    }
                    Err(err) => warn!(%err, "liveness check failed"),
                }
            }
        }
    };

    // Pick up the final status record and any digests written at exit.
    if stdout_open || stderr_open {
        let drain = async {
            while stdout_open || stderr_open {
                tokio::select! {
                    item = stdout.next(), if stdout_open => match item {
                        Some(item) => handle_item(&settings, &events_tx, &mut lines, item).await,
                        None => stdout_open = false,
                    },
                    item = stderr.next(), if stderr_open => match item {
                        Some(item) => handle_item(&settings, &events_tx, &mut lines, item).await,
                        None => stderr_open = false,
                    },
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("output still open after exit, abandoning drain");
        }
    }
    poll_potfile(&settings, &events_tx, &mut potfile).await;

    let outcome = build_outcome(wait_result, requested, killed);
    info!(
        code = outcome.code,
        signal = outcome.signal,
        killed = outcome.killed,
        detail = outcome.detail.as_str(),
        "engine process reaped"
    );
    outcome
}

async fn handle_item(
    settings: &MonitorSettings,
    events_tx: &mpsc::Sender<MonitorEvent>,
    lines: &mut LineState,
    item: Result<Result<String>>,
) {
    let parsed = item
        .and_then(|line| line)
        .and_then(|line| status::parse_line(&line));
    let kind = match parsed {
        Ok(StatusLine::Progress(snapshot)) => {
            lines.malformed = 0;
            lines.malformed_reported = false;
            MonitorEventKind::Progress(snapshot)
        }
        Ok(StatusLine::DeviceError { device, message }) => {
            warn!(device, message = message.as_str(), "engine reported device error");
            MonitorEventKind::DeviceError { device, message }
        }
        Ok(StatusLine::Unparsed(line)) => {
            trace!(line = line.as_str(), "engine output");
            return;
        }
        Err(err) => {
            lines.malformed += 1;
            debug!(consecutive = lines.malformed, %err, "malformed status record");
            if lines.malformed <= settings.malformed_threshold || lines.malformed_reported {
                return;
            }
            lines.malformed_reported = true;
            MonitorEventKind::Malformed {
                consecutive: lines.malformed,
                detail: err.detail().to_owned(),
            }
        }
    };
    emit(settings, events_tx, kind).await;
}

async fn poll_potfile(
    settings: &MonitorSettings,
    events_tx: &mpsc::Sender<MonitorEvent>,
    potfile: &mut PotfileTail,
) {
    match potfile.poll_new().await {
        Ok(entries) => {
            for entry in entries {
                debug!(hash = entry.hash.as_str(), "digest recovered");
                emit(settings, events_tx, MonitorEventKind::Recovered(entry)).await;
            }
        }
        Err(err) => warn!(%err, "potfile poll failed"),
    }
}

async fn emit(
    settings: &MonitorSettings,
    events_tx: &mpsc::Sender<MonitorEvent>,
    kind: MonitorEventKind,
) {
    let event = MonitorEvent {
        session_id: settings.session_id.clone(),
        generation: settings.generation,
        kind,
    };
    if events_tx.send(event).await.is_err() {
        debug!("coordinator channel closed, dropping monitor event");
    }
}

async fn send_checkpoint_command(stdin: Option<&mut ChildStdin>) -> std::io::Result<()> {
    let Some(stdin) = stdin else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "engine stdin not captured",
        ));
    };
    stdin.write_all(CHECKPOINT_COMMAND).await?;
    stdin.flush().await
}

fn note_activity(last_output: &mut Instant, silent_periods: &mut u32) {
    *last_output = Instant::now();
    *silent_periods = 0;
}

fn start_kill(child: &mut Child) -> bool {
    match child.start_kill() {
        Ok(()) => true,
        Err(err) => {
            // Usually means the process is already gone.
            debug!(%err, "kill failed");
            false
        }
    }
}

fn build_outcome(
    wait_result: std::io::Result<ExitStatus>,
    requested: Option<Termination>,
    killed: bool,
) -> ExitOutcome {
    match wait_result {
        Ok(status) => {
            let code = status.code();
            let signal = exit_signal(&status);
            let detail = match (code, signal) {
                (Some(c), _) => format!("engine exited with code {c}"),
                (None, Some(s)) => format!("engine terminated by signal {s}"),
                (None, None) => "engine terminated".to_owned(),
            };
            ExitOutcome {
                code,
                signal,
                requested,
                killed,
                detail,
            }
        }
        Err(err) => ExitOutcome {
            code: None,
            signal: None,
            requested,
            killed,
            detail: format!("wait failed: {err}"),
        },
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
