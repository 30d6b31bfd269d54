//! Single-writer session coordinator.
//!
//! One task owns every [`Session`], the admission queue, and the
//! concurrency count. Callers talk to it through the cloneable
//! [`Orchestrator`] handle; monitoring tasks report through
//! [`MonitorEvent`]s. Every state transition for every session is applied
//! here, one message at a time, so transitions are linearized per session
//! and admission decisions never race.
//!
//! Only unfinished sessions stay in memory. Once a terminal session's
//! process has been reaped it is evicted, and queries for it are answered
//! from the session store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::broadcaster::{Broadcaster, Subscription, SubscriptionFilter};
use super::checkpoint_store::{restore_file_mtime, CheckpointStore};
use super::scheduler::AdmissionQueue;
use super::supervisor::{
    ExitOutcome, MonitorEvent, MonitorEventKind, ProcessHandle, Supervisor, Termination,
};
use crate::config::GlobalConfig;
use crate::engine::command::{self, LaunchMode};
use crate::engine::potfile::{self, PotEntry};
use crate::models::checkpoint::CheckpointRecord;
use crate::models::event::EventPayload;
use crate::models::job::{HashTarget, Job, JobSpec};
use crate::models::progress::ProgressSnapshot;
use crate::models::session::{FailureReason, Session, SessionId, SessionState, SessionView};
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

/// Engine exit code: at least one digest recovered.
pub const EXIT_CRACKED: i32 = 0;
/// Engine exit code: keyspace exhausted.
pub const EXIT_EXHAUSTED: i32 = 1;

const COMMAND_BUFFER: usize = 64;
const MONITOR_BUFFER: usize = 256;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Submit(JobSpec, Reply<SessionId>),
    Cancel(SessionId, Reply<()>),
    Pause(SessionId, Reply<()>),
    Resume(SessionId, Reply<()>),
    Get(SessionId, Reply<SessionView>),
    List(Reply<Vec<SessionView>>),
    Results(SessionId, Reply<Vec<PotEntry>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable control handle for the coordinator.
#[derive(Clone)]
pub struct Orchestrator {
    tx: mpsc::Sender<Command>,
    broadcaster: Broadcaster,
}

impl Orchestrator {
    /// Submit a job. Returns the new session id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidJobSpec` if the job cannot be turned into a
    /// valid engine invocation, or `AppError::Shutdown` once stopping.
    pub async fn submit(&self, spec: JobSpec) -> Result<SessionId> {
        self.call(|reply| Command::Submit(spec, reply)).await
    }

    /// Cancel a session in any non-terminal state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::InvalidTransition`.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let id = session_id.to_owned();
        self.call(|reply| Command::Cancel(id, reply)).await
    }

    /// Pause a running session. The session reaches `Paused` once the engine
    /// has checkpointed and exited.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::InvalidTransition`.
    pub async fn pause(&self, session_id: &str) -> Result<()> {
        let id = session_id.to_owned();
        self.call(|reply| Command::Pause(id, reply)).await
    }

    /// Resume a paused session from its checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`, `AppError::InvalidTransition`, or
    /// `AppError::CorruptCheckpoint` (the session is then `Failed`).
    pub async fn resume(&self, session_id: &str) -> Result<()> {
        let id = session_id.to_owned();
        self.call(|reply| Command::Resume(id, reply)).await
    }

    /// Current view of one session, including finished ones kept in the
    /// session store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or `AppError::Db` if
    /// the session store cannot be read.
    pub async fn get(&self, session_id: &str) -> Result<SessionView> {
        let id = session_id.to_owned();
        self.call(|reply| Command::Get(id, reply)).await
    }

    /// Views of every known session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the session store cannot be read, or
    /// `AppError::Shutdown` if the coordinator is gone.
    pub async fn list(&self) -> Result<Vec<SessionView>> {
        self.call(Command::List).await
    }

    /// Digests recovered by a session, de-duplicated, in discovery order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or `AppError::Io` if
    /// the potfile cannot be read.
    pub async fn results(&self, session_id: &str) -> Result<Vec<PotEntry>> {
        let id = session_id.to_owned();
        self.call(|reply| Command::Results(id, reply)).await
    }

    /// Subscribe to published events.
    #[must_use]
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.broadcaster.subscribe(filter)
    }

    /// Pause every live session gracefully and stop the coordinator.
    /// Resolves once all engine processes have been reaped.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| AppError::Shutdown("coordinator stopped".into()))?;
        rx.await
            .map_err(|_| AppError::Shutdown("coordinator dropped the request".into()))?
    }
}

/// Stop requested for a live process, applied when it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// Checkpoint and move to `Paused`.
    Pause,
    /// Already `Cancelled`; just reap.
    Cancel,
    /// Already `Failed`; just reap.
    Kill,
    /// Orchestrator shutdown of a `Resuming` process; keep the durable state.
    Detach,
}

struct Entry {
    session: Session,
    process: Option<ProcessHandle>,
    pending: Option<Pending>,
    /// Lowest acceptable percent for the next snapshot.
    floor: f64,
    known: HashSet<String>,
}

impl Entry {
    fn new(session: Session) -> Self {
        Self {
            session,
            process: None,
            pending: None,
            floor: 0.0,
            known: HashSet::new(),
        }
    }
}

/// Coordinator task state.
pub struct Coordinator {
    config: Arc<GlobalConfig>,
    sessions: HashMap<SessionId, Entry>,
    queue: AdmissionQueue,
    resume_waiters: VecDeque<SessionId>,
    supervisor: Supervisor,
    store: Arc<CheckpointStore>,
    broadcaster: Broadcaster,
    repo: SessionRepo,
    monitor_rx: mpsc::Receiver<MonitorEvent>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    shutting_down: bool,
}

impl Coordinator {
    /// Recover unfinished sessions from `repo`, then start the coordinator
    /// task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the unfinished sessions cannot be listed.
    pub async fn start(
        config: Arc<GlobalConfig>,
        repo: SessionRepo,
    ) -> Result<(Orchestrator, JoinHandle<()>)> {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (monitor_tx, monitor_rx) = mpsc::channel(MONITOR_BUFFER);

        let broadcaster = Broadcaster::new(config.events.subscriber_backlog);
        let store = Arc::new(CheckpointStore::new(
            config.sessions_dir(),
            config.io_timeout(),
        ));

        let mut coordinator = Self {
            supervisor: Supervisor::new(Arc::clone(&config), monitor_tx),
            config,
            sessions: HashMap::new(),
            queue: AdmissionQueue::new(),
            resume_waiters: VecDeque::new(),
            store,
            broadcaster: broadcaster.clone(),
            repo,
            monitor_rx,
            shutdown_waiters: Vec::new(),
            shutting_down: false,
        };

        coordinator.recover().await?;
        coordinator.admit().await;

        let task = tokio::spawn(
            coordinator
                .run(cmd_rx)
                .instrument(info_span!("coordinator")),
        );

        Ok((
            Orchestrator {
                tx: cmd_tx,
                broadcaster,
            },
            task,
        ))
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut autosave = tokio::time::interval(self.config.autosave_interval());
        autosave.set_missed_tick_behavior(MissedTickBehavior::Delay);
        autosave.tick().await;
        let mut commands_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("all orchestrator handles dropped");
                        commands_open = false;
                        self.begin_shutdown().await;
                    }
                },
                Some(event) = self.monitor_rx.recv() => self.handle_monitor(event).await,
                _ = autosave.tick() => self.autosave().await,
            }

            if self.shutting_down && self.live_processes() == 0 {
                break;
            }
        }

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!("coordinator stopped");
    }

    // ── Commands ─────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit(spec, reply) => {
                let result = if self.shutting_down {
                    Err(shutting_down())
                } else {
                    self.submit(spec).await
                };
                let _ = reply.send(result);
            }
            Command::Cancel(id, reply) => {
                let result = if self.shutting_down {
                    Err(shutting_down())
                } else {
                    self.cancel(&id).await
                };
                let _ = reply.send(result);
            }
            Command::Pause(id, reply) => {
                let result = if self.shutting_down {
                    Err(shutting_down())
                } else {
                    self.pause(&id).await
                };
                let _ = reply.send(result);
            }
            Command::Resume(id, reply) => {
                let result = if self.shutting_down {
                    Err(shutting_down())
                } else {
                    self.resume(&id).await
                };
                let _ = reply.send(result);
            }
            Command::Get(id, reply) => {
                let _ = reply.send(self.view(&id).await);
            }
            Command::List(reply) => {
                let _ = reply.send(self.list().await);
            }
            Command::Results(id, reply) => {
                let _ = reply.send(self.results(&id).await);
            }
            Command::Shutdown(reply) => {
                self.shutdown_waiters.push(reply);
                self.begin_shutdown().await;
            }
        }
    }

    async fn submit(&mut self, mut spec: JobSpec) -> Result<SessionId> {
        let resolved = command::validate(&spec, &self.config)?;
        if let Some(path) = resolved.target_file {
            spec.target = HashTarget::File(path);
        }

        let job = Job::new(spec);
        let session = Session::new(job, self.config.supervisor.history_capacity);
        let id = session.id.clone();
        let span = info_span!("submit", session_id = id.as_str());

        if let HashTarget::Inline(ref hashes) = session.job.spec.target {
            self.store
                .write_target(&id, hashes)
                .instrument(span.clone())
                .await?;
        }

        let priority = session.job.priority();
        self.sessions.insert(id.clone(), Entry::new(session));
        self.queue.push(id.clone(), priority);
        span.in_scope(|| info!(priority, queued = self.queue.len(), "job submitted"));

        self.persist(&id).await;
        self.admit().await;
        Ok(id)
    }

    async fn cancel(&mut self, id: &str) -> Result<()> {
        let Some(entry) = self.sessions.get(id) else {
            return Err(self.not_live(id, "cancelled").await);
        };
        let state = entry.session.state;
        if !state.can_transition_to(SessionState::Cancelled) {
            return Err(AppError::InvalidTransition(format!(
                "session {id} is {} and cannot be cancelled",
                state.as_str()
            )));
        }

        self.queue.remove(id);
        self.resume_waiters.retain(|w| w != id);
        self.apply_transition(id, SessionState::Cancelled)?;
        info!(session_id = id, from = state.as_str(), "session cancelled");

        self.stop_process(id, Pending::Cancel, Termination::Forced)
            .await;
        self.persist(id).await;
        self.finalize_if_reaped(id).await;
        Ok(())
    }

    async fn pause(&mut self, id: &str) -> Result<()> {
        let Some(entry) = self.sessions.get(id) else {
            return Err(self.not_live(id, "paused").await);
        };
        let state = entry.session.state;
        if !state.can_transition_to(SessionState::Paused) || entry.process.is_none() {
            return Err(AppError::InvalidTransition(format!(
                "session {id} is {} and cannot be paused",
                state.as_str()
            )));
        }
        if entry.pending.is_some() {
            return Err(AppError::InvalidTransition(format!(
                "session {id} is already stopping"
            )));
        }

        info!(session_id = id, "pause requested");
        self.stop_process(id, Pending::Pause, Termination::Graceful)
            .await;
        Ok(())
    }

    async fn resume(&mut self, id: &str) -> Result<()> {
        let Some(entry) = self.sessions.get(id) else {
            return Err(self.not_live(id, "resumed").await);
        };
        let state = entry.session.state;
        if !state.can_transition_to(SessionState::Resuming) {
            return Err(AppError::InvalidTransition(format!(
                "session {id} is {} and cannot be resumed",
                state.as_str()
            )));
        }

        self.apply_transition(id, SessionState::Resuming)?;
        self.persist(id).await;

        let record = match self.store.load(id).await {
            Ok(record) => record,
            Err(err) => {
                let err = match err {
                    AppError::CorruptCheckpoint(_) => err,
                    other => AppError::CorruptCheckpoint(other.detail().to_owned()),
                };
                warn!(session_id = id, %err, "checkpoint rejected, failing session");
                self.fail(id, err.clone(), None).await;
                return Err(err);
            }
        };

        if let Some(entry) = self.sessions.get_mut(id) {
            entry.floor = record.percent().max(entry.floor);
        }
        info!(
            session_id = id,
            percent = record.percent(),
            "checkpoint validated, waiting for a slot"
        );
        self.resume_waiters.push_back(id.to_owned());
        self.admit().await;
        Ok(())
    }

    fn live_view(&self, id: &str) -> Option<SessionView> {
        let entry = self.sessions.get(id)?;
        let position = self.queue.position(id).or_else(|| {
            self.resume_waiters
                .iter()
                .position(|w| w == id)
        });
        Some(entry.session.view(position))
    }

    async fn view(&self, id: &str) -> Result<SessionView> {
        if let Some(view) = self.live_view(id) {
            return Ok(view);
        }
        Ok(self.stored(id).await?.view(None))
    }

    async fn list(&self) -> Result<Vec<SessionView>> {
        let mut views: Vec<SessionView> = self
            .sessions
            .keys()
            .filter_map(|id| self.live_view(id))
            .collect();

        let stored = match tokio::time::timeout(self.config.io_timeout(), self.repo.list_all())
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(store_timeout()),
        };
        views.extend(
            stored
                .into_iter()
                .filter(|session| !self.sessions.contains_key(&session.id))
                .map(|session| session.view(None)),
        );
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(views)
    }

    async fn results(&self, id: &str) -> Result<Vec<PotEntry>> {
        if !self.sessions.contains_key(id) {
            self.stored(id).await?;
        }
        potfile::read_entries(&self.store.paths(id).potfile).await
    }

    /// Error for a control request against a session not in memory: a
    /// finished session rejects it, an unknown one is not found.
    async fn not_live(&self, id: &str, verb: &str) -> AppError {
        match self.stored(id).await {
            Ok(session) => AppError::InvalidTransition(format!(
                "session {id} is {} and cannot be {verb}",
                session.state.as_str()
            )),
            Err(err) => err,
        }
    }

    /// Session record from the store, for sessions no longer in memory.
    async fn stored(&self, id: &str) -> Result<Session> {
        match tokio::time::timeout(self.config.io_timeout(), self.repo.get_by_id(id)).await {
            Ok(Ok(Some(session))) => Ok(session),
            Ok(Ok(None)) => Err(not_found(id)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(store_timeout()),
        }
    }

    // ── Admission ────────────────────────────────────────────

    fn live_processes(&self) -> usize {
        self.sessions
            .values()
            .filter(|entry| entry.process.is_some())
            .count()
    }

    fn capacity(&self) -> usize {
        usize::try_from(self.config.scheduler.max_concurrent_jobs).unwrap_or(usize::MAX)
    }

    /// Fill free slots: validated resumes first, then the queue.
    async fn admit(&mut self) {
        while !self.shutting_down && self.live_processes() < self.capacity() {
            if let Some(id) = self.resume_waiters.pop_front() {
                self.launch(&id, LaunchMode::Restore).await;
            } else if let Some(id) = self.queue.pop() {
                self.launch(&id, LaunchMode::Fresh).await;
            } else {
                break;
            }
        }
    }

    async fn launch(&mut self, id: &str, mode: LaunchMode) {
        let Some(entry) = self.sessions.get_mut(id) else {
            return;
        };
        if entry.process.is_some() {
            error!(session_id = id, "refusing to launch a second process");
            return;
        }

        let generation = entry.session.generation + 1;
        let spawned = self.supervisor.spawn(
            &entry.session.job,
            id,
            generation,
            mode,
            entry.known.clone(),
        );

        match spawned {
            Ok(handle) => {
                entry.session.generation = generation;
                entry.process = Some(handle);
                entry.pending = None;
                if mode == LaunchMode::Fresh {
                    if let Err(err) = self.apply_transition(id, SessionState::Running) {
                        error!(session_id = id, %err, "admitted session in unexpected state");
                    }
                }
                self.persist(id).await;
            }
            Err(err) => {
                error!(session_id = id, %err, "engine launch failed");
                self.fail(id, err, None).await;
            }
        }
    }

    // ── Monitor events ───────────────────────────────────────

    async fn handle_monitor(&mut self, event: MonitorEvent) {
        let Some(entry) = self.sessions.get(&event.session_id) else {
            debug!(session_id = event.session_id.as_str(), "event for unknown session");
            return;
        };
        if entry.session.generation != event.generation {
            debug!(
                session_id = event.session_id.as_str(),
                generation = event.generation,
                current = entry.session.generation,
                "dropping event from a previous process"
            );
            return;
        }

        let id = event.session_id;
        match event.kind {
            MonitorEventKind::Progress(snapshot) => self.on_progress(&id, snapshot).await,
            MonitorEventKind::DeviceError { device, message } => {
                let detail = match device {
                    Some(d) => format!("device #{d}: {message}"),
                    None => message,
                };
                self.fail_live(&id, AppError::DeviceError(detail)).await;
            }
            MonitorEventKind::Malformed {
                consecutive,
                detail,
            } => {
                self.fail_live(
                    &id,
                    AppError::StatusStreamMalformed(format!(
                        "{consecutive} consecutive malformed records, last: {detail}"
                    )),
                )
                .await;
            }
            MonitorEventKind::Unresponsive { silent_seconds } => {
                self.fail_live(
                    &id,
                    AppError::UnexpectedExit(format!(
                        "engine unresponsive for {silent_seconds}s"
                    )),
                )
                .await;
            }
            MonitorEventKind::Recovered(entry) => self.on_recovered(&id, entry),
            MonitorEventKind::Exited(outcome) => self.on_exit(&id, outcome).await,
        }
    }

    async fn on_progress(&mut self, id: &str, snapshot: ProgressSnapshot) {
        let Some(entry) = self.sessions.get(id) else {
            return;
        };
        match entry.session.state {
            SessionState::Resuming => {
                // First status record: the engine has loaded its restore file.
                if self.apply_transition(id, SessionState::Running).is_err() {
                    return;
                }
                info!(session_id = id, "engine confirmed restore");
            }
            SessionState::Running => {}
            _ => return,
        }

        let Some(entry) = self.sessions.get_mut(id) else {
            return;
        };
        let floor = entry.floor;
        if entry.session.record_snapshot(snapshot.clone(), floor) {
            self.broadcaster.publish(id, EventPayload::Progress(snapshot));
            self.persist(id).await;
        } else {
            debug!(
                session_id = id,
                percent = snapshot.percent,
                floor,
                "discarding regressing snapshot"
            );
        }
    }

    fn on_recovered(&mut self, id: &str, found: PotEntry) {
        let Some(entry) = self.sessions.get_mut(id) else {
            return;
        };
        if !entry.known.insert(found.hash.clone()) {
            return;
        }
        let count = u64::try_from(entry.known.len()).unwrap_or(u64::MAX);
        entry.session.stats.recovered_count = entry.session.stats.recovered_count.max(count);
        info!(session_id = id, recovered = count, "digest recovered");
        self.broadcaster.publish(
            id,
            EventPayload::Recovered {
                hash: found.hash,
                plain: found.plain,
            },
        );
    }

    async fn on_exit(&mut self, id: &str, outcome: ExitOutcome) {
        let Some(entry) = self.sessions.get_mut(id) else {
            return;
        };
        entry.process = None;
        let pending = entry.pending.take();
        let state = entry.session.state;
        let finished = matches!(outcome.code, Some(EXIT_CRACKED | EXIT_EXHAUSTED));
        debug!(
            session_id = id,
            state = state.as_str(),
            ?pending,
            code = outcome.code,
            "engine exit observed"
        );

        match (state, pending) {
            (s, _) if s.is_terminal() => {}
            (SessionState::Resuming, Some(Pending::Detach)) => {
                info!(session_id = id, "left resuming for the next start");
            }
            (SessionState::Running, Some(Pending::Pause)) if !finished => {
                self.save_checkpoint(id, SessionState::Paused).await;
                if self.apply_transition(id, SessionState::Paused).is_ok() {
                    info!(session_id = id, detail = outcome.detail.as_str(), "session paused");
                }
            }
            (SessionState::Running | SessionState::Resuming, _) if finished => {
                self.complete(id, outcome.code == Some(EXIT_CRACKED));
            }
            (SessionState::Resuming, _) => {
                let err = AppError::CorruptCheckpoint(format!(
                    "engine rejected restore file: {}",
                    outcome.detail
                ));
                self.fail(id, err, outcome.code).await;
            }
            (SessionState::Running, _) => {
                self.save_checkpoint(id, SessionState::Failed).await;
                self.fail(id, AppError::UnexpectedExit(outcome.detail.clone()), outcome.code)
                    .await;
            }
            (other, _) => {
                warn!(session_id = id, state = other.as_str(), "exit in unexpected state");
            }
        }

        self.persist(id).await;
        self.finalize_if_reaped(id).await;
        self.admit().await;
    }

    // ── Transitions ──────────────────────────────────────────

    fn apply_transition(&mut self, id: &str, next: SessionState) -> Result<SessionState> {
        let entry = self.sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        let prev = entry.session.transition(next)?;
        info!(
            session_id = id,
            from = prev.as_str(),
            to = next.as_str(),
            "session state changed"
        );
        self.broadcaster
            .publish(id, EventPayload::StateChanged { from: prev, to: next });
        Ok(prev)
    }

    fn complete(&mut self, id: &str, cracked: bool) {
        let state = self.sessions.get(id).map(|e| e.session.state);
        if state == Some(SessionState::Resuming)
            && self.apply_transition(id, SessionState::Running).is_err()
        {
            return;
        }
        if let Some(entry) = self.sessions.get_mut(id) {
            entry.session.recovered = cracked || entry.session.stats.recovered_count > 0;
        }
        if self.apply_transition(id, SessionState::Completed).is_ok() {
            info!(session_id = id, cracked, "session completed");
        }
    }

    async fn fail(&mut self, id: &str, err: AppError, exit_code: Option<i32>) {
        if let Err(transition_err) = self.apply_transition(id, SessionState::Failed) {
            warn!(session_id = id, %err, %transition_err, "could not record failure");
            return;
        }
        if let Some(entry) = self.sessions.get_mut(id) {
            entry.session.failure = Some(FailureReason::from_error(&err, exit_code));
        }
        error!(session_id = id, %err, exit_code, "session failed");
        self.broadcaster.publish(
            id,
            EventPayload::Error {
                kind: err.kind(),
                detail: err.detail().to_owned(),
            },
        );
        self.persist(id).await;
        self.finalize_if_reaped(id).await;
    }

    /// Fail a session whose engine is still running, then kill it.
    async fn fail_live(&mut self, id: &str, err: AppError) {
        let live = self
            .sessions
            .get(id)
            .is_some_and(|e| !e.session.state.is_terminal() && e.process.is_some());
        if !live {
            return;
        }
        self.save_checkpoint(id, SessionState::Failed).await;
        self.fail(id, err, None).await;
        self.stop_process(id, Pending::Kill, Termination::Forced)
            .await;
    }

    async fn stop_process(&mut self, id: &str, pending: Pending, how: Termination) {
        let Some(entry) = self.sessions.get_mut(id) else {
            return;
        };
        let Some(handle) = entry.process.as_ref() else {
            return;
        };
        entry.pending = Some(pending);
        self.supervisor.terminate(handle, how).await;
    }

    // ── Durability ───────────────────────────────────────────

    async fn save_checkpoint(&self, id: &str, state: SessionState) {
        let Some(entry) = self.sessions.get(id) else {
            return;
        };
        let restore_path = self.store.paths(id).restore_file;
        let restore_modified_at = restore_file_mtime(&restore_path);

        let record = CheckpointRecord::new(
            id.to_owned(),
            entry.session.job.id.clone(),
            restore_path,
            restore_modified_at,
            entry.session.stats.last_snapshot.clone(),
            state,
        );
        let saved = match record {
            Ok(record) => self.store.save(id, &record).await,
            Err(err) => Err(err),
        };
        if let Err(err) = saved {
            error!(session_id = id, %err, "checkpoint save failed");
        }
    }

    async fn autosave(&self) {
        let running: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, e)| {
                e.session.state == SessionState::Running
                    && e.pending.is_none()
                    && e.process.is_some()
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in running {
            self.save_checkpoint(&id, SessionState::Running).await;
        }
    }

    async fn persist(&self, id: &str) {
        let Some(entry) = self.sessions.get(id) else {
            return;
        };
        match tokio::time::timeout(self.config.io_timeout(), self.repo.upsert(&entry.session)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(session_id = id, %err, "failed to persist session"),
            Err(_) => warn!(session_id = id, "persisting session timed out"),
        }
    }

    /// Release per-session files once a terminal session has no process,
    /// then evict it from memory. Later queries read the session store.
    ///
    /// Failed sessions keep their checkpoint and restore file for
    /// inspection; retention removes the directory later. The potfile is
    /// always kept for result queries.
    async fn finalize_if_reaped(&mut self, id: &str) {
        let Some(entry) = self.sessions.get(id) else {
            return;
        };
        if !entry.session.state.is_terminal() || entry.process.is_some() {
            return;
        }
        let state = entry.session.state;
        let paths = self.store.paths(id);
        self.sessions.remove(id);
        debug!(session_id = id, state = state.as_str(), "session evicted");

        remove_if_present(&paths.target_file).await;
        if state != SessionState::Failed {
            remove_if_present(&paths.restore_file).await;
            if let Err(err) = self.store.delete(id).await {
                warn!(session_id = id, %err, "failed to delete checkpoint");
            }
        }
    }

    // ── Startup and shutdown ─────────────────────────────────

    async fn recover(&mut self) -> Result<()> {
        let unfinished = self.repo.list_unfinished().await?;
        if unfinished.is_empty() {
            return Ok(());
        }
        info!(count = unfinished.len(), "recovering unfinished sessions");

        for session in unfinished {
            let id = session.id.clone();
            let state = session.state;
            let priority = session.job.priority();
            let mut entry = Entry::new(session);
            let potfile_path = self.store.paths(&id).potfile;
            match potfile::read_entries(&potfile_path).await {
                Ok(found) => entry.known.extend(found.into_iter().map(|e| e.hash)),
                Err(err) => warn!(session_id = id.as_str(), %err, "could not read potfile"),
            }
            self.sessions.insert(id.clone(), entry);

            match state {
                SessionState::Queued => self.queue.push(id.clone(), priority),
                SessionState::Paused => {}
                SessionState::Running | SessionState::Resuming => {
                    match self.store.load(&id).await {
                        Ok(_) => {
                            if let Some(entry) = self.sessions.get_mut(&id) {
                                let prev = entry.session.restore_paused();
                                self.broadcaster.publish(
                                    &id,
                                    EventPayload::StateChanged {
                                        from: prev,
                                        to: SessionState::Paused,
                                    },
                                );
                            }
                            info!(
                                session_id = id.as_str(),
                                "interrupted session restored as paused"
                            );
                        }
                        Err(err) => {
                            warn!(
                                session_id = id.as_str(),
                                %err,
                                "no usable checkpoint for interrupted session"
                            );
                            self.fail(
                                &id,
                                AppError::UnexpectedExit(format!(
                                    "orchestrator stopped while the engine was running: {}",
                                    err.detail()
                                )),
                                None,
                            )
                            .await;
                        }
                    }
                }
                SessionState::Completed | SessionState::Failed | SessionState::Cancelled => {}
            }
            self.persist(&id).await;
        }
        Ok(())
    }

    async fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!(live = self.live_processes(), "coordinator shutting down");

        let live: Vec<(SessionId, SessionState)> = self
            .sessions
            .iter()
            .filter(|(_, e)| e.process.is_some() && e.pending.is_none())
            .map(|(id, e)| (id.clone(), e.session.state))
            .collect();

        for (id, state) in live {
            let pending = if state == SessionState::Resuming {
                Pending::Detach
            } else {
                Pending::Pause
            };
            self.stop_process(&id, pending, Termination::Graceful).await;
        }
    }
}

async fn remove_if_present(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "failed to remove session file"),
    }
}

fn not_found(id: &str) -> AppError {
    AppError::NotFound(format!("session {id} not found"))
}

fn store_timeout() -> AppError {
    AppError::Db("session store query timed out".into())
}

fn shutting_down() -> AppError {
    AppError::Shutdown("orchestrator is shutting down".into())
}
