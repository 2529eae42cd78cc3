//! Long-lived session supervision.
//!
//! A session is a spawned GDB or print server with allocated ports and a
//! held probe lock. The supervisor task owns the lock for the session's
//! whole lifetime and drives the state machine
//!
//! ```text
//! NEW -> AWAITING_CLIENT -> ATTACHED -> DRAINING -> STOPPED
//! ```
//!
//! terminating on attach timeout, on full client disconnect (debounced over
//! two samples), on server exit, and on forced stop. Lock release happens
//! exactly once, at the very end of the task, and a stop request observes it
//! through the `done` watch channel before returning.

pub mod net;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Mode;
use crate::container::{ContainerManager, SpawnedServer};
use crate::lock::ProbeLock;
use crate::ports::SessionPorts;

/// Grace period for the first client to connect.
pub const T_ATTACH: Duration = Duration::from_secs(60);
/// SIGTERM-to-SIGKILL escalation window.
pub const T_TERM: Duration = Duration::from_secs(5);
/// Client presence sampling cadence.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive zero-client samples before a session drains.
const ZERO_SAMPLES_TO_DRAIN: u32 = 2;

/// Supervisor states for a long-lived session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    AwaitingClient,
    Attached,
    Draining,
    Stopped,
}

/// Why a session reached STOPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AttachTimeout,
    ServerExited,
    ClientDisconnected,
    Forced,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AttachTimeout => "attach_timeout",
            Self::ServerExited => "server_exited",
            Self::ClientDisconnected => "client_disconnected",
            Self::Forced => "forced",
        }
    }
}

/// Which sessions a stop request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopKind {
    Debug,
    Print,
    #[default]
    All,
}

impl StopKind {
    pub fn matches(&self, mode: Mode) -> bool {
        match self {
            Self::All => true,
            Self::Debug => mode == Mode::Debug,
            Self::Print => mode == Mode::Print,
        }
    }
}

impl FromStr for StopKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "print" => Ok(Self::Print),
            "all" => Ok(Self::All),
            _ => Err(format!("unknown stop kind '{s}'")),
        }
    }
}

/// Serializable snapshot of a live session, for `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub mode: Mode,
    /// Supervisor state; absent for flash executions.
    pub state: Option<SessionState>,
    pub container: String,
    pub pid: Option<u32>,
    pub gdb_port: u16,
    pub telnet_port: u16,
    pub rtt_port: u16,
    pub print_port: u16,
    pub started_at: i64,
}

struct SessionEntry {
    mode: Mode,
    container: String,
    pid: Option<u32>,
    ports: SessionPorts,
    started_at: OffsetDateTime,
    state: Option<Arc<Mutex<SessionState>>>,
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

impl SessionEntry {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            mode: self.mode,
            state: self.state.as_ref().map(|s| *s.lock()),
            container: self.container.clone(),
            pid: self.pid,
            gdb_port: self.ports.gdb,
            telnet_port: self.ports.telnet,
            rtt_port: self.ports.rtt,
            print_port: self.ports.print,
            started_at: self.started_at.unix_timestamp(),
        }
    }
}

/// Result of a stop request against one probe.
#[derive(Debug, Clone, Default)]
pub struct StopOutcome {
    /// Modes of the sessions that were stopped.
    pub stopped: Vec<Mode>,
    /// An in-flight upload was aborted.
    pub upload_aborted: bool,
}

impl StopOutcome {
    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty() && !self.upload_aborted
    }
}

#[derive(Default)]
struct TableInner {
    sessions: Mutex<HashMap<u16, SessionEntry>>,
    uploads: Mutex<HashMap<u16, CancellationToken>>,
    last_reasons: Mutex<HashMap<u16, StopReason>>,
}

/// The in-memory session table, keyed by probe id. At most one entry per
/// probe; the probe lock enforces that before the table ever sees a second.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<TableInner>,
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("active", &self.active_probe_ids())
            .finish()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self, probe_id: u16) -> bool {
        self.inner.sessions.lock().contains_key(&probe_id)
    }

    pub fn info(&self, probe_id: u16) -> Option<SessionInfo> {
        self.inner
            .sessions
            .lock()
            .get(&probe_id)
            .map(SessionEntry::info)
    }

    pub fn active_probe_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.inner.sessions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn last_reason(&self, probe_id: u16) -> Option<StopReason> {
        self.inner.last_reasons.lock().get(&probe_id).copied()
    }

    fn record_reason(&self, probe_id: u16, reason: StopReason) {
        self.inner.last_reasons.lock().insert(probe_id, reason);
    }

    fn remove(&self, probe_id: u16) {
        self.inner.sessions.lock().remove(&probe_id);
    }

    /// Registers an upload in flight for this probe so a concurrent
    /// `kind=all` stop can abort it. The guard deregisters on drop.
    pub fn register_upload(&self, probe_id: u16) -> UploadGuard {
        let token = CancellationToken::new();
        self.inner
            .uploads
            .lock()
            .insert(probe_id, token.clone());
        UploadGuard {
            table: self.clone(),
            probe_id,
            token,
        }
    }

    fn cancel_upload(&self, probe_id: u16) -> bool {
        if let Some(token) = self.inner.uploads.lock().get(&probe_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Stops the matching session on `probe_id`, waiting for its lock to be
    /// released before returning. `kind=all` also aborts in-flight uploads.
    pub async fn stop_matching(&self, probe_id: u16, kind: StopKind) -> StopOutcome {
        let mut outcome = StopOutcome::default();

        if kind == StopKind::All {
            outcome.upload_aborted = self.cancel_upload(probe_id);
        }

        let target = {
            let sessions = self.inner.sessions.lock();
            sessions.get(&probe_id).and_then(|entry| {
                kind.matches(entry.mode)
                    .then(|| (entry.mode, entry.token.clone(), entry.done.clone()))
            })
        };

        if let Some((mode, token, mut done)) = target {
            tracing::info!(probe = probe_id, %mode, "forcing session stop");
            token.cancel();
            // The owner flips `done` only after the probe lock is dropped, so
            // a dispatch racing this stop cannot see BUSY from the old owner.
            if done.wait_for(|finished| *finished).await.is_err() {
                tracing::debug!(probe = probe_id, "session owner dropped before signalling");
            }
            outcome.stopped.push(mode);
        }

        outcome
    }

    /// Stops everything. Used on server shutdown.
    pub async fn stop_all(&self) {
        for probe_id in self.active_probe_ids() {
            self.stop_matching(probe_id, StopKind::All).await;
        }
    }

    fn insert(&self, probe_id: u16, entry: SessionEntry) {
        let previous = self.inner.sessions.lock().insert(probe_id, entry);
        debug_assert!(
            previous.is_none(),
            "session table already held an entry for probe {probe_id}"
        );
    }

    /// Registers a flash execution so `kind=all` stops can reach it. Returns
    /// the completion sender the dispatcher must fire after lock release.
    pub fn register_flash(
        &self,
        probe_id: u16,
        container: String,
        ports: SessionPorts,
        token: CancellationToken,
    ) -> FlashGuard {
        let (done_tx, done_rx) = watch::channel(false);
        self.insert(
            probe_id,
            SessionEntry {
                mode: Mode::Flash,
                container,
                pid: None,
                ports,
                started_at: OffsetDateTime::now_utc(),
                state: None,
                token,
                done: done_rx,
            },
        );
        FlashGuard {
            table: self.clone(),
            probe_id,
            done: done_tx,
        }
    }
}

/// Deregisters an upload when the multipart stream is done with it.
#[derive(Debug)]
pub struct UploadGuard {
    table: SessionTable,
    probe_id: u16,
    pub token: CancellationToken,
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        self.table.inner.uploads.lock().remove(&self.probe_id);
    }
}

/// Keeps a flash execution visible in the session table. The dispatcher
/// drops this after the probe lock, signalling any waiting stop request.
#[derive(Debug)]
pub struct FlashGuard {
    table: SessionTable,
    probe_id: u16,
    done: watch::Sender<bool>,
}

impl FlashGuard {
    pub fn finish(self, reason: Option<StopReason>) {
        if let Some(reason) = reason {
            self.table.record_reason(self.probe_id, reason);
        }
        // Drop runs next: removes the entry and flips `done`.
    }
}

impl Drop for FlashGuard {
    fn drop(&mut self) {
        self.table.remove(self.probe_id);
        let _ = self.done.send(true);
    }
}

/// What one presence sample means for the state machine.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Stay,
    Attach,
    Terminal(StopReason),
}

fn step(
    state: SessionState,
    clients: usize,
    attach_deadline_passed: bool,
    zero_samples: &mut u32,
) -> Step {
    match state {
        SessionState::AwaitingClient => {
            if clients > 0 {
                *zero_samples = 0;
                Step::Attach
            } else if attach_deadline_passed {
                Step::Terminal(StopReason::AttachTimeout)
            } else {
                Step::Stay
            }
        }
        SessionState::Attached => {
            if clients == 0 {
                *zero_samples += 1;
                if *zero_samples >= ZERO_SAMPLES_TO_DRAIN {
                    Step::Terminal(StopReason::ClientDisconnected)
                } else {
                    Step::Stay
                }
            } else {
                *zero_samples = 0;
                Step::Stay
            }
        }
        // NEW never reaches the sampler; DRAINING and STOPPED are handled
        // outside the sampling loop.
        _ => Step::Stay,
    }
}

/// Supervises one spawned server process.
pub struct Supervisor {
    probe_id: u16,
    mode: Mode,
    server: SpawnedServer,
    primary_port: u16,
    lock: ProbeLock,
    containers: ContainerManager,
    table: SessionTable,
    token: CancellationToken,
    state: Arc<Mutex<SessionState>>,
    done: watch::Sender<bool>,
}

impl Supervisor {
    /// Registers the session in the table and spawns the supervisor task.
    /// The lock handle moves into the task and lives exactly as long as it.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        probe_id: u16,
        mode: Mode,
        server: SpawnedServer,
        ports: SessionPorts,
        lock: ProbeLock,
        containers: ContainerManager,
        table: SessionTable,
    ) -> tokio::task::JoinHandle<()> {
        let token = CancellationToken::new();
        let state = Arc::new(Mutex::new(SessionState::New));
        let (done_tx, done_rx) = watch::channel(false);

        table.insert(
            probe_id,
            SessionEntry {
                mode,
                container: server.container().to_string(),
                pid: server.pid(),
                ports,
                started_at: OffsetDateTime::now_utc(),
                state: Some(state.clone()),
                token: token.clone(),
                done: done_rx,
            },
        );

        let supervisor = Self {
            probe_id,
            mode,
            server,
            primary_port: ports.primary(mode),
            lock,
            containers,
            table,
            token,
            state,
            done: done_tx,
        };

        tokio::spawn(supervisor.run())
    }

    async fn run(self) {
        let Self {
            probe_id,
            mode,
            mut server,
            primary_port,
            lock,
            containers,
            table,
            token,
            state,
            done,
        } = self;

        debug_assert_eq!(lock.probe_id(), probe_id);

        let reason = watch_clients(&mut server, primary_port, &token, &state).await;

        *state.lock() = SessionState::Draining;
        terminate(&mut server, &containers, reason == StopReason::ServerExited).await;
        *state.lock() = SessionState::Stopped;

        tracing::info!(
            probe = probe_id,
            %mode,
            reason = reason.as_str(),
            "session stopped"
        );

        table.record_reason(probe_id, reason);
        table.remove(probe_id);
        // Lock release must precede the done signal: a stop request returns
        // only once a follow-up dispatch can win the lock.
        drop(lock);
        let _ = done.send(true);
    }
}

async fn watch_clients(
    server: &mut SpawnedServer,
    primary_port: u16,
    token: &CancellationToken,
    state: &Arc<Mutex<SessionState>>,
) -> StopReason {
    *state.lock() = SessionState::AwaitingClient;

    let attach_deadline = Instant::now() + T_ATTACH;
    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut zero_samples = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => return StopReason::Forced,
            _ = server.wait() => return StopReason::ServerExited,
            _ = interval.tick() => {
                let clients = net::count_established(primary_port, server.pid());
                let current = *state.lock();
                match step(current, clients, Instant::now() >= attach_deadline, &mut zero_samples) {
                    Step::Stay => {}
                    Step::Attach => {
                        tracing::info!(port = primary_port, clients, "client attached");
                        *state.lock() = SessionState::Attached;
                    }
                    Step::Terminal(reason) => return reason,
                }
            }
        }
    }
}

/// SIGTERM, escalate to SIGKILL after [`T_TERM`], then sweep residual
/// server binaries inside the container.
async fn terminate(server: &mut SpawnedServer, containers: &ContainerManager, already_exited: bool) {
    if !already_exited {
        server.signal_term();
        if tokio::time::timeout(T_TERM, server.wait()).await.is_err() {
            tracing::warn!(
                container = server.container(),
                "server ignored SIGTERM, escalating"
            );
            server.kill().await;
        }
    }

    match containers
        .kill_named(server.container(), server.binary())
        .await
    {
        Ok(true) => tracing::warn!(
            container = server.container(),
            binary = server.binary(),
            "killed residual server processes"
        ),
        Ok(false) => {}
        Err(error) => tracing::warn!("residual process sweep failed: {error}"),
    }
}
