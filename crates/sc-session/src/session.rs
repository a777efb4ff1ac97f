use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sc_pty::{ExitStatus, TermSize};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::transport::{ConnectionInfo, TransportKind};

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Lifecycle: `Connecting → Active → Closing → Closed`, each step taken once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// CloseReason / SessionOutcome
// ---------------------------------------------------------------------------

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// The shell exited or closed its terminal.
    ChildExited,
    /// The client sent `CLOSE` with this reason.
    ClientClosed(String),
    /// The client went away without a `CLOSE`.
    TransportClosed,
    TransportError(String),
    ProtocolError(String),
    /// Closed from the server side (operator, shutdown).
    Server(String),
    IdleTimeout,
    HeartbeatFailed,
}

impl CloseReason {
    /// Short reason carried in the `CLOSE` frame sent to the client.
    pub fn wire_text(&self) -> String {
        match self {
            CloseReason::ChildExited => "shell exited".into(),
            CloseReason::ClientClosed(_) => "client closed".into(),
            CloseReason::TransportClosed => "connection lost".into(),
            CloseReason::TransportError(_) => "transport error".into(),
            CloseReason::ProtocolError(detail) => format!("protocol error: {detail}"),
            CloseReason::Server(reason) => reason.clone(),
            CloseReason::IdleTimeout => "idle timeout".into(),
            CloseReason::HeartbeatFailed => "heartbeat failed".into(),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ClientClosed(detail) if !detail.is_empty() => {
                write!(f, "client closed: {detail}")
            }
            CloseReason::TransportError(detail) => write!(f, "transport error: {detail}"),
            other => f.write_str(&other.wire_text()),
        }
    }
}

/// Final result of a session, available from [`SessionHandle::closed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub reason: CloseReason,
    /// `None` when the child could not be reaped in time.
    pub exit_status: Option<ExitStatus>,
}

// ---------------------------------------------------------------------------
// SessionStats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SessionStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    resizes: AtomicU64,
}

impl SessionStats {
    pub(crate) fn record_in(&self, bytes: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_out(&self, bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_resize(&self) {
        self.resizes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            resizes: self.resizes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Payload bytes of `INPUT` frames.
    pub bytes_in: u64,
    /// Payload bytes of `OUTPUT` frames.
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub resizes: u64,
}

// ---------------------------------------------------------------------------
// SessionSummary
// ---------------------------------------------------------------------------

/// Point-in-time view of a session, as listed by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub seq: u64,
    pub peer: String,
    pub transport: TransportKind,
    pub state: SessionState,
    pub rows: u16,
    pub cols: u16,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
}

// ---------------------------------------------------------------------------
// Shared session state
// ---------------------------------------------------------------------------

pub(crate) struct SessionShared {
    pub(crate) id: Uuid,
    pub(crate) seq: u64,
    pub(crate) peer: String,
    pub(crate) transport: TransportKind,
    pub(crate) pid: Option<u32>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) stats: SessionStats,
    started: Instant,
    state: AtomicU8,
    /// rows in the high half, cols in the low half.
    size: AtomicU32,
    last_activity_ms: AtomicU64,
    close_tx: mpsc::Sender<CloseReason>,
    outcome: watch::Sender<Option<SessionOutcome>>,
}

impl SessionShared {
    pub(crate) fn new(
        id: Uuid,
        seq: u64,
        info: &ConnectionInfo,
        size: TermSize,
        pid: Option<u32>,
        close_tx: mpsc::Sender<CloseReason>,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id,
            seq,
            peer: info.peer.clone(),
            transport: info.transport,
            pid,
            created_at: Utc::now(),
            stats: SessionStats::default(),
            started: Instant::now(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            size: AtomicU32::new(pack_size(size)),
            last_activity_ms: AtomicU64::new(0),
            close_tx,
            outcome,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `from → to`; false if the session was not in `from`.
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn size(&self) -> TermSize {
        unpack_size(self.size.load(Ordering::Relaxed))
    }

    pub(crate) fn set_size(&self, size: TermSize) {
        self.size.store(pack_size(size), Ordering::Relaxed);
    }

    pub(crate) fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let now = self.started.elapsed();
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        now.saturating_sub(last)
    }

    pub(crate) fn request_close(&self, reason: CloseReason) {
        // First request wins; later ones and requests after teardown are dropped.
        let _ = self.close_tx.try_send(reason);
    }

    pub(crate) fn finish(&self, outcome: SessionOutcome) {
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
        self.outcome.send_replace(Some(outcome));
    }
}

fn pack_size(size: TermSize) -> u32 {
    (u32::from(size.rows) << 16) | u32::from(size.cols)
}

fn unpack_size(packed: u32) -> TermSize {
    TermSize {
        rows: (packed >> 16) as u16,
        cols: (packed & 0xffff) as u16,
    }
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Cheap, cloneable reference to a running (or finished) session.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) inner: Arc<SessionShared>,
}

impl SessionHandle {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { inner: shared }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn size(&self) -> TermSize {
        self.inner.size()
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn summary(&self) -> SessionSummary {
        let size = self.inner.size();
        SessionSummary {
            id: self.inner.id,
            seq: self.inner.seq,
            peer: self.inner.peer.clone(),
            transport: self.inner.transport,
            state: self.inner.state(),
            rows: size.rows,
            cols: size.cols,
            pid: self.inner.pid,
            created_at: self.inner.created_at,
            idle_secs: self.inner.idle_for().as_secs(),
            stats: self.inner.stats.snapshot(),
        }
    }

    /// Ask the session to shut down. The client receives `CLOSE(reason)`.
    ///
    /// Idempotent: only the first request is honoured, and closing a session
    /// that already finished does nothing.
    pub fn close(&self, reason: impl Into<String>) {
        if self.state() == SessionState::Closed {
            return;
        }
        self.inner.request_close(CloseReason::Server(reason.into()));
    }

    /// Wait until the session has fully closed.
    pub async fn closed(&self) -> SessionOutcome {
        let mut rx = self.inner.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(SessionOutcome {
            reason: CloseReason::TransportClosed,
            exit_status: None,
        })
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("seq", &self.inner.seq)
            .field("state", &self.inner.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
