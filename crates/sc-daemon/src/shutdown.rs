use std::sync::{Arc, OnceLock};
use std::time::Duration;

use sc_session::SessionRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Why the daemon is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// An OS signal, by name.
    Signal(&'static str),
    /// No session was live for the configured idle period.
    Idle,
    /// Requested through the API (embedding, tests).
    Requested,
}

/// Cooperative shutdown coordinator.
///
/// Cloned into every component that must stop; the first `trigger` wins
/// and later ones only log.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    cause: Arc<OnceLock<ShutdownCause>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start shutdown. Returns false if it had already started.
    pub fn trigger(&self, cause: ShutdownCause) -> bool {
        if self.cause.set(cause).is_ok() {
            info!(?cause, "shutdown signal triggered");
            self.token.cancel();
            true
        } else {
            warn!(?cause, "shutdown already triggered");
            false
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        self.cause.get().copied()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }
}

/// Wait for SIGINT (ctrl-c) or SIGTERM; returns the signal's name.
pub async fn os_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Session drain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// Every session closed.
    Complete,
    /// The timeout passed with sessions still registered.
    Timeout { remaining: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete)
    }
}

/// Close every session with `reason` and wait, bounded by `timeout`, for
/// the registry to empty. Sessions that register while draining are closed
/// too.
pub async fn drain_sessions(
    registry: &SessionRegistry,
    reason: &str,
    timeout: Duration,
) -> DrainResult {
    let mut live = registry.subscribe();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let asked = registry.close_all(reason);
        let current = *live.borrow_and_update();
        if current == 0 {
            info!("all sessions drained");
            return DrainResult::Complete;
        }
        if asked > 0 {
            info!(sessions = current, "waiting for sessions to close");
        }
        match tokio::time::timeout_at(deadline, live.changed()).await {
            Ok(Ok(())) => continue,
            // The registry is gone, so nothing is left to wait for.
            Ok(Err(_)) => return DrainResult::Complete,
            Err(_) => {
                let remaining = registry.len();
                warn!(remaining, "drain timeout, some sessions did not close");
                return DrainResult::Timeout { remaining };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
