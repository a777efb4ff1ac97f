use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::session::{SessionHandle, SessionSummary};

/// Close reason used by [`SessionRegistry::remove`].
pub const REMOVED_REASON: &str = "closed by operator";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("server at capacity ({max} sessions)")]
pub struct CapacityError {
    pub max: usize,
}

/// Live sessions, keyed by id, with admission control.
///
/// Slots are claimed with [`try_reserve`](Self::try_reserve) before any pty
/// is allocated, so a refused client costs nothing. A slot stays taken until
/// its [`Reservation`] is dropped unused or its [`Registration`] is dropped.
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionHandle>,
    slots: AtomicUsize,
    max_sessions: usize,
    next_seq: AtomicU64,
    live: watch::Sender<usize>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Arc<Self> {
        info!(max_sessions, "creating SessionRegistry");
        let (live, _) = watch::channel(0);
        Arc::new(Self {
            sessions: DashMap::new(),
            slots: AtomicUsize::new(0),
            max_sessions,
            next_seq: AtomicU64::new(1),
            live,
        })
    }

    /// Claim a slot, or fail without side effects when all are taken.
    pub fn try_reserve(self: &Arc<Self>) -> Result<Reservation, CapacityError> {
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_sessions).then_some(n + 1)
            })
            .map_err(|_| CapacityError {
                max: self.max_sessions,
            })?;
        Ok(Reservation {
            registry: Arc::clone(self),
            armed: true,
        })
    }

    /// Reserve and register in one step.
    pub fn add(self: &Arc<Self>, handle: SessionHandle) -> Result<Registration, CapacityError> {
        Ok(self.try_reserve()?.register(handle))
    }

    /// Creation sequence number for the next session.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Take a session out of service. Returns false if the id is unknown.
    ///
    /// The session is asked to close and stays listed, holding its slot,
    /// until it has finished tearing down. Repeating the call is harmless.
    pub fn remove(&self, id: Uuid) -> bool {
        self.close(id, REMOVED_REASON)
    }

    /// Drop the entry and free its slot once the session is gone.
    fn release(&self, id: Uuid) {
        if self.sessions.remove(&id).is_some() {
            self.release_slot();
            self.publish();
            debug!(%id, "session deregistered");
        }
    }

    pub fn get(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every live session, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut summaries: Vec<SessionSummary> = handles.iter().map(SessionHandle::summary).collect();
        summaries.sort_by_key(|s| s.seq);
        summaries
    }

    /// Ask one session to close. Returns false if the id is unknown.
    pub fn close(&self, id: Uuid, reason: &str) -> bool {
        match self.get(id) {
            Some(handle) => {
                info!(%id, reason, "closing session");
                handle.close(reason);
                true
            }
            None => false,
        }
    }

    /// Ask every live session to close; returns how many were asked.
    pub fn close_all(&self, reason: &str) -> usize {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for handle in &handles {
            handle.close(reason);
        }
        if !handles.is_empty() {
            info!(count = handles.len(), reason, "closing all sessions");
        }
        handles.len()
    }

    /// Registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Slots in use, including reservations not yet registered.
    pub fn reserved(&self) -> usize {
        self.slots.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }

    /// Watch the number of registered sessions.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.live.subscribe()
    }

    /// Resolve once no session is registered.
    pub async fn wait_idle(&self) {
        let mut rx = self.live.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn release_slot(&self) {
        let _ = self
            .slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn publish(&self) {
        // Read the length under the watch lock so racing publishers cannot
        // leave a stale count behind.
        self.live.send_modify(|n| *n = self.sessions.len());
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("max_sessions", &self.max_sessions)
            .field("len", &self.len())
            .field("reserved", &self.reserved())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Reservation / Registration
// ---------------------------------------------------------------------------

/// A claimed slot with no session in it yet. Dropping it frees the slot.
#[must_use = "dropping a Reservation releases the slot"]
pub struct Reservation {
    registry: Arc<SessionRegistry>,
    armed: bool,
}

impl Reservation {
    /// Put a session into the reserved slot.
    pub fn register(mut self, handle: SessionHandle) -> Registration {
        self.armed = false;
        let id = handle.id();
        self.registry.sessions.insert(id, handle);
        self.registry.publish();
        debug!(%id, "session registered");
        Registration {
            registry: Arc::clone(&self.registry),
            id,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.registry.release_slot();
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("armed", &self.armed)
            .finish()
    }
}

/// Keeps a session listed. Dropping it deregisters the session.
#[must_use = "dropping a Registration deregisters the session"]
pub struct Registration {
    registry: Arc<SessionRegistry>,
    id: Uuid,
}

impl Registration {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
