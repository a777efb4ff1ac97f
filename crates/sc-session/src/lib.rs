//! Terminal sessions: one client connection bound to one pty process.
//!
//! - [`SessionManager`] admits connections (authorization, capacity,
//!   spawn) and runs each session's pumps and supervisor.
//! - [`SessionRegistry`] tracks live sessions for listing, operator close
//!   and shutdown.
//! - [`transport`] defines the frame sink/source seam that listeners
//!   implement, plus an in-process pair for tests.

pub mod auth;
pub mod manager;
pub mod registry;
pub mod session;
pub mod transport;

pub use auth::{AllowAll, AuthChain, AuthDecision, Authorizer, OriginAllowlist, SharedSecret};
pub use manager::{SessionManager, SessionSettings, StartError};
pub use registry::{CapacityError, Registration, Reservation, SessionRegistry, REMOVED_REASON};
pub use session::{
    CloseReason, SessionHandle, SessionOutcome, SessionState, SessionSummary, StatsSnapshot,
};
pub use transport::{
    ClientEnd, Connection, ConnectionInfo, FrameSink, FrameSource, InProcessTransport,
    TransportError, TransportKind,
};
