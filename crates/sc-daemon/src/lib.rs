//! The shellcast server process: wires configuration, the session layer and
//! the transport listeners together and owns graceful shutdown.

pub mod daemon;
pub mod shutdown;

pub use daemon::{Daemon, SHUTDOWN_REASON};
pub use shutdown::{drain_sessions, DrainResult, ShutdownCause, ShutdownSignal};
