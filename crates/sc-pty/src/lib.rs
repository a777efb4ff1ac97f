//! Pseudo-terminal process management for shellcast sessions.
//!
//! A [`PtyProcess`] owns exactly one child process attached to one
//! pseudo-terminal. It exposes the child's output as a bounded stream of
//! byte chunks, an ordered input/resize queue, signal delivery, and exit
//! status reporting. Dropping it kills the child (if still running) and
//! releases the terminal.
//!
//! Key components:
//! - [`PtyCommand`]: what to run (program, args, env, cwd, `TERM`)
//! - [`PtyProcess`]: the live child + pty pair
//! - [`PtyOutput`]: the finite, order-preserving output stream
//! - [`ExitStatus`] / [`PtySignal`]

pub mod command;
pub mod error;
pub mod process;

pub use command::PtyCommand;
pub use error::{PtyError, Result};
pub use process::{ExitStatus, PtyOptions, PtyOutput, PtyProcess, PtySignal, TermSize};
