use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtyError {
    /// The executable could not be located or the OS refused to create the
    /// process. Never retried.
    #[error("pty spawn failed: {0}")]
    Spawn(String),

    /// The pty (or its input side) has already been closed.
    #[error("pty is closed")]
    Closed,

    #[error("pty I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pty internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PtyError>;
