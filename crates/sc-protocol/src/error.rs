use thiserror::Error;

use crate::frame::FrameKind;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame tag 0x{tag:02x}")]
    UnknownTag { tag: u8 },

    #[error("{kind} frame declares {len} payload bytes, limit is {max}")]
    FrameTooLarge { kind: FrameKind, len: usize, max: usize },

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: FrameKind, reason: String },

    /// A message-oriented transport delivered something other than frame
    /// bytes (for example a WebSocket text message).
    #[error("{0} message where binary frame data was expected")]
    NotBinary(&'static str),

    #[error("protocol I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn invalid(kind: FrameKind, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind,
            reason: reason.into(),
        }
    }

    /// Tag of the offending frame, when one was read.
    pub fn tag(&self) -> Option<u8> {
        match self {
            Self::UnknownTag { tag } => Some(*tag),
            Self::FrameTooLarge { kind, .. } | Self::InvalidPayload { kind, .. } => Some(kind.tag()),
            Self::NotBinary(_) | Self::Io(_) => None,
        }
    }
}
