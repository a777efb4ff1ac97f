//! Wire protocol spoken between shellcast and its clients.
//!
//! Every message is a tagged, length-prefixed frame:
//!
//! ```text
//! +--------+------------------+-------------------+
//! | tag u8 | len u32 (BE)     | payload[len]      |
//! +--------+------------------+-------------------+
//! ```
//!
//! The same encoding is carried inside WebSocket binary messages and on raw
//! byte streams (via [`FrameCodec`]).

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::{encode, encode_into, FrameCodec, FrameDecoder};
pub use error::ProtocolError;
pub use frame::{Control, Frame, FrameKind, TerminalSignal};

/// Size of the fixed frame header (tag + length).
pub const HEADER_LEN: usize = 5;

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
