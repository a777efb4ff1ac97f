use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

pub const TAG_OUTPUT: u8 = 0x01;
pub const TAG_INPUT: u8 = 0x02;
pub const TAG_RESIZE: u8 = 0x03;
pub const TAG_CLOSE: u8 = 0x10;
pub const TAG_EXIT: u8 = 0x11;
pub const TAG_PING: u8 = 0x12;
pub const TAG_PONG: u8 = 0x13;
pub const TAG_SIGNAL: u8 = 0x14;

/// Discriminant of a [`Frame`], one per wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Output,
    Input,
    Resize,
    Close,
    Exit,
    Ping,
    Pong,
    Signal,
}

impl FrameKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            TAG_OUTPUT => Self::Output,
            TAG_INPUT => Self::Input,
            TAG_RESIZE => Self::Resize,
            TAG_CLOSE => Self::Close,
            TAG_EXIT => Self::Exit,
            TAG_PING => Self::Ping,
            TAG_PONG => Self::Pong,
            TAG_SIGNAL => Self::Signal,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::Output => TAG_OUTPUT,
            Self::Input => TAG_INPUT,
            Self::Resize => TAG_RESIZE,
            Self::Close => TAG_CLOSE,
            Self::Exit => TAG_EXIT,
            Self::Ping => TAG_PING,
            Self::Pong => TAG_PONG,
            Self::Signal => TAG_SIGNAL,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Output => "OUTPUT",
            Self::Input => "INPUT",
            Self::Resize => "RESIZE",
            Self::Close => "CLOSE",
            Self::Exit => "EXIT",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Signal => "SIGNAL",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:02x})", self.name(), self.tag())
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Signal a client may ask the server to deliver to its shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalSignal {
    Interrupt,
    Quit,
    Hangup,
    Terminate,
    Suspend,
    Kill,
}

impl TerminalSignal {
    pub fn from_wire(id: u8) -> Option<Self> {
        Some(match id {
            1 => Self::Interrupt,
            2 => Self::Quit,
            3 => Self::Hangup,
            4 => Self::Terminate,
            5 => Self::Suspend,
            6 => Self::Kill,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Interrupt => 1,
            Self::Quit => 2,
            Self::Hangup => 3,
            Self::Terminate => 4,
            Self::Suspend => 5,
            Self::Kill => 6,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Control messages, carried alongside terminal data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// The sender is ending the session.
    Close { reason: String },
    /// The shell exited. Sent by the server before `Close`.
    Exit { code: u32, signal: Option<String> },
    Ping(Bytes),
    Pong(Bytes),
    Signal(TerminalSignal),
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Server to client: bytes produced by the shell.
    Output(Bytes),
    /// Client to server: keystrokes for the shell.
    Input(Bytes),
    /// Client to server: new window size in character cells.
    Resize { rows: u16, cols: u16 },
    Control(Control),
}

impl Frame {
    pub fn output(data: impl Into<Bytes>) -> Self {
        Frame::Output(data.into())
    }

    pub fn input(data: impl Into<Bytes>) -> Self {
        Frame::Input(data.into())
    }

    pub fn resize(rows: u16, cols: u16) -> Self {
        Frame::Resize { rows, cols }
    }

    pub fn close(reason: impl Into<String>) -> Self {
        Frame::Control(Control::Close {
            reason: reason.into(),
        })
    }

    /// An empty signal name is the same as none on the wire.
    pub fn exit(code: u32, signal: Option<String>) -> Self {
        Frame::Control(Control::Exit {
            code,
            signal: signal.filter(|s| !s.is_empty()),
        })
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        Frame::Control(Control::Ping(data.into()))
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        Frame::Control(Control::Pong(data.into()))
    }

    pub fn signal(signal: TerminalSignal) -> Self {
        Frame::Control(Control::Signal(signal))
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Output(_) => FrameKind::Output,
            Frame::Input(_) => FrameKind::Input,
            Frame::Resize { .. } => FrameKind::Resize,
            Frame::Control(Control::Close { .. }) => FrameKind::Close,
            Frame::Control(Control::Exit { .. }) => FrameKind::Exit,
            Frame::Control(Control::Ping(_)) => FrameKind::Ping,
            Frame::Control(Control::Pong(_)) => FrameKind::Pong,
            Frame::Control(Control::Signal(_)) => FrameKind::Signal,
        }
    }

    /// Length of the encoded payload, excluding the header.
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Output(data) | Frame::Input(data) => data.len(),
            Frame::Resize { .. } => 4,
            Frame::Control(Control::Close { reason }) => reason.len(),
            Frame::Control(Control::Exit { signal, .. }) => {
                4 + signal.as_ref().map_or(0, String::len)
            }
            Frame::Control(Control::Ping(data) | Control::Pong(data)) => data.len(),
            Frame::Control(Control::Signal(_)) => 1,
        }
    }
}
