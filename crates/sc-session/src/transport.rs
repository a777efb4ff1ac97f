use std::time::Duration;

use async_trait::async_trait;
use sc_protocol::{Frame, ProtocolError};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => TransportError::Io(e),
            other => TransportError::Protocol(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

// ---------------------------------------------------------------------------
// TransportKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    WebSocket,
    Tcp,
    Unix,
    InProcess,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::WebSocket => write!(f, "websocket"),
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Unix => write!(f, "unix"),
            TransportKind::InProcess => write!(f, "in-process"),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// What the listener learned about a peer before handing it over.
///
/// Authorizers decide on this alone; `token` is whatever credential the
/// client presented and is never logged or serialized.
#[derive(Clone)]
pub struct ConnectionInfo {
    pub transport: TransportKind,
    pub peer: String,
    pub origin: Option<String>,
    pub token: Option<String>,
    pub user_agent: Option<String>,
}

impl ConnectionInfo {
    pub fn new(transport: TransportKind, peer: impl Into<String>) -> Self {
        Self {
            transport,
            peer: peer.into(),
            origin: None,
            token: None,
            user_agent: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("transport", &self.transport)
            .field("peer", &self.peer)
            .field("origin", &self.origin)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Outgoing half of a client connection.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Send one frame. Completes once the transport has accepted it, which
    /// is where output backpressure comes from.
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Flush and close the outgoing direction. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Incoming half of a client connection.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame from the client; `None` once the peer has gone away.
    async fn recv(&mut self) -> Option<Result<Frame>>;
}

/// An accepted, handshaken client connection, ready for a session.
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
    pub info: ConnectionInfo,
}

impl Connection {
    pub fn new(sink: impl FrameSink, source: impl FrameSource, info: ConnectionInfo) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
            info,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("info", &self.info).finish()
    }
}

// ---------------------------------------------------------------------------
// InProcessTransport (tests and embedding)
// ---------------------------------------------------------------------------

/// An in-process transport backed by flume channels.
pub struct InProcessTransport;

impl InProcessTransport {
    pub const DEFAULT_CAPACITY: usize = 64;

    /// Create a server-side [`Connection`] and the matching client end.
    pub fn pair(info: ConnectionInfo) -> (Connection, ClientEnd) {
        Self::pair_with_capacity(info, Self::DEFAULT_CAPACITY)
    }

    /// As [`pair`](Self::pair), with both directions bounded to `capacity`
    /// frames.
    pub fn pair_with_capacity(info: ConnectionInfo, capacity: usize) -> (Connection, ClientEnd) {
        let (to_client, from_server) = flume::bounded(capacity.max(1));
        let (to_server, from_client) = flume::bounded(capacity.max(1));

        let conn = Connection::new(
            ChannelSink {
                tx: Some(to_client),
            },
            ChannelSource { rx: from_client },
            info,
        );
        let client = ClientEnd {
            tx: Some(to_server),
            rx: from_server,
        };
        (conn, client)
    }
}

struct ChannelSink {
    tx: Option<flume::Sender<Frame>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send_async(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct ChannelSource {
    rx: flume::Receiver<Frame>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        self.rx.recv_async().await.ok().map(Ok)
    }
}

/// The client's side of an in-process connection.
pub struct ClientEnd {
    tx: Option<flume::Sender<Frame>>,
    rx: flume::Receiver<Frame>,
}

impl ClientEnd {
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send_async(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next frame from the server; `None` once the server closed its side.
    pub async fn recv(&self) -> Option<Frame> {
        self.rx.recv_async().await.ok()
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .ok()
            .flatten()
    }

    /// Everything the server sends until it closes, or until `timeout`
    /// passes without a frame.
    pub async fn collect(&self, timeout: Duration) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.recv_timeout(timeout).await {
            frames.push(frame);
        }
        frames
    }

    /// Stop sending, like a client half-closing its socket.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
