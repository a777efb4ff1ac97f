//! Raw byte-stream listener over TCP or a Unix socket.
//!
//! A client opens the stream, sends a handshake and then speaks frames:
//!
//! ```text
//! v1: "SHCAST" | 1 | rows: u16 BE | cols: u16 BE
//! v2: "SHCAST" | 2 | rows: u16 BE | cols: u16 BE | token_len: u16 BE | token
//! ```
//!
//! `rows = cols = 0` asks for the server's default size. The v2 token is the
//! session credential (UTF-8, at most [`MAX_TOKEN_LEN`] bytes); a zero
//! length means none.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sc_protocol::{Frame, FrameCodec, ProtocolError};
use sc_pty::TermSize;
use sc_session::{
    Connection, ConnectionInfo, FrameSink, FrameSource, SessionManager, TransportError,
    TransportKind,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::error::HandshakeError;

pub const HANDSHAKE_MAGIC: &[u8; 6] = b"SHCAST";
/// Handshake without a credential.
pub const PROTOCOL_VERSION_V1: u8 = 1;
/// Handshake followed by a length-prefixed token.
pub const PROTOCOL_VERSION: u8 = 2;
/// Fixed part shared by both versions.
pub const HANDSHAKE_LEN: usize = 11;
pub const MAX_TOKEN_LEN: usize = 1024;

/// Pause after a failed `accept` (e.g. out of descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type Result<T> = std::result::Result<T, TransportError>;

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// What a client asked for in its handshake.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Handshake {
    pub size: Option<TermSize>,
    pub token: Option<String>,
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("size", &self.size)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Fixed header of a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHeader {
    pub version: u8,
    pub size: Option<TermSize>,
}

fn encode_header(version: u8, size: Option<TermSize>) -> [u8; HANDSHAKE_LEN] {
    let (rows, cols) = size.map_or((0, 0), |s| (s.rows, s.cols));
    let mut out = [0u8; HANDSHAKE_LEN];
    out[..6].copy_from_slice(HANDSHAKE_MAGIC);
    out[6] = version;
    out[7..9].copy_from_slice(&rows.to_be_bytes());
    out[9..11].copy_from_slice(&cols.to_be_bytes());
    out
}

/// Client side of a v1 handshake (no credential).
pub fn encode_handshake(size: Option<TermSize>) -> [u8; HANDSHAKE_LEN] {
    encode_header(PROTOCOL_VERSION_V1, size)
}

/// Client side of a v2 handshake carrying `token`.
pub fn encode_handshake_with_token(
    size: Option<TermSize>,
    token: &str,
) -> std::result::Result<Vec<u8>, HandshakeError> {
    if token.len() > MAX_TOKEN_LEN {
        return Err(HandshakeError::TokenTooLong(token.len()));
    }
    let mut out = Vec::with_capacity(HANDSHAKE_LEN + 2 + token.len());
    out.extend_from_slice(&encode_header(PROTOCOL_VERSION, size));
    out.extend_from_slice(&(token.len() as u16).to_be_bytes());
    out.extend_from_slice(token.as_bytes());
    Ok(out)
}

pub fn parse_handshake(
    buf: &[u8; HANDSHAKE_LEN],
) -> std::result::Result<HandshakeHeader, HandshakeError> {
    if buf[..6] != HANDSHAKE_MAGIC[..] {
        return Err(HandshakeError::BadMagic);
    }
    let version = buf[6];
    if version != PROTOCOL_VERSION_V1 && version != PROTOCOL_VERSION {
        return Err(HandshakeError::UnsupportedVersion(version));
    }
    let rows = u16::from_be_bytes([buf[7], buf[8]]);
    let cols = u16::from_be_bytes([buf[9], buf[10]]);
    let size = match (rows, cols) {
        (0, 0) => None,
        _ => Some(
            TermSize::new(rows, cols).map_err(|_| HandshakeError::InvalidSize { rows, cols })?,
        ),
    };
    Ok(HandshakeHeader { version, size })
}

/// Read and check the handshake, giving up after `timeout`.
pub async fn read_handshake<S>(
    stream: &mut S,
    timeout: Duration,
) -> std::result::Result<Handshake, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, read_handshake_inner(stream))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn read_handshake_inner<S>(stream: &mut S) -> std::result::Result<Handshake, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let header = parse_handshake(&buf)?;
    if header.version == PROTOCOL_VERSION_V1 {
        return Ok(Handshake {
            size: header.size,
            token: None,
        });
    }

    let len = usize::from(stream.read_u16().await?);
    if len > MAX_TOKEN_LEN {
        return Err(HandshakeError::TokenTooLong(len));
    }
    let mut raw = vec![0u8; len];
    stream.read_exact(&mut raw).await?;
    let token = String::from_utf8(raw).map_err(|_| HandshakeError::BadToken)?;
    Ok(Handshake {
        size: header.size,
        token: (!token.is_empty()).then_some(token),
    })
}

// ---------------------------------------------------------------------------
// Framed transport
// ---------------------------------------------------------------------------

/// Any accepted stream.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

pub type BoxedStream = Box<dyn Io>;

/// Wrap a handshaken stream as a session [`Connection`].
pub fn framed_connection<S: Io>(stream: S, info: ConnectionInfo, max_frame_bytes: usize) -> Connection {
    let (sink, source) = Framed::new(stream, FrameCodec::new(max_frame_bytes)).split();
    Connection::new(
        StreamSink {
            inner: sink,
            closed: false,
        },
        StreamSource { inner: source },
        info,
    )
}

/// A peer that hung up is a closed transport, not an I/O failure.
fn stream_error(err: ProtocolError) -> TransportError {
    match err {
        ProtocolError::Io(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            TransportError::Closed
        }
        other => other.into(),
    }
}

struct StreamSink<S> {
    inner: SplitSink<Framed<S, FrameCodec>, Frame>,
    closed: bool,
}

#[async_trait]
impl<S: Io> FrameSink for StreamSink<S> {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.inner.send(frame).await.map_err(stream_error)
    }

    async fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.inner.close().await.map_err(stream_error)
    }
}

struct StreamSource<S> {
    inner: SplitStream<Framed<S, FrameCodec>>,
}

#[async_trait]
impl<S: Io> FrameSource for StreamSource<S> {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        self.inner
            .next()
            .await
            .map(|item| item.map_err(stream_error))
    }
}

// ---------------------------------------------------------------------------
// StreamListener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamAddr {
    Tcp(String),
    Unix(PathBuf),
}

impl fmt::Display for StreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, SocketFile),
}

/// Removes the socket file when the listener goes away.
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            debug!(path = %self.0.display(), error = %e, "could not remove socket file");
        }
    }
}

pub struct StreamListener {
    listener: Listener,
    addr: StreamAddr,
    handshake_timeout: Duration,
}

impl StreamListener {
    pub async fn bind(addr: &StreamAddr, handshake_timeout: Duration) -> std::io::Result<Self> {
        let (listener, addr) = match addr {
            StreamAddr::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                let bound = StreamAddr::Tcp(listener.local_addr()?.to_string());
                (Listener::Tcp(listener), bound)
            }
            StreamAddr::Unix(path) => {
                remove_stale_socket(path)?;
                let listener = UnixListener::bind(path)?;
                (
                    Listener::Unix(listener, SocketFile(path.clone())),
                    addr.clone(),
                )
            }
        };
        info!(%addr, "stream listener bound");
        Ok(Self {
            listener,
            addr,
            handshake_timeout,
        })
    }

    /// Bound address; for TCP this carries the actual port.
    pub fn local_addr(&self) -> &StreamAddr {
        &self.addr
    }

    /// Next raw connection, before any handshake.
    pub async fn accept(&self) -> std::io::Result<(BoxedStream, ConnectionInfo)> {
        match &self.listener {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "could not set TCP_NODELAY");
                }
                let info = ConnectionInfo::new(TransportKind::Tcp, peer.to_string());
                Ok((Box::new(stream), info))
            }
            Listener::Unix(listener, SocketFile(path)) => {
                let (stream, _) = listener.accept().await?;
                let info = ConnectionInfo::new(
                    TransportKind::Unix,
                    format!("unix:{}", path.display()),
                );
                Ok((Box::new(stream), info))
            }
        }
    }

    /// Accept until `shutdown` fires. Each connection is handshaken and
    /// started on its own task, so a slow client never holds up the loop.
    pub async fn serve(self, manager: Arc<SessionManager>, shutdown: CancellationToken) {
        info!(addr = %self.addr, "stream listener accepting");
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.accept() => res,
            };
            match accepted {
                Ok((stream, info)) => {
                    let span = sc_telemetry::tracing_setup::connection_span(
                        &info.transport.to_string(),
                        &info.peer,
                    );
                    tokio::spawn(
                        handle_connection(stream, info, Arc::clone(&manager), self.handshake_timeout)
                            .instrument(span),
                    );
                }
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        info!(addr = %self.addr, "stream listener stopped");
    }
}

impl fmt::Debug for StreamListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamListener")
            .field("addr", &self.addr)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

async fn handle_connection(
    mut stream: BoxedStream,
    info: ConnectionInfo,
    manager: Arc<SessionManager>,
    handshake_timeout: Duration,
) {
    let Handshake { size, token } = match read_handshake(&mut stream, handshake_timeout).await {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!(error = %e, "handshake failed, dropping connection");
            return;
        }
    };
    debug!(?size, with_token = token.is_some(), "handshake complete");
    let info = match token {
        Some(token) => info.with_token(token),
        None => info,
    };
    let connection = framed_connection(stream, info, manager.settings().max_frame_bytes);
    if let Err(e) = manager.start(connection, size).await {
        info!(error = %e, "stream session not started");
    }
}

/// Clear a socket file left behind by a previous run. A socket that still
/// accepts connections belongs to a live server and is left alone.
fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("{} is in use by another server", path.display()),
        ));
    }
    info!(path = %path.display(), "removing stale socket file");
    std::fs::remove_file(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn handshake_header_fields() {
        let size = TermSize { rows: 40, cols: 120 };
        let header = parse_handshake(&encode_handshake(Some(size))).unwrap();
        assert_eq!(header.version, PROTOCOL_VERSION_V1);
        assert_eq!(header.size, Some(size));
        assert_eq!(parse_handshake(&encode_handshake(None)).unwrap().size, None);
    }

    #[tokio::test]
    async fn token_rides_in_a_v2_handshake() {
        let size = TermSize { rows: 30, cols: 100 };
        let bytes = encode_handshake_with_token(Some(size), "s3cret").unwrap();
        assert_eq!(bytes.len(), HANDSHAKE_LEN + 2 + 6);
        assert_eq!(bytes[6], PROTOCOL_VERSION);

        let handshake = read_handshake(&mut &bytes[..], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(handshake.size, Some(size));
        assert_eq!(handshake.token.as_deref(), Some("s3cret"));
        assert!(!format!("{handshake:?}").contains("s3cret"));

        let empty = encode_handshake_with_token(None, "").unwrap();
        let handshake = read_handshake(&mut &empty[..], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(handshake, Handshake::default());

        let v1 = encode_handshake(None);
        let handshake = read_handshake(&mut &v1[..], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(handshake.token, None);
    }

    #[tokio::test]
    async fn bad_tokens_are_refused() {
        let long = "k".repeat(MAX_TOKEN_LEN + 1);
        assert!(matches!(
            encode_handshake_with_token(None, &long),
            Err(HandshakeError::TokenTooLong(n)) if n == MAX_TOKEN_LEN + 1
        ));

        let mut oversized = encode_header(PROTOCOL_VERSION, None).to_vec();
        oversized.extend_from_slice(&u16::MAX.to_be_bytes());
        let err = read_handshake(&mut &oversized[..], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::TokenTooLong(_)), "{err:?}");

        let mut not_utf8 = encode_header(PROTOCOL_VERSION, None).to_vec();
        not_utf8.extend_from_slice(&2u16.to_be_bytes());
        not_utf8.extend_from_slice(&[0xff, 0xfe]);
        let err = read_handshake(&mut &not_utf8[..], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::BadToken), "{err:?}");
    }

    #[test]
    fn handshake_rejections() {
        let mut bad = encode_handshake(None);
        bad[0] = b'X';
        assert!(matches!(parse_handshake(&bad), Err(HandshakeError::BadMagic)));

        let mut version = encode_handshake(None);
        version[6] = 3;
        assert!(matches!(
            parse_handshake(&version),
            Err(HandshakeError::UnsupportedVersion(3))
        ));

        let mut half = encode_handshake(None);
        half[7..9].copy_from_slice(&24u16.to_be_bytes());
        assert!(matches!(
            parse_handshake(&half),
            Err(HandshakeError::InvalidSize { rows: 24, cols: 0 })
        ));
    }

    #[tokio::test]
    async fn handshake_times_out() {
        let (mut server, mut client) = tokio::io::duplex(64);
        client.write_all(&HANDSHAKE_MAGIC[..]).await.unwrap();
        let err = read_handshake(&mut server, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout));
    }

    #[tokio::test]
    async fn handshake_then_frames_over_one_stream() {
        let (mut server, client) = tokio::io::duplex(1024);
        let mut client = Framed::new(client, FrameCodec::default());

        client
            .get_mut()
            .write_all(&encode_handshake(Some(TermSize { rows: 10, cols: 20 })))
            .await
            .unwrap();
        client.send(Frame::input(&b"ls\n"[..])).await.unwrap();

        let handshake = read_handshake(&mut server, Duration::from_secs(1)).await.unwrap();
        assert_eq!(handshake.size, Some(TermSize { rows: 10, cols: 20 }));

        let info = ConnectionInfo::new(TransportKind::InProcess, "duplex");
        let mut conn = framed_connection(server, info, 1024);
        assert_eq!(
            conn.source.recv().await.unwrap().unwrap(),
            Frame::input(&b"ls\n"[..])
        );

        conn.sink.send(Frame::close("bye")).await.unwrap();
        conn.sink.close().await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Frame::close("bye"));
        assert!(conn.sink.send(Frame::close("again")).await.is_err());
    }

    #[test]
    fn stale_socket_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        remove_stale_socket(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn live_socket_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let _live = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let err = remove_stale_socket(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
        assert!(path.exists());
    }
}
