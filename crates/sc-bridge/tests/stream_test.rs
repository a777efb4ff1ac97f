//! Raw stream listener over real TCP and Unix sockets.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sc_bridge::stream::{
    encode_handshake, encode_handshake_with_token, StreamAddr, StreamListener,
};
use sc_protocol::{Control, Frame, FrameCodec};
use sc_pty::{PtyCommand, TermSize};
use sc_session::{SessionManager, SessionRegistry, SessionSettings, SharedSecret};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

fn manager(command: PtyCommand, max_sessions: usize) -> Arc<SessionManager> {
    let mut settings = SessionSettings::default().with_command(command);
    settings.close_grace = Duration::from_millis(500);
    settings.kill_timeout = Duration::from_millis(500);
    settings.heartbeat = None;
    Arc::new(SessionManager::new(SessionRegistry::new(max_sessions), settings))
}

fn sh(script: &str) -> PtyCommand {
    PtyCommand::new("/bin/sh").arg("-c").arg(script)
}

/// Bind on an ephemeral TCP port and serve; returns the bound address.
async fn serve_tcp(manager: Arc<SessionManager>, shutdown: CancellationToken) -> String {
    let listener = StreamListener::bind(
        &StreamAddr::Tcp("127.0.0.1:0".into()),
        Duration::from_millis(300),
    )
    .await
    .expect("bind");
    let StreamAddr::Tcp(addr) = listener.local_addr().clone() else {
        panic!("tcp listener reports a tcp address");
    };
    tokio::spawn(listener.serve(manager, shutdown));
    addr
}

async fn handshake<S>(mut stream: S, size: Option<TermSize>) -> Framed<S, FrameCodec>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_handshake(size)).await.unwrap();
    Framed::new(stream, FrameCodec::default())
}

async fn read_frames<S>(framed: &mut Framed<S, FrameCodec>) -> Vec<Frame>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(WAIT, async {
        let mut frames = Vec::new();
        while let Some(Ok(frame)) = framed.next().await {
            frames.push(frame);
        }
        frames
    })
    .await
    .expect("server closed the stream in time")
}

fn output_text(frames: &[Frame]) -> String {
    let mut out = Vec::new();
    for frame in frames {
        if let Frame::Output(data) = frame {
            out.extend_from_slice(data);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[tokio::test]
async fn tcp_session_end_to_end() {
    let manager = manager(sh("stty size; echo hello"), 4);
    let addr = serve_tcp(Arc::clone(&manager), CancellationToken::new()).await;

    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut framed = handshake(stream, Some(TermSize { rows: 40, cols: 120 })).await;
    let frames = read_frames(&mut framed).await;

    let text = output_text(&frames);
    assert!(text.contains("40 120"), "{text:?}");
    assert!(text.contains("hello\r\n"), "{text:?}");
    let n = frames.len();
    assert_eq!(frames[n - 2], Frame::exit(0, None));
    assert_eq!(frames[n - 1], Frame::close("shell exited"));

    tokio::time::timeout(WAIT, manager.registry().wait_idle())
        .await
        .unwrap();
}

#[tokio::test]
async fn tcp_input_is_echoed_by_cat() {
    let manager = manager(PtyCommand::new("cat"), 4);
    let addr = serve_tcp(Arc::clone(&manager), CancellationToken::new()).await;

    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut framed = handshake(stream, None).await;
    framed.send(Frame::input(&b"over tcp\n"[..])).await.unwrap();

    let mut seen = String::new();
    while !seen.contains("over tcp") {
        match tokio::time::timeout(WAIT, framed.next()).await {
            Ok(Some(Ok(Frame::Output(data)))) => seen.push_str(&String::from_utf8_lossy(&data)),
            Ok(Some(Ok(_))) => {}
            other => panic!("stream ended early: {other:?}"),
        }
    }
    assert_eq!(manager.registry().list()[0].rows, 24);

    framed.send(Frame::close("bye")).await.unwrap();
    let frames = read_frames(&mut framed).await;
    assert!(matches!(
        frames.last(),
        Some(Frame::Control(Control::Close { reason })) if reason == "client closed"
    ));
}

#[tokio::test]
async fn bad_handshake_is_dropped() {
    let manager = manager(PtyCommand::new("cat"), 4);
    let addr = serve_tcp(Arc::clone(&manager), CancellationToken::new()).await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "server closes without replying");
    assert!(manager.registry().is_empty());
    assert_eq!(manager.registry().reserved(), 0);
}

#[tokio::test]
async fn silent_client_times_out() {
    let manager = manager(PtyCommand::new("cat"), 4);
    let addr = serve_tcp(Arc::clone(&manager), CancellationToken::new()).await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("dropped after the handshake timeout")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn capacity_refusal_over_tcp() {
    let manager = manager(PtyCommand::new("cat"), 1);
    let addr = serve_tcp(Arc::clone(&manager), CancellationToken::new()).await;

    let first = handshake(TcpStream::connect(&addr).await.unwrap(), None).await;
    let mut rx = manager.registry().subscribe();
    tokio::time::timeout(WAIT, rx.wait_for(|n| *n == 1))
        .await
        .unwrap()
        .unwrap();

    let mut second = handshake(TcpStream::connect(&addr).await.unwrap(), None).await;
    assert_eq!(
        read_frames(&mut second).await,
        vec![Frame::close("server at capacity")]
    );
    assert_eq!(manager.registry().len(), 1);
    drop(first);
}

#[tokio::test]
async fn shared_secret_is_checked_on_raw_streams() {
    let mut settings = SessionSettings::default().with_command(PtyCommand::new("cat"));
    settings.close_grace = Duration::from_millis(500);
    settings.kill_timeout = Duration::from_millis(500);
    settings.heartbeat = None;
    let manager = Arc::new(
        SessionManager::new(SessionRegistry::new(4), settings)
            .with_authorizer(SharedSecret::new("k")),
    );
    let addr = serve_tcp(Arc::clone(&manager), CancellationToken::new()).await;

    // No credential at all.
    let mut anonymous = handshake(TcpStream::connect(&addr).await.unwrap(), None).await;
    assert_eq!(
        read_frames(&mut anonymous).await,
        vec![Frame::close("unauthorized")]
    );

    // Wrong credential.
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let bytes = encode_handshake_with_token(None, "wrong").unwrap();
    stream.write_all(&bytes).await.unwrap();
    let mut wrong = Framed::new(stream, FrameCodec::default());
    assert_eq!(read_frames(&mut wrong).await, vec![Frame::close("unauthorized")]);
    assert!(manager.registry().is_empty());

    // Right credential gets a working shell.
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let bytes = encode_handshake_with_token(Some(TermSize { rows: 30, cols: 90 }), "k").unwrap();
    stream.write_all(&bytes).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::default());
    framed.send(Frame::input(&b"with a key\n"[..])).await.unwrap();

    let mut seen = String::new();
    while !seen.contains("with a key") {
        match tokio::time::timeout(WAIT, framed.next()).await {
            Ok(Some(Ok(Frame::Output(data)))) => seen.push_str(&String::from_utf8_lossy(&data)),
            Ok(Some(Ok(other))) => panic!("unexpected frame: {other:?}"),
            other => panic!("stream ended early: {other:?}"),
        }
    }
    assert_eq!(manager.registry().len(), 1);
    assert_eq!(manager.registry().list()[0].rows, 30);

    framed.send(Frame::close("bye")).await.unwrap();
    let frames = read_frames(&mut framed).await;
    assert_eq!(frames.last(), Some(&Frame::close("client closed")));
}

#[tokio::test]
async fn unix_socket_session_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shellcast.sock");
    // Leftover from a previous run.
    drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

    let manager = manager(sh("echo unix"), 4);
    let shutdown = CancellationToken::new();
    let listener = StreamListener::bind(&StreamAddr::Unix(path.clone()), Duration::from_secs(1))
        .await
        .expect("stale socket replaced");
    let server = tokio::spawn(listener.serve(Arc::clone(&manager), shutdown.clone()));

    let stream = UnixStream::connect(&path).await.unwrap();
    let mut framed = handshake(stream, None).await;
    let frames = read_frames(&mut framed).await;
    assert!(output_text(&frames).contains("unix\r\n"));

    shutdown.cancel();
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert!(!path.exists(), "socket file removed when the listener stops");
}
