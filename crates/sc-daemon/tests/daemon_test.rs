//! Whole-process behaviour: bind, serve, idle exit and graceful shutdown.

use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use sc_bridge::stream::encode_handshake;
use sc_bridge::StreamAddr;
use sc_core::config::Config;
use sc_daemon::{Daemon, ShutdownCause};
use sc_protocol::{encode, Control, Frame, FrameCodec, FrameDecoder};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(10);

fn config(command: &str) -> Config {
    let mut config = Config::default();
    config.server.port = 0;
    config.shell.command = command.into();
    config.sessions.heartbeat_secs = 0;
    config.sessions.close_grace_ms = 300;
    config.sessions.kill_timeout_ms = 300;
    config
}

async fn ws_frames(url: &str) -> Vec<Frame> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
    let mut decoder = FrameDecoder::default();
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    tokio::time::timeout(WAIT, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    buf.extend_from_slice(&data);
                    while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                        frames.push(frame);
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await
    .expect("server closed the socket in time");
    frames
}

fn last_close(frames: &[Frame]) -> Option<&str> {
    match frames.last() {
        Some(Frame::Control(Control::Close { reason })) => Some(reason),
        _ => None,
    }
}

#[tokio::test]
async fn serves_a_session_over_websocket() {
    let mut config = config("/bin/sh");
    config.shell.args = vec!["-c".into(), "echo from-daemon".into()];
    let daemon = Daemon::bind(config).await.expect("bind");
    let url = format!("ws://{}/ws", daemon.http_addr());
    let shutdown = daemon.shutdown_handle();
    let run = tokio::spawn(daemon.run());

    let frames = ws_frames(&url).await;
    let text: Vec<u8> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Output(data) => Some(data.to_vec()),
            _ => None,
        })
        .flatten()
        .collect();
    assert!(String::from_utf8_lossy(&text).contains("from-daemon"));
    assert_eq!(last_close(&frames), Some("shell exited"));

    shutdown.trigger(ShutdownCause::Requested);
    tokio::time::timeout(WAIT, run)
        .await
        .expect("daemon stops")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn shutdown_closes_live_sessions() {
    let daemon = Daemon::bind(config("cat")).await.expect("bind");
    let url = format!("ws://{}/ws", daemon.http_addr());
    let registry = daemon.registry().clone();
    let shutdown = daemon.shutdown_handle();
    let run = tokio::spawn(daemon.run());

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.expect("connect");
    let mut live = registry.subscribe();
    tokio::time::timeout(WAIT, live.wait_for(|n| *n == 1))
        .await
        .unwrap()
        .unwrap();
    ws.send(Message::Binary(encode(&Frame::input(&b"hi\n"[..])).unwrap()))
        .await
        .unwrap();

    shutdown.trigger(ShutdownCause::Signal("SIGTERM"));

    let mut decoder = FrameDecoder::default();
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    tokio::time::timeout(WAIT, async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                buf.extend_from_slice(&data);
                while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                    frames.push(frame);
                }
            }
        }
    })
    .await
    .expect("socket closed");
    assert_eq!(last_close(&frames), Some("server shutting down"));

    tokio::time::timeout(WAIT, run)
        .await
        .expect("daemon stops")
        .unwrap()
        .unwrap();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn exits_when_idle() {
    let mut config = config("cat");
    config.server.exit_when_idle = true;
    config.server.idle_exit_secs = 1;
    let daemon = Daemon::bind(config).await.expect("bind");
    let shutdown = daemon.shutdown_handle();

    tokio::time::timeout(WAIT, daemon.run())
        .await
        .expect("idle exit fired")
        .unwrap();
    assert_eq!(shutdown.cause(), Some(ShutdownCause::Idle));
}

#[tokio::test]
async fn tcp_stream_listener_from_config() {
    let mut config = config("/bin/sh");
    config.shell.args = vec!["-c".into(), "echo raw".into()];
    config.server.tcp_stream_port = Some(0);
    let daemon = Daemon::bind(config).await.expect("bind");
    let addrs = daemon.stream_addrs();
    let Some(StreamAddr::Tcp(addr)) = addrs.first().cloned() else {
        panic!("tcp stream listener bound: {addrs:?}");
    };
    let shutdown = daemon.shutdown_handle();
    let run = tokio::spawn(daemon.run());

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream.write_all(&encode_handshake(None)).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::default());
    let frames = tokio::time::timeout(WAIT, async {
        let mut frames = Vec::new();
        while let Some(Ok(frame)) = framed.next().await {
            frames.push(frame);
        }
        frames
    })
    .await
    .expect("stream closed");
    assert_eq!(last_close(&frames), Some("shell exited"));

    shutdown.trigger(ShutdownCause::Requested);
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn port_conflict_fails_bind() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = config("cat");
    config.server.port = taken.local_addr().unwrap().port();

    let err = Daemon::bind(config).await.expect_err("port in use");
    assert!(err.to_string().contains("failed to bind http listener"), "{err:#}");
}

#[tokio::test]
async fn health_reports_capacity() {
    let mut config = config("cat");
    config.sessions.max_sessions = 3;
    let daemon = Daemon::bind(config).await.expect("bind");
    let url = format!("http://{}/health", daemon.http_addr());
    let shutdown = daemon.shutdown_handle();
    let run = tokio::spawn(daemon.run());

    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["capacity"], 3);
    assert_eq!(body["sessions"], 0);

    shutdown.trigger(ShutdownCause::Requested);
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
}
