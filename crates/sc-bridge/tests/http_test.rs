//! Operational HTTP routes, driven in memory with `tower::ServiceExt`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use sc_bridge::http_api::{api_router, api_router_with_auth, ApiState};
use sc_protocol::Frame;
use sc_pty::{PtyCommand, TermSize};
use sc_session::{
    ClientEnd, ConnectionInfo, InProcessTransport, SessionHandle, SessionManager,
    SessionRegistry, SessionSettings, TransportKind,
};
use serde_json::Value;
use tower::ServiceExt;

fn state() -> Arc<ApiState> {
    let mut settings = SessionSettings::default().with_command(PtyCommand::new("cat"));
    settings.close_grace = Duration::from_millis(500);
    settings.kill_timeout = Duration::from_millis(500);
    settings.heartbeat = None;
    let manager = SessionManager::new(SessionRegistry::new(4), settings);
    Arc::new(ApiState::new(Arc::new(manager)))
}

async fn open_session(state: &ApiState, peer: &str) -> (SessionHandle, ClientEnd) {
    let (conn, client) =
        InProcessTransport::pair(ConnectionInfo::new(TransportKind::InProcess, peer));
    let handle = state
        .manager()
        .start(conn, Some(TermSize { rows: 30, cols: 100 }))
        .await
        .expect("session starts");
    (handle, client)
}

async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn listing_shows_live_sessions_in_start_order() {
    let state = state();
    let (first, _c1) = open_session(&state, "alice").await;
    let (second, _c2) = open_session(&state, "bob").await;

    let (status, body) = call(api_router(Arc::clone(&state)), "GET", "/api/sessions").await;
    assert_eq!(status, StatusCode::OK);
    let sessions = body.as_array().expect("array");
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["id"], first.id().to_string());
    assert_eq!(sessions[1]["id"], second.id().to_string());
    assert_eq!(sessions[0]["peer"], "alice");
    assert_eq!(sessions[0]["state"], "active");
    assert_eq!(sessions[0]["transport"], "in_process");
    assert_eq!(sessions[0]["rows"], 30);
    assert_eq!(sessions[0]["cols"], 100);
    assert!(sessions[0]["pid"].as_u64().is_some());
    assert_eq!(sessions[0]["bytes_in"], 0);

    let (_, health) = call(api_router(Arc::clone(&state)), "GET", "/health").await;
    assert_eq!(health["sessions"], 2);

    state.registry().close_all("test over");
    tokio::time::timeout(Duration::from_secs(10), state.registry().wait_idle())
        .await
        .unwrap();
}

#[tokio::test]
async fn get_single_session() {
    let state = state();
    let (handle, _client) = open_session(&state, "carol").await;

    let uri = format!("/api/sessions/{}", handle.id());
    let (status, body) = call(api_router(Arc::clone(&state)), "GET", &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["peer"], "carol");
    assert_eq!(body["seq"], handle.seq());

    handle.close("done");
    handle.closed().await;
}

#[tokio::test]
async fn delete_closes_with_operator_reason() {
    let state = state();
    let (handle, client) = open_session(&state, "dave").await;

    let uri = format!("/api/sessions/{}", handle.id());
    let (status, body) = call(api_router(Arc::clone(&state)), "DELETE", &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "closing");

    let frames = client.collect(Duration::from_secs(10)).await;
    assert_eq!(frames.last(), Some(&Frame::close("closed by operator")));
    handle.closed().await;

    let (status, _) = call(api_router(Arc::clone(&state)), "DELETE", &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(api_router(state), "GET", &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_key_required_when_configured() {
    let state = state();
    let app = api_router_with_auth(state, Some("k3y".into()), None);

    let (status, _) = call(app.clone(), "GET", "/api/sessions").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/api/sessions")
        .header("Authorization", "Bearer k3y")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::OK);
}

#[tokio::test]
async fn static_dir_is_the_fallback() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<html>shellcast</html>").unwrap();
    let app = api_router_with_auth(state(), None, Some(dir.path().to_path_buf()));

    let req = Request::builder()
        .uri("/index.html")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"<html>shellcast</html>");

    let (status, _) = call(app, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
}
