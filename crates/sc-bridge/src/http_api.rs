//! HTTP surface: health, session listing and operator close, the WebSocket
//! endpoint and an optional static client directory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use sc_session::{SessionManager, SessionRegistry, SessionSummary};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthLayer;
use crate::error::ApiError;
use crate::ws;

/// Reason sent to a client whose session is closed through the API.
pub const OPERATOR_CLOSE_REASON: &str = "closed by operator";

// ---------------------------------------------------------------------------
// ApiState
// ---------------------------------------------------------------------------

/// Shared state for all HTTP/WS handlers.
pub struct ApiState {
    manager: Arc<SessionManager>,
    started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            started_at: Utc::now(),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.manager.registry()
    }
}

impl std::fmt::Debug for ApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiState")
            .field("registry", self.registry())
            .field("started_at", &self.started_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Router with no API key and no static directory.
pub fn api_router(state: Arc<ApiState>) -> Router {
    api_router_with_auth(state, None, None)
}

/// Build the full router.
///
/// `api_key` guards `/api/*` only; `/health` stays open and `/ws` is
/// authorized per session. When `static_dir` is set, unmatched paths are
/// served from it.
pub fn api_router_with_auth(
    state: Arc<ApiState>,
    api_key: Option<String>,
    static_dir: Option<PathBuf>,
) -> Router {
    let api = Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session).delete(close_session))
        .layer(AuthLayer::new(api_key));

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .merge(api);
    if let Some(dir) = static_dir {
        info!(dir = %dir.display(), "serving static client files");
        router = router.fallback_service(ServeDir::new(dir));
    }
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve `router` on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http listener accepting");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    info!(%addr, "http listener stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /health
async fn health(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let registry = state.registry();
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": registry.len(),
        "capacity": registry.capacity(),
        "uptime_secs": uptime,
    }))
}

/// GET /api/sessions
async fn list_sessions(State(state): State<Arc<ApiState>>) -> Json<Vec<SessionSummary>> {
    Json(state.registry().list())
}

/// GET /api/sessions/{id}
async fn get_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let id = parse_id(&id)?;
    state
        .registry()
        .get(id)
        .map(|handle| Json(handle.summary()))
        .ok_or_else(|| ApiError::NotFound("session not found".into()))
}

/// DELETE /api/sessions/{id}
async fn close_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    if state.registry().close(id, OPERATOR_CLOSE_REASON) {
        Ok(Json(json!({ "status": "closing", "id": id })))
    } else {
        Err(ApiError::NotFound("session not found".into()))
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest("invalid session id".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
