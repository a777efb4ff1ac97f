//! Listeners that turn client connections into shellcast sessions.
//!
//! - [`ws`]: the `GET /ws` WebSocket upgrade endpoint.
//! - [`stream`]: raw TCP / Unix socket listener with a fixed handshake.
//! - [`http_api`]: the axum router (health, session listing, operator
//!   close, static client files) and its server loop.
//! - [`auth`]: API key layer for `/api/*`.

pub mod auth;
pub mod error;
pub mod http_api;
pub mod stream;
pub mod ws;

pub use error::{ApiError, HandshakeError};
pub use http_api::{api_router, api_router_with_auth, serve, ApiState};
pub use stream::{StreamAddr, StreamListener};
pub use ws::WsTransport;
