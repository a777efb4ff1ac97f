//! Errors raised before a session exists.
//!
//! [`HandshakeError`] covers connection negotiation on both listeners; the
//! WebSocket endpoint turns it into a 4xx response. [`ApiError`] is the
//! JSON error body of the operational HTTP routes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// ---------------------------------------------------------------------------
// HandshakeError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The request could not be upgraded to a WebSocket.
    #[error("websocket upgrade refused: {0}")]
    Upgrade(String),

    #[error("bad handshake query: {0}")]
    BadQuery(String),

    #[error("invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },

    #[error("bad handshake magic")]
    BadMagic,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("handshake token too long ({0} bytes)")]
    TokenTooLong(usize),

    #[error("handshake token is not UTF-8")]
    BadToken,

    #[error("handshake timed out")]
    Timeout,

    #[error("handshake I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Upgrade(_) => StatusCode::UPGRADE_REQUIRED,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::BadQuery(_)
            | Self::InvalidSize { .. }
            | Self::BadMagic
            | Self::UnsupportedVersion(_)
            | Self::TokenTooLong(_)
            | Self::BadToken
            | Self::Io(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
