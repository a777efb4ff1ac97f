//! WebSocket endpoint: `GET /ws?rows=&cols=&token=`.
//!
//! Frames travel as binary messages in the same encoding as the raw stream
//! listener. A frame may be split across messages or several frames packed
//! into one; the decoder buffers across message boundaries.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        connect_info::ConnectInfo,
        rejection::QueryRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, Extensions, HeaderMap},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sc_protocol::{Frame, FrameDecoder, ProtocolError};
use sc_pty::TermSize;
use sc_session::{
    Connection, ConnectionInfo, FrameSink, FrameSource, TransportError, TransportKind,
};
use serde::Deserialize;
use tracing::{debug, info, warn, Instrument};

use crate::auth::presented_token;
use crate::error::HandshakeError;
use crate::http_api::ApiState;

type Result<T> = std::result::Result<T, TransportError>;

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    /// Browsers cannot set headers on a WebSocket request, so the shared
    /// secret may also ride in the query.
    pub token: Option<String>,
}

impl WsQuery {
    /// Requested initial size; `None` means the server default.
    pub fn size(&self) -> std::result::Result<Option<TermSize>, HandshakeError> {
        match (self.rows, self.cols) {
            (None, None) => Ok(None),
            (Some(rows), Some(cols)) => TermSize::new(rows, cols)
                .map(Some)
                .map_err(|_| HandshakeError::InvalidSize { rows, cols }),
            _ => Err(HandshakeError::BadQuery(
                "rows and cols must be given together".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Upgrade to a WebSocket and hand the socket to the session manager.
///
/// Refusals that happen before the upgrade (not a WebSocket request, bad
/// query) are answered with a 4xx and never reach the manager. Everything
/// after the upgrade runs on the connection's own task.
pub async fn ws_handler(
    State(state): State<Arc<ApiState>>,
    extensions: Extensions,
    headers: HeaderMap,
    query: std::result::Result<Query<WsQuery>, QueryRejection>,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let span = sc_telemetry::tracing_setup::connection_span("websocket", &peer);

    let prepared = upgrade
        .map_err(|e| HandshakeError::Upgrade(e.body_text()))
        .and_then(|ws| {
            let Query(query) = query.map_err(|e| HandshakeError::BadQuery(e.body_text()))?;
            let size = query.size()?;
            Ok((ws, query, size))
        });
    let (ws, query, size) = match prepared {
        Ok(parts) => parts,
        Err(e) => {
            span.in_scope(|| warn!(error = %e, "websocket handshake refused"));
            return e.into_response();
        }
    };

    let info = connection_info(peer, &headers, query.token);
    let manager = Arc::clone(state.manager());
    let max_frame_bytes = manager.settings().max_frame_bytes;
    span.in_scope(|| debug!(?size, "upgrading websocket"));

    ws.on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| {
            async move {
                let connection = WsTransport::connection(socket, info, max_frame_bytes);
                if let Err(e) = manager.start(connection, size).await {
                    info!(error = %e, "websocket session not started");
                }
            }
            .instrument(span)
        })
}

fn connection_info(peer: String, headers: &HeaderMap, token: Option<String>) -> ConnectionInfo {
    let mut info = ConnectionInfo::new(TransportKind::WebSocket, peer);
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        info = info.with_origin(origin);
    }
    if let Some(token) = token.or_else(|| presented_token(headers).map(String::from)) {
        info = info.with_token(token);
    }
    info.user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    info
}

// ---------------------------------------------------------------------------
// WsTransport
// ---------------------------------------------------------------------------

/// Frame sink and source over an upgraded axum WebSocket.
pub struct WsTransport;

impl WsTransport {
    pub fn connection(socket: WebSocket, info: ConnectionInfo, max_frame_bytes: usize) -> Connection {
        let (sink, stream) = socket.split();
        Connection::new(
            WsSink {
                inner: sink,
                closed: false,
            },
            WsSource {
                inner: stream,
                decoder: FrameDecoder::new(max_frame_bytes),
                buf: BytesMut::new(),
            },
            info,
        )
    }
}

struct WsSink {
    inner: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let data = sc_protocol::encode(&frame)?;
        self.inner.send(Message::Binary(data)).await.map_err(|e| {
            debug!(error = %e, "websocket send failed");
            TransportError::Closed
        })
    }

    async fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        // Sends the close message and flushes.
        self.inner.close().await.map_err(|e| {
            debug!(error = %e, "websocket close failed");
            TransportError::Closed
        })
    }
}

struct WsSource {
    inner: SplitStream<WebSocket>,
    decoder: FrameDecoder,
    buf: BytesMut,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            match self.decoder.decode(&mut self.buf) {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => {}
                Err(e) => return Some(Err(e.into())),
            }
            match self.inner.next().await? {
                Ok(Message::Binary(data)) => self.buf.extend_from_slice(&data),
                Ok(Message::Text(_)) => return Some(Err(ProtocolError::NotBinary("text").into())),
                Ok(Message::Close(_)) => {
                    if !self.buf.is_empty() {
                        debug!(pending = self.buf.len(), "peer closed mid-frame");
                    }
                    return None;
                }
                // Pings are answered by the socket itself.
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Err(e) => {
                    debug!(error = %e, "websocket read failed");
                    return Some(Err(TransportError::Closed));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_defaults_when_absent() {
        assert_eq!(WsQuery::default().size().unwrap(), None);
    }

    #[test]
    fn size_from_query() {
        let query = WsQuery {
            rows: Some(40),
            cols: Some(120),
            token: None,
        };
        assert_eq!(query.size().unwrap(), Some(TermSize { rows: 40, cols: 120 }));
    }

    #[test]
    fn zero_or_partial_size_is_refused() {
        let zero = WsQuery {
            rows: Some(0),
            cols: Some(80),
            token: None,
        };
        assert!(matches!(
            zero.size(),
            Err(HandshakeError::InvalidSize { rows: 0, cols: 80 })
        ));

        let half = WsQuery {
            rows: Some(24),
            cols: None,
            token: None,
        };
        assert!(matches!(half.size(), Err(HandshakeError::BadQuery(_))));
    }

    #[test]
    fn connection_info_collects_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, "http://localhost:3000".parse().unwrap());
        headers.insert(header::USER_AGENT, "xterm.js".parse().unwrap());
        headers.insert("x-api-key", "from-header".parse().unwrap());

        let info = connection_info("10.0.0.2:5555".into(), &headers, None);
        assert_eq!(info.transport, TransportKind::WebSocket);
        assert_eq!(info.origin.as_deref(), Some("http://localhost:3000"));
        assert_eq!(info.user_agent.as_deref(), Some("xterm.js"));
        assert_eq!(info.token.as_deref(), Some("from-header"));

        let info = connection_info("p".into(), &headers, Some("from-query".into()));
        assert_eq!(info.token.as_deref(), Some("from-query"));
    }
}
