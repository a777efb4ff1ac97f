use uuid::Uuid;

/// Generate an OpenTelemetry-compatible trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    // A UUID without hyphens is exactly 32 hex chars (128 bits).
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a span ID (16 hex characters).
pub fn generate_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// Span wrapping everything a single session logs.
///
/// Pump tasks and the supervisor are instrumented with this span, so their
/// events carry `session_id` and `peer` without repeating them.
pub fn session_span(session_id: &Uuid, peer: &str) -> tracing::Span {
    tracing::info_span!(
        "session",
        session_id = %session_id,
        peer = %peer,
        trace_id = %generate_trace_id(),
    )
}

/// Span for one accepted connection before it becomes a session.
pub fn connection_span(transport: &str, peer: &str) -> tracing::Span {
    tracing::info_span!(
        "connection",
        transport = %transport,
        peer = %peer,
        span_id = %generate_span_id(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_format() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_span_id_format() {
        let id = generate_span_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_session_span_creation() {
        let span = session_span(&Uuid::new_v4(), "127.0.0.1:5000");
        let _guard = span.enter();
        tracing::info!("inside session span");
    }

    #[test]
    fn test_connection_span_creation() {
        let span = connection_span("websocket", "local");
        let _guard = span.enter();
    }
}
