//! Logging and trace-correlation helpers for shellcast services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   filtered by `RUST_LOG` with a configurable fallback level.
//! - **Tracing**: trace/span id generation and per-session spans so every
//!   line a session logs carries its id.

pub mod logging;
pub mod tracing_setup;
