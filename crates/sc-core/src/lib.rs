//! Shared configuration for shellcast services.
//!
//! The daemon, the session layer and the transport listeners all read their
//! tunables from [`config::Config`], which is loaded from
//! `~/.shellcast/config.toml` (or an explicit path) and validated once at
//! startup.

pub mod config;
