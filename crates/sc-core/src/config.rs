use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.shellcast/config.toml`.
///
/// Every section and field has a default, so a partial (or missing) file is
/// always valid input. Secrets are never stored here: [`SecurityConfig`]
/// only names the environment variable that holds the shared key.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Config {
    /// Load config from `~/.shellcast/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.shell.validate()?;
        self.sessions.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shellcast")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "human" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be \"human\" or \"json\", got {other:?}"
            ))),
        }
    }

    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Raw frame-stream listener on a Unix socket.
    #[serde(default)]
    pub unix_socket: Option<String>,
    /// Raw frame-stream listener on TCP (same host as the HTTP server).
    #[serde(default)]
    pub tcp_stream_port: Option<u16>,
    /// Directory with the bundled browser client, served as fallback.
    #[serde(default)]
    pub static_dir: Option<String>,
    /// Shut the daemon down once no session has been live for `idle_exit_secs`.
    #[serde(default)]
    pub exit_when_idle: bool,
    #[serde(default = "default_idle_exit_secs")]
    pub idle_exit_secs: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            unix_socket: None,
            tcp_stream_port: None,
            static_dir: None,
            exit_when_idle: false,
            idle_exit_secs: default_idle_exit_secs(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_exit(&self) -> Duration {
        Duration::from_secs(self.idle_exit_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn default_server_host() -> String {
    "127.0.0.1".into()
}
fn default_server_port() -> u16 {
    7681
}
fn default_idle_exit_secs() -> u64 {
    10
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}

/// The command spawned for every new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_shell_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Size used when the client does not negotiate one.
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: default_shell_command(),
            args: Vec::new(),
            env: BTreeMap::new(),
            term: default_term(),
            cwd: None,
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

impl ShellConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Validation("shell.command must not be empty".into()));
        }
        if self.rows == 0 || self.cols == 0 {
            return Err(ConfigError::Validation(
                "shell.rows and shell.cols must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_shell_command() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".into())
}
fn default_term() -> String {
    "xterm-256color".into()
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Close a session after this long without client activity (input,
    /// resize, signal or ping). Shell output does not reset the timer.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    /// Pty output chunks buffered before the reader stops reading.
    #[serde(default = "default_output_queue_depth")]
    pub output_queue_depth: usize,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    /// Ping interval; 0 disables the heartbeat.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_secs: None,
            output_queue_depth: default_output_queue_depth(),
            close_grace_ms: default_close_grace_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl SessionsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::Validation(
                "sessions.max_sessions must be at least 1".into(),
            ));
        }
        if self.output_queue_depth == 0 {
            return Err(ConfigError::Validation(
                "sessions.output_queue_depth must be at least 1".into(),
            ));
        }
        if self.max_frame_bytes < 1024 {
            return Err(ConfigError::Validation(
                "sessions.max_frame_bytes must be at least 1024".into(),
            ));
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(ConfigError::Validation(
                "sessions.idle_timeout_secs must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }
}

fn default_max_sessions() -> usize {
    16
}
fn default_output_queue_depth() -> usize {
    64
}
fn default_close_grace_ms() -> u64 {
    500
}
fn default_kill_timeout_ms() -> u64 {
    2_000
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Env var holding the shared connection key. Unset means no key check.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Allowed `Origin` values for browser connections. Empty allows any.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl SecurityConfig {
    /// Resolve the shared key from the environment at call time.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.server.port, 7681);
        assert_eq!(cfg.sessions.max_sessions, 16);
        assert!(cfg.sessions.idle_timeout().is_none());
    }

    #[test]
    fn heartbeat_zero_disables() {
        let mut cfg = SessionsConfig::default();
        cfg.heartbeat_secs = 0;
        assert!(cfg.heartbeat().is_none());
        cfg.heartbeat_secs = 5;
        assert_eq!(cfg.heartbeat(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn unknown_log_format_rejected() {
        let err = Config::from_toml("[general]\nlog_format = \"xml\"\n").unwrap_err();
        assert!(err.to_string().contains("log_format"));
    }

    #[test]
    fn api_key_resolved_from_named_env_var() {
        std::env::set_var("SHELLCAST_TEST_KEY_CFG", "s3cret");
        let sec = SecurityConfig {
            api_key_env: Some("SHELLCAST_TEST_KEY_CFG".into()),
            allowed_origins: vec![],
        };
        assert_eq!(sec.api_key().as_deref(), Some("s3cret"));
        assert!(SecurityConfig::default().api_key().is_none());
    }
}
