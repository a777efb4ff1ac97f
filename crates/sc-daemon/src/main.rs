//! shellcast: share a pty shell with remote clients over WebSocket, TCP or
//! Unix sockets.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sc_core::config::Config;
use sc_daemon::shutdown::{os_signal, ShutdownCause};
use sc_daemon::Daemon;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Serve a shell over framed byte streams.
#[derive(Parser, Debug)]
#[command(name = "shellcast", version, about)]
struct Cli {
    /// Config file (default: ~/.shellcast/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interface for the HTTP/WebSocket listener.
    #[arg(long)]
    host: Option<String>,

    /// Port for the HTTP/WebSocket listener.
    #[arg(short, long)]
    port: Option<u16>,

    /// Also accept raw frame streams on this Unix socket.
    #[arg(long)]
    unix_socket: Option<String>,

    /// Also accept raw frame streams on this TCP port.
    #[arg(long)]
    tcp_stream_port: Option<u16>,

    /// Maximum number of concurrent sessions.
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Exit once no session has been live for the configured idle period.
    #[arg(long)]
    exit_when_idle: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Command to run instead of the configured shell.
    #[arg(last = true)]
    command: Vec<String>,
}

impl Cli {
    /// Overlay command-line flags on the loaded config.
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = &self.unix_socket {
            config.server.unix_socket = Some(path.clone());
        }
        if let Some(port) = self.tcp_stream_port {
            config.server.tcp_stream_port = Some(port);
        }
        if let Some(max) = self.max_sessions {
            config.sessions.max_sessions = max;
        }
        if self.exit_when_idle {
            config.server.exit_when_idle = true;
        }
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
        if self.json_logs {
            config.general.log_format = "json".into();
        }
        if let Some((program, args)) = self.command.split_first() {
            config.shell.command = program.clone();
            config.shell.args = args.to_vec();
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    sc_telemetry::logging::init(
        "shellcast",
        &config.general.log_level,
        config.general.json_logs(),
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        shell = %config.shell.command,
        "shellcast starting"
    );

    let daemon = Daemon::bind(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Wire SIGINT/SIGTERM to graceful shutdown.
    tokio::spawn(async move {
        match os_signal().await {
            Ok(name) => {
                info!(signal = name, "signal received, initiating shutdown");
                shutdown.trigger(ShutdownCause::Signal(name));
            }
            Err(e) => error!(error = %e, "failed to listen for shutdown signals"),
        }
    });

    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon execution failed");
        return Err(e);
    }
    Ok(())
}
