use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sc_bridge::http_api::{self, ApiState};
use sc_bridge::{StreamAddr, StreamListener};
use sc_core::config::Config;
use sc_session::{AuthChain, OriginAllowlist, SessionManager, SessionRegistry, SessionSettings, SharedSecret};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::shutdown::{drain_sessions, DrainResult, ShutdownCause, ShutdownSignal};

/// Close reason sent to every live session when the daemon stops.
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Extra time on top of the per-session teardown budget before the drain
/// gives up.
const DRAIN_MARGIN: Duration = Duration::from_secs(1);

/// How long listener tasks get to wind down after the drain.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The shellcast server process: the HTTP/WebSocket listener, optional raw
/// stream listeners, and the shared session registry behind them.
///
/// [`Daemon::bind`] claims every socket up front so a port conflict fails
/// startup instead of surfacing later. [`Daemon::run`] serves until the
/// [`ShutdownSignal`] fires, then drains the sessions.
pub struct Daemon {
    config: Config,
    registry: Arc<SessionRegistry>,
    api_state: Arc<ApiState>,
    http: TcpListener,
    http_addr: SocketAddr,
    streams: Vec<StreamListener>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Build the session layer from `config` and bind all listeners.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let registry = SessionRegistry::new(config.sessions.max_sessions);
        let mut manager = SessionManager::new(
            Arc::clone(&registry),
            SessionSettings::from_config(&config),
        );
        let authorizer = authorizer_for(&config);
        if !authorizer.is_empty() {
            info!(checks = authorizer.len(), "session authorization enabled");
            manager = manager.with_authorizer(authorizer);
        }
        let api_state = Arc::new(ApiState::new(Arc::new(manager)));

        let bind_addr = config.server.bind_addr();
        let http = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind http listener on {bind_addr}"))?;
        let http_addr = http.local_addr().context("http listener has no local address")?;

        let handshake_timeout = config.server.handshake_timeout();
        let mut streams = Vec::new();
        for addr in configured_stream_addrs(&config) {
            let listener = StreamListener::bind(&addr, handshake_timeout)
                .await
                .with_context(|| format!("failed to bind stream listener on {addr}"))?;
            streams.push(listener);
        }

        Ok(Self {
            config,
            registry,
            api_state,
            http,
            http_addr,
            streams,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Address the HTTP/WebSocket listener actually bound.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Bound raw stream listener addresses, TCP first.
    pub fn stream_addrs(&self) -> Vec<StreamAddr> {
        self.streams.iter().map(|l| l.local_addr().clone()).collect()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Serve until shutdown is triggered, then close every session and stop
    /// the listeners.
    pub async fn run(self) -> Result<()> {
        let Daemon {
            config,
            registry,
            api_state,
            http,
            http_addr,
            streams,
            shutdown,
        } = self;

        let accept = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let router = http_api::api_router_with_auth(
            Arc::clone(&api_state),
            config.security.api_key(),
            config.server.static_dir.as_ref().map(PathBuf::from),
        );
        {
            let accept = accept.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = http_api::serve(http, router, accept).await {
                    error!(error = %e, "http listener failed");
                    shutdown.trigger(ShutdownCause::Requested);
                }
            }));
        }
        info!(addr = %http_addr, "shellcast listening");

        for listener in streams {
            info!(addr = %listener.local_addr(), "stream listener ready");
            tasks.push(tokio::spawn(
                listener.serve(Arc::clone(api_state.manager()), accept.clone()),
            ));
        }

        let idle_watch = config.server.exit_when_idle.then(|| {
            tokio::spawn(watch_idle(
                Arc::clone(&registry),
                config.server.idle_exit(),
                shutdown.clone(),
            ))
        });

        shutdown.triggered().await;
        info!(cause = ?shutdown.cause(), "shutting down");
        if let Some(task) = idle_watch {
            task.abort();
        }
        accept.cancel();

        let budget = config.sessions.close_grace() + config.sessions.kill_timeout() + DRAIN_MARGIN;
        match drain_sessions(&registry, SHUTDOWN_REASON, budget).await {
            DrainResult::Complete => {}
            DrainResult::Timeout { remaining } => {
                warn!(remaining, "stopping with sessions still open");
            }
        }

        for task in tasks {
            match tokio::time::timeout(JOIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "listener task failed"),
                Err(_) => warn!("listener task did not stop in time"),
            }
        }
        info!("shellcast stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("http_addr", &self.http_addr)
            .field("streams", &self.stream_addrs())
            .field("sessions", &self.registry.len())
            .field("shutting_down", &self.shutdown.is_shutting_down())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn authorizer_for(config: &Config) -> AuthChain {
    let mut chain = AuthChain::new();
    if let Some(key) = config.security.api_key() {
        chain = chain.with(SharedSecret::new(key));
    }
    if !config.security.allowed_origins.is_empty() {
        chain = chain.with(OriginAllowlist::new(config.security.allowed_origins.clone()));
    }
    chain
}

fn configured_stream_addrs(config: &Config) -> Vec<StreamAddr> {
    let server = &config.server;
    let mut addrs = Vec::new();
    if let Some(port) = server.tcp_stream_port {
        addrs.push(StreamAddr::Tcp(format!("{}:{port}", server.host)));
    }
    if let Some(path) = &server.unix_socket {
        addrs.push(StreamAddr::Unix(PathBuf::from(path)));
    }
    addrs
}

/// Trigger an idle shutdown once the registry has stayed empty for `idle`.
async fn watch_idle(registry: Arc<SessionRegistry>, idle: Duration, shutdown: ShutdownSignal) {
    let mut live = registry.subscribe();
    loop {
        if live.wait_for(|n| *n == 0).await.is_err() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(idle) => {
                if registry.is_empty() {
                    info!(idle_secs = idle.as_secs(), "no sessions, exiting");
                    shutdown.trigger(ShutdownCause::Idle);
                    return;
                }
            }
            changed = live.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
