use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sc_core::config::Config;
use sc_protocol::{Control, Frame, TerminalSignal};
use sc_pty::{PtyCommand, PtyError, PtyOptions, PtyOutput, PtyProcess, PtySignal, TermSize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

use crate::auth::{AllowAll, AuthDecision, Authorizer};
use crate::registry::{CapacityError, Registration, SessionRegistry};
use crate::session::{CloseReason, SessionHandle, SessionOutcome, SessionShared, SessionState};
use crate::transport::{Connection, FrameSink, FrameSource, TransportError};

type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Per-session behaviour, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub command: PtyCommand,
    /// Used when the client does not announce a size.
    pub default_size: TermSize,
    pub output_queue_depth: usize,
    /// How long queued output may take to flush when a session is closed
    /// while the shell still runs. After the shell exits it is instead how
    /// long the pty may stay silent before the drain gives up on it.
    pub close_grace: Duration,
    /// Time between SIGHUP and SIGKILL.
    pub kill_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub heartbeat: Option<Duration>,
    pub max_frame_bytes: usize,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        let shell = &config.shell;
        let mut command = PtyCommand::new(&shell.command)
            .args(shell.args.iter().cloned())
            .term(&shell.term);
        for (key, value) in &shell.env {
            command = command.env(key, value);
        }
        if let Some(cwd) = &shell.cwd {
            command = command.cwd(cwd);
        }

        let sessions = &config.sessions;
        Self {
            command,
            default_size: TermSize {
                rows: shell.rows,
                cols: shell.cols,
            },
            output_queue_depth: sessions.output_queue_depth,
            close_grace: sessions.close_grace(),
            kill_timeout: sessions.kill_timeout(),
            idle_timeout: sessions.idle_timeout(),
            heartbeat: sessions.heartbeat(),
            max_frame_bytes: sessions.max_frame_bytes,
        }
    }

    pub fn with_command(mut self, command: PtyCommand) -> Self {
        self.command = command;
        self
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why [`SessionManager::start`] refused a connection. The client has
/// already been sent a `CLOSE` frame by the time this is returned.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("spawn failed: {0}")]
    Spawn(#[from] PtyError),
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Turns accepted connections into running sessions.
pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    authorizer: Arc<dyn Authorizer>,
    settings: Arc<SessionSettings>,
}

impl SessionManager {
    pub fn new(registry: Arc<SessionRegistry>, settings: SessionSettings) -> Self {
        Self {
            registry,
            authorizer: Arc::new(AllowAll),
            settings: Arc::new(settings),
        }
    }

    pub fn with_authorizer(self, authorizer: impl Authorizer) -> Self {
        self.with_shared_authorizer(Arc::new(authorizer))
    }

    pub fn with_shared_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Authorize, admit, spawn and register a session for `connection`.
    ///
    /// Returns once the session is running; its pumps live on in background
    /// tasks. On refusal the client gets a `CLOSE` frame naming the reason
    /// and nothing is registered.
    pub async fn start(
        &self,
        connection: Connection,
        initial_size: Option<TermSize>,
    ) -> Result<SessionHandle, StartError> {
        let Connection { sink, source, info } = connection;
        let grace = self.settings.close_grace;

        if let AuthDecision::Deny(why) = self.authorizer.authorize(&info) {
            warn!(peer = %info.peer, transport = %info.transport, %why, "connection refused");
            refuse(sink, "unauthorized", grace).await;
            return Err(StartError::Unauthorized(why));
        }

        let reservation = match self.registry.try_reserve() {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!(peer = %info.peer, max = e.max, "session refused, server at capacity");
                refuse(sink, "server at capacity", grace).await;
                return Err(e.into());
            }
        };

        let size = initial_size.unwrap_or(self.settings.default_size);
        let options = PtyOptions {
            output_queue_depth: self.settings.output_queue_depth,
        };
        let pty = match PtyProcess::spawn_with_options(&self.settings.command, size, options) {
            Ok(pty) => pty,
            Err(e) => {
                let detail = match &e {
                    PtyError::Spawn(msg) => msg.clone(),
                    other => other.to_string(),
                };
                warn!(peer = %info.peer, error = %e, "shell spawn failed");
                refuse(sink, &format!("spawn failed: {detail}"), grace).await;
                return Err(e.into());
            }
        };

        let id = Uuid::new_v4();
        let seq = self.registry.next_seq();
        let (close_tx, close_rx) = mpsc::channel(1);
        let shared = Arc::new(SessionShared::new(id, seq, &info, size, pty.pid(), close_tx));
        let handle = SessionHandle::new(Arc::clone(&shared));
        let registration = reservation.register(handle.clone());
        shared.transition(SessionState::Connecting, SessionState::Active);
        shared.touch();

        let span = sc_telemetry::tracing_setup::session_span(&id, &info.peer);
        span.in_scope(|| {
            info!(
                seq,
                transport = %info.transport,
                %size,
                pid = ?pty.pid(),
                "session started"
            );
        });

        let task = SessionTask {
            shared,
            pty: Arc::new(pty),
            sink: Arc::new(Mutex::new(sink)),
            source,
            close_rx,
            registration,
            settings: Arc::clone(&self.settings),
        };
        tokio::spawn(task.run().instrument(span));

        Ok(handle)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Tell a client it was not admitted, without waiting on it for long.
async fn refuse(mut sink: Box<dyn FrameSink>, reason: &str, grace: Duration) {
    let attempt = async {
        if let Err(e) = sink.send(Frame::close(reason)).await {
            debug!(error = %e, "could not deliver refusal");
        }
        let _ = sink.close().await;
    };
    if tokio::time::timeout(grace, attempt).await.is_err() {
        debug!(reason, "refusal timed out");
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

struct SessionTask {
    shared: Arc<SessionShared>,
    pty: Arc<PtyProcess>,
    sink: SharedSink,
    source: Box<dyn FrameSource>,
    close_rx: mpsc::Receiver<CloseReason>,
    registration: Registration,
    settings: Arc<SessionSettings>,
}

enum OutputEnd {
    Eof,
    Cancelled,
    /// The child is gone and the pty stayed silent with nothing queued.
    Quiet,
    SinkFailed(TransportError),
}

impl SessionTask {
    /// Supervise the pumps until something ends the session, then tear down.
    async fn run(self) {
        let SessionTask {
            shared,
            pty,
            sink,
            source,
            mut close_rx,
            registration,
            settings,
        } = self;
        let cancel = CancellationToken::new();
        let exited = CancellationToken::new();

        let mut output_task = tokio::spawn(
            output_pump(
                pty.output(),
                Arc::clone(&sink),
                Arc::clone(&shared),
                OutputStop {
                    cancel: cancel.clone(),
                    exited: exited.clone(),
                    quiet_after: settings.close_grace,
                },
                settings.max_frame_bytes,
            )
            .in_current_span(),
        );
        let mut input_task = tokio::spawn(
            input_pump(source, Arc::clone(&pty), Arc::clone(&sink), Arc::clone(&shared))
                .in_current_span(),
        );
        let mut heartbeat_task = settings.heartbeat.map(|period| {
            tokio::spawn(heartbeat(Arc::clone(&sink), Arc::clone(&shared), period).in_current_span())
        });

        let idle_limit = settings.idle_timeout;
        let mut idle_check = tokio::time::interval(
            idle_limit.map_or(Duration::from_secs(60), |t| t.min(Duration::from_secs(1))),
        );
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut output_done = false;
        let reason = loop {
            tokio::select! {
                res = &mut output_task => {
                    output_done = true;
                    break match res {
                        Ok(OutputEnd::Eof | OutputEnd::Cancelled | OutputEnd::Quiet) => {
                            CloseReason::ChildExited
                        }
                        Ok(OutputEnd::SinkFailed(e)) => sink_failure(e),
                        Err(e) => CloseReason::TransportError(format!("output pump failed: {e}")),
                    };
                }
                res = &mut input_task => {
                    break res.unwrap_or_else(|e| {
                        CloseReason::TransportError(format!("input pump failed: {e}"))
                    });
                }
                status = pty.wait() => {
                    debug!(code = status.code, signal = ?status.signal, "shell exited");
                    break CloseReason::ChildExited;
                }
                Some(reason) = close_rx.recv() => break reason,
                reason = join_heartbeat(&mut heartbeat_task) => break reason,
                _ = idle_check.tick(), if idle_limit.is_some() => {
                    if idle_limit.is_some_and(|limit| shared.idle_for() >= limit) {
                        break CloseReason::IdleTimeout;
                    }
                }
            }
        };

        shared.transition(SessionState::Active, SessionState::Closing);
        info!(%reason, "session closing");

        // Drain output so EXIT and CLOSE follow the last OUTPUT. After a
        // child exit the pump runs until the pty has nothing left, however
        // slowly the client reads. Other reasons flush what is queued
        // within the grace.
        if !output_done && reason == CloseReason::ChildExited {
            exited.cancel();
            tokio::select! {
                res = &mut output_task => {
                    output_done = true;
                    if let Ok(OutputEnd::SinkFailed(e)) = res {
                        debug!(error = %e, "client went away during output drain");
                    }
                }
                Some(cut) = close_rx.recv() => {
                    info!(reason = %cut, "output drain interrupted");
                }
                cut = join_heartbeat(&mut heartbeat_task) => {
                    info!(reason = %cut, "output drain interrupted");
                }
            }
        }
        if !output_done {
            cancel.cancel();
            if tokio::time::timeout(settings.close_grace, &mut output_task)
                .await
                .is_err()
            {
                warn!("output did not drain in time, dropping the rest");
                output_task.abort();
            }
        }
        input_task.abort();
        if let Some(task) = &heartbeat_task {
            task.abort();
        }

        let mut exit_status = pty.try_exit_status();
        if exit_status.is_none() && reason == CloseReason::ChildExited {
            exit_status = tokio::time::timeout(settings.close_grace, pty.wait())
                .await
                .ok();
        }

        if let Some(status) = &exit_status {
            let frame = Frame::exit(status.code, status.signal.clone());
            send_final(&sink, &shared, frame, settings.close_grace).await;
        }
        send_final(&sink, &shared, Frame::close(reason.wire_text()), settings.close_grace).await;
        let closing = async { sink.lock().await.close().await };
        if let Ok(Err(e)) = tokio::time::timeout(settings.close_grace, closing).await {
            debug!(error = %e, "transport close failed");
        }

        if exit_status.is_none() {
            pty.terminate(settings.kill_timeout).await;
            exit_status = pty.try_exit_status();
        }
        drop(pty);

        let stats = shared.stats.snapshot();
        drop(registration);
        shared.finish(SessionOutcome {
            reason: reason.clone(),
            exit_status: exit_status.clone(),
        });
        info!(
            %reason,
            exit_code = ?exit_status.as_ref().map(|s| s.code),
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            "session closed"
        );
    }
}

async fn join_heartbeat(task: &mut Option<JoinHandle<CloseReason>>) -> CloseReason {
    match task {
        Some(handle) => handle.await.unwrap_or(CloseReason::HeartbeatFailed),
        None => std::future::pending().await,
    }
}

fn sink_failure(err: TransportError) -> CloseReason {
    match err {
        TransportError::Closed => CloseReason::TransportClosed,
        other => CloseReason::TransportError(other.to_string()),
    }
}

async fn send_frame(
    sink: &SharedSink,
    shared: &SessionShared,
    frame: Frame,
) -> Result<(), TransportError> {
    let bytes = match &frame {
        Frame::Output(data) => data.len(),
        _ => 0,
    };
    sink.lock().await.send(frame).await?;
    shared.stats.record_out(bytes);
    Ok(())
}

/// Best-effort send during teardown.
async fn send_final(sink: &SharedSink, shared: &SessionShared, frame: Frame, grace: Duration) {
    let kind = frame.kind();
    match tokio::time::timeout(grace, send_frame(sink, shared, frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%kind, error = %e, "final frame not delivered"),
        Err(_) => debug!(%kind, "final frame timed out"),
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

/// Ways the supervisor can end the output pump early.
struct OutputStop {
    /// Flush what is queued, then stop.
    cancel: CancellationToken,
    /// The child is gone; stop once the pty has been silent for
    /// `quiet_after` with nothing queued.
    exited: CancellationToken,
    quiet_after: Duration,
}

impl OutputStop {
    async fn quiet(&self) {
        self.exited.cancelled().await;
        tokio::time::sleep(self.quiet_after).await;
    }
}

/// pty output → `OUTPUT` frames. Each send is awaited, so a slow client
/// stalls this loop, the bounded output queue fills and the reader thread
/// stops draining the pty.
async fn output_pump(
    output: PtyOutput,
    sink: SharedSink,
    shared: Arc<SessionShared>,
    stop: OutputStop,
    max_frame_bytes: usize,
) -> OutputEnd {
    let cancel = &stop.cancel;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                while let Some(chunk) = output.try_recv() {
                    if let Err(e) = forward_output(&sink, &shared, chunk, max_frame_bytes).await {
                        return OutputEnd::SinkFailed(e);
                    }
                }
                return OutputEnd::Cancelled;
            }
            chunk = output.recv() => chunk,
            // Something outlived the child and still holds the pty open.
            _ = stop.quiet() => {
                debug!("pty silent after child exit");
                return OutputEnd::Quiet;
            }
        };
        let Some(chunk) = chunk else {
            debug!("pty output ended");
            return OutputEnd::Eof;
        };
        if let Err(e) = forward_output(&sink, &shared, chunk, max_frame_bytes).await {
            debug!(error = %e, "output send failed");
            return OutputEnd::SinkFailed(e);
        }
    }
}

async fn forward_output(
    sink: &SharedSink,
    shared: &SessionShared,
    chunk: Vec<u8>,
    max_frame_bytes: usize,
) -> Result<(), TransportError> {
    let data = Bytes::from(chunk);
    let step = max_frame_bytes.max(1);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + step).min(data.len());
        send_frame(sink, shared, Frame::Output(data.slice(offset..end))).await?;
        offset = end;
    }
    Ok(())
}

/// Client frames → pty. Returns the reason the client side ended.
async fn input_pump(
    mut source: Box<dyn FrameSource>,
    pty: Arc<PtyProcess>,
    sink: SharedSink,
    shared: Arc<SessionShared>,
) -> CloseReason {
    loop {
        let frame = match source.recv().await {
            Some(Ok(frame)) => frame,
            Some(Err(TransportError::Protocol(e))) => {
                warn!(error = %e, tag = ?e.tag(), "protocol error from client");
                return CloseReason::ProtocolError(e.to_string());
            }
            Some(Err(TransportError::Closed)) | None => {
                debug!("client went away");
                return CloseReason::TransportClosed;
            }
            Some(Err(e)) => {
                warn!(error = %e, "transport error");
                return CloseReason::TransportError(e.to_string());
            }
        };

        let kind = frame.kind();
        let payload = match &frame {
            Frame::Input(data) => data.len(),
            _ => 0,
        };
        shared.stats.record_in(payload);

        match frame {
            Frame::Input(data) => {
                shared.touch();
                if let Err(e) = pty.write_async(data.to_vec()).await {
                    debug!(error = %e, "pty input closed, dropping input");
                }
            }
            Frame::Resize { rows, cols } => {
                shared.touch();
                let size = TermSize { rows, cols };
                match pty.resize_async(size).await {
                    Ok(()) => {
                        shared.set_size(size);
                        shared.stats.record_resize();
                        debug!(rows, cols, "resize queued");
                    }
                    Err(e) => debug!(error = %e, "resize ignored"),
                }
            }
            Frame::Control(Control::Signal(signal)) => {
                shared.touch();
                if let Err(e) = pty.signal(pty_signal(signal)) {
                    warn!(?signal, error = %e, "signal delivery failed");
                }
            }
            Frame::Control(Control::Ping(data)) => {
                shared.touch();
                if let Err(e) = send_frame(&sink, &shared, Frame::pong(data)).await {
                    return sink_failure(e);
                }
            }
            Frame::Control(Control::Pong(_)) => trace!("pong"),
            Frame::Control(Control::Close { reason }) => {
                info!(%reason, "client closed session");
                return CloseReason::ClientClosed(reason);
            }
            Frame::Output(_) | Frame::Control(Control::Exit { .. }) => {
                warn!(%kind, "client sent a server-only frame");
                return CloseReason::ProtocolError(format!(
                    "unexpected {} frame from client",
                    kind.name()
                ));
            }
        }
    }
}

/// Periodic `PING`s. Ends only when one cannot be delivered within a period.
async fn heartbeat(sink: SharedSink, shared: Arc<SessionShared>, period: Duration) -> CloseReason {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut n: u64 = 0;
    loop {
        ticker.tick().await;
        n += 1;
        let ping = Frame::ping(Bytes::copy_from_slice(&n.to_be_bytes()));
        match tokio::time::timeout(period, send_frame(&sink, &shared, ping)).await {
            Ok(Ok(())) => trace!(n, "heartbeat sent"),
            Ok(Err(e)) => {
                debug!(error = %e, "heartbeat send failed");
                return CloseReason::HeartbeatFailed;
            }
            Err(_) => {
                warn!("heartbeat stalled for a full interval");
                return CloseReason::HeartbeatFailed;
            }
        }
    }
}

fn pty_signal(signal: TerminalSignal) -> PtySignal {
    match signal {
        TerminalSignal::Interrupt => PtySignal::Interrupt,
        TerminalSignal::Quit => PtySignal::Quit,
        TerminalSignal::Hangup => PtySignal::Hangup,
        TerminalSignal::Terminate => PtySignal::Terminate,
        TerminalSignal::Suspend => PtySignal::Suspend,
        TerminalSignal::Kill => PtySignal::Kill,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
