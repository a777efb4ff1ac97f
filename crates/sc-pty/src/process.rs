use std::io::{Read as IoRead, Write as IoWrite};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, ChildKiller, PtySize};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::command::PtyCommand;
use crate::error::{PtyError, Result};

/// Largest chunk the reader thread hands to consumers in one piece.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Default depth of the output queue between the reader thread and the
/// consumer. When full, the reader stops draining the pty and the child
/// eventually blocks on write.
pub const DEFAULT_OUTPUT_QUEUE_DEPTH: usize = 64;

const INPUT_QUEUE_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Terminal dimensions in character cells. Both components are non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl TermSize {
    pub fn new(rows: u16, cols: u16) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(PtyError::Internal(format!(
                "terminal size must be non-zero, got {rows}x{cols}"
            )));
        }
        Ok(Self { rows, cols })
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl std::fmt::Display for TermSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// How the child process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code. Processes killed by a signal report a non-zero code.
    pub code: u32,
    /// Name of the terminating signal, if any.
    pub signal: Option<String>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

impl From<portable_pty::ExitStatus> for ExitStatus {
    fn from(status: portable_pty::ExitStatus) -> Self {
        Self {
            code: status.exit_code(),
            signal: status.signal().map(ToOwned::to_owned),
        }
    }
}

/// Signals a client may ask to deliver to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PtySignal {
    Interrupt,
    Quit,
    Hangup,
    Terminate,
    Suspend,
    Kill,
}

impl PtySignal {
    /// Control character the line discipline turns into this signal for the
    /// foreground process group, if there is one.
    fn control_char(self) -> Option<u8> {
        match self {
            PtySignal::Interrupt => Some(0x03),
            PtySignal::Quit => Some(0x1c),
            PtySignal::Suspend => Some(0x1a),
            _ => None,
        }
    }

    fn raw(self) -> libc::c_int {
        match self {
            PtySignal::Interrupt => libc::SIGINT,
            PtySignal::Quit => libc::SIGQUIT,
            PtySignal::Hangup => libc::SIGHUP,
            PtySignal::Terminate => libc::SIGTERM,
            PtySignal::Suspend => libc::SIGTSTP,
            PtySignal::Kill => libc::SIGKILL,
        }
    }
}

/// Tuning knobs for [`PtyProcess::spawn_with_options`].
#[derive(Debug, Clone, Copy)]
pub struct PtyOptions {
    pub output_queue_depth: usize,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            output_queue_depth: DEFAULT_OUTPUT_QUEUE_DEPTH,
        }
    }
}

// ---------------------------------------------------------------------------
// Output stream
// ---------------------------------------------------------------------------

/// Finite, ordered stream of output chunks. Ends once the child has closed
/// the terminal and everything read before that has been delivered.
#[derive(Clone)]
pub struct PtyOutput {
    rx: flume::Receiver<Vec<u8>>,
}

impl PtyOutput {
    /// Next chunk, or `None` at end of stream.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.rx.recv_async().await.ok()
    }

    /// Next chunk if one is already queued.
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Drain whatever is queued right now without waiting.
    pub fn try_read_all(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            buf.extend_from_slice(&chunk);
        }
        buf
    }

    /// Read output with an async timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .ok()
            .flatten()
    }

    /// Number of chunks waiting to be consumed.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }
}

impl std::fmt::Debug for PtyOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyOutput")
            .field("queued", &self.rx.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PtyProcess
// ---------------------------------------------------------------------------

/// Input-side operations, applied by a single thread in submission order.
enum InputOp {
    Write(Vec<u8>),
    Resize(TermSize),
}

/// A child process running on its own pseudo-terminal.
///
/// Three helper threads do the blocking work: one drains the master into
/// the output queue, one applies writes and resizes in order, and one waits
/// for the child and publishes its exit status.
pub struct PtyProcess {
    pid: Option<u32>,
    input: flume::Sender<InputOp>,
    output: PtyOutput,
    exit: watch::Receiver<Option<ExitStatus>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    size: Arc<Mutex<TermSize>>,
}

impl PtyProcess {
    /// Spawn `command` on a new pty of the given size.
    pub fn spawn(command: &PtyCommand, size: TermSize) -> Result<Self> {
        Self::spawn_with_options(command, size, PtyOptions::default())
    }

    pub fn spawn_with_options(
        command: &PtyCommand,
        size: TermSize,
        options: PtyOptions,
    ) -> Result<Self> {
        let size = TermSize::new(size.rows, size.cols)?;
        let builder = command.to_builder()?;

        let pair = native_pty_system()
            .openpty(size.into())
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // Only the child may hold the slave side, otherwise the reader never
        // sees end-of-file.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        info!(program = %command.program, ?pid, %size, "spawned pty process");

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let master = pair.master;

        // -- output reader thread --
        let (out_tx, out_rx) = flume::bounded::<Vec<u8>>(options.output_queue_depth.max(1));
        std::thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            // Blocks while the queue is full.
                            if out_tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // Linux reports EIO once the slave side is gone.
                            debug!("pty reader finished: {e}");
                            break;
                        }
                    }
                }
                debug!("pty output stream ended");
            })
            .map_err(|e| PtyError::Spawn(format!("reader thread: {e}")))?;

        // -- input writer thread --
        let size = Arc::new(Mutex::new(size));
        let applied_size = Arc::clone(&size);
        let (in_tx, in_rx) = flume::bounded::<InputOp>(INPUT_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("pty-writer".into())
            .spawn(move || {
                while let Ok(op) = in_rx.recv() {
                    match op {
                        InputOp::Write(data) => {
                            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                                debug!("pty write failed, closing input: {e}");
                                break;
                            }
                        }
                        InputOp::Resize(new_size) => match master.resize(new_size.into()) {
                            Ok(()) => {
                                *applied_size.lock().unwrap_or_else(|e| {
                                    warn!("size lock was poisoned, recovering");
                                    e.into_inner()
                                }) = new_size;
                                debug!(%new_size, "pty resized");
                            }
                            Err(e) => warn!(%new_size, "pty resize failed: {e}"),
                        },
                    }
                }
            })
            .map_err(|e| PtyError::Spawn(format!("writer thread: {e}")))?;

        // -- exit waiter thread --
        let (exit_tx, exit_rx) = watch::channel(None);
        std::thread::Builder::new()
            .name("pty-waiter".into())
            .spawn(move || {
                let status = match child.wait() {
                    Ok(status) => ExitStatus::from(status),
                    Err(e) => {
                        warn!("waiting for pty child failed: {e}");
                        ExitStatus {
                            code: 1,
                            signal: None,
                        }
                    }
                };
                debug!(code = status.code, signal = ?status.signal, "pty child exited");
                let _ = exit_tx.send(Some(status));
            })
            .map_err(|e| PtyError::Spawn(format!("waiter thread: {e}")))?;

        Ok(Self {
            pid,
            input: in_tx,
            output: PtyOutput { rx: out_rx },
            exit: exit_rx,
            killer: Mutex::new(killer),
            size,
        })
    }

    /// OS process id of the child, when the platform exposes one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The child's output stream. Meant for a single consumer.
    pub fn output(&self) -> PtyOutput {
        self.output.clone()
    }

    /// Queue bytes for the child's input, blocking while the queue is full.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.input
            .send(InputOp::Write(data.to_vec()))
            .map_err(|_| PtyError::Closed)
    }

    /// Async variant of [`write`](Self::write).
    pub async fn write_async(&self, data: Vec<u8>) -> Result<()> {
        self.input
            .send_async(InputOp::Write(data))
            .await
            .map_err(|_| PtyError::Closed)
    }

    /// Change the terminal size. Applied after every write queued before it.
    pub fn resize(&self, size: TermSize) -> Result<()> {
        let size = TermSize::new(size.rows, size.cols)?;
        self.input
            .send(InputOp::Resize(size))
            .map_err(|_| PtyError::Closed)
    }

    pub async fn resize_async(&self, size: TermSize) -> Result<()> {
        let size = TermSize::new(size.rows, size.cols)?;
        self.input
            .send_async(InputOp::Resize(size))
            .await
            .map_err(|_| PtyError::Closed)
    }

    /// Last size successfully applied to the terminal.
    pub fn size(&self) -> TermSize {
        *self.size.lock().unwrap_or_else(|e| {
            warn!("size lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Deliver a signal to the child.
    ///
    /// Interrupt, quit and suspend go through the terminal as their control
    /// characters, so they reach whatever job is in the foreground. The rest
    /// are sent to the child's process group. Never blocks. Signalling an
    /// exited child is a no-op.
    pub fn signal(&self, signal: PtySignal) -> Result<()> {
        if !self.is_alive() {
            debug!(?signal, "child already exited, signal ignored");
            return Ok(());
        }
        if let Some(ch) = signal.control_char() {
            match self.input.try_send(InputOp::Write(vec![ch])) {
                Ok(()) => return Ok(()),
                Err(flume::TrySendError::Disconnected(_)) => return Err(PtyError::Closed),
                Err(flume::TrySendError::Full(_)) => {
                    debug!(?signal, "input queue full, signalling process group directly");
                }
            }
        }
        debug!(?signal, pid = ?self.pid, "signalling pty child");
        self.kill_group(signal)
    }

    fn kill_group(&self, signal: PtySignal) -> Result<()> {
        let Some(pid) = self.pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
            return self.kill_via_handle();
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(-pid, signal.raw()) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(PtyError::Io(err));
        }
        // Not a group leader; fall back to the process itself.
        // SAFETY: as above.
        let rc = unsafe { libc::kill(pid, signal.raw()) };
        let err = std::io::Error::last_os_error();
        if rc == 0 || err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(PtyError::Io(err))
        }
    }

    fn kill_via_handle(&self) -> Result<()> {
        let mut killer = self.killer.lock().unwrap_or_else(|e| {
            warn!("killer lock was poisoned, recovering");
            e.into_inner()
        });
        killer
            .kill()
            .map_err(|e| PtyError::Internal(format!("kill failed: {e}")))
    }

    /// Exit status if the child has already ended.
    pub fn try_exit_status(&self) -> Option<ExitStatus> {
        self.exit.borrow().clone()
    }

    /// Check whether the child process is still running.
    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Wait for the child to end.
    pub async fn wait(&self) -> ExitStatus {
        let mut rx = self.exit.clone();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => status.clone().unwrap_or_else(unknown_exit),
            Err(_) => unknown_exit(),
        };
        status
    }

    /// Hang up the child and give it `grace` to leave before killing it.
    pub async fn terminate(&self, grace: Duration) -> ExitStatus {
        if let Some(status) = self.try_exit_status() {
            return status;
        }
        if let Err(e) = self.kill_group(PtySignal::Hangup) {
            warn!("SIGHUP failed: {e}");
        }
        if let Ok(status) = tokio::time::timeout(grace, self.wait()).await {
            return status;
        }

        warn!(pid = ?self.pid, "child ignored SIGHUP, killing");
        if let Err(e) = self.kill_group(PtySignal::Kill) {
            warn!("SIGKILL failed: {e}");
        }
        let _ = self.kill_via_handle();
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(pid = ?self.pid, "child did not report exit after SIGKILL");
                ExitStatus {
                    code: 1,
                    signal: Some("Killed".into()),
                }
            }
        }
    }
}

fn unknown_exit() -> ExitStatus {
    ExitStatus {
        code: 1,
        signal: None,
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            debug!(pid = ?self.pid, "dropping live pty process, killing");
            if self.kill_group(PtySignal::Kill).is_err() {
                let _ = self.kill_via_handle();
            }
        }
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_rejected() {
        assert!(TermSize::new(0, 80).is_err());
        assert!(TermSize::new(24, 0).is_err());
        assert_eq!(TermSize::new(24, 80).unwrap(), TermSize::default());
    }

    #[test]
    fn pty_size_conversion() {
        let size: PtySize = TermSize { rows: 40, cols: 120 }.into();
        assert_eq!((size.rows, size.cols, size.pixel_width), (40, 120, 0));
    }

    #[test]
    fn control_characters() {
        assert_eq!(PtySignal::Interrupt.control_char(), Some(0x03));
        assert_eq!(PtySignal::Quit.control_char(), Some(0x1c));
        assert_eq!(PtySignal::Suspend.control_char(), Some(0x1a));
        assert_eq!(PtySignal::Terminate.control_char(), None);
        assert_eq!(PtySignal::Kill.raw(), libc::SIGKILL);
    }

    #[test]
    fn exit_status_success() {
        assert!(ExitStatus { code: 0, signal: None }.success());
        assert!(!ExitStatus { code: 0, signal: Some("Hangup".into()) }.success());
        assert!(!ExitStatus { code: 2, signal: None }.success());
    }
}
