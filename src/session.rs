//! Per-connection shell sessions.
//!
//! A [`PtySession`] exclusively owns one child process, the master side of
//! its pseudo-terminal, and the write half of the peer's socket connection.
//! It is torn down by exactly one of three triggers: an explicit
//! [`SessionHandle::close`], the peer disconnecting (the dispatcher calls
//! `close`), or the child exiting (the exit watcher files a termination
//! report and the event loop calls `close`).

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::packet::WindowSize;
use crate::pty::{Pty, PtyChild, PtyError};

/// Written to the peer immediately before its connection is closed.
pub const CLOSE_NOTICE: &[u8] = b"Process terminated, closing connection\n";

/// Geometry of a freshly spawned pty, until the client sends a Resize.
pub const INITIAL_SIZE: WindowSize = WindowSize {
    rows: 24,
    cols: 80,
    x_pixels: 0,
    y_pixels: 0,
};

/// Upper bound on best-effort writes to the peer during teardown.
const NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long to wait for the reap after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

const PTY_READ_BUFFER: usize = 4096;

/// Identity of a session inside one daemon process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a session. Each transition happens at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Terminating,
    Closed,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to start shell: {0}")]
    Spawn(#[source] PtyError),

    #[error("short write to pty: {written}/{requested} bytes written")]
    ShortWrite { written: usize, requested: usize },

    #[error("failed to write to pty: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] PtyError),

    #[error("session is closed")]
    Closed,

    #[error("connection error: {0}")]
    Connection(#[source] std::io::Error),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Errors produced by a teardown. The stream ends once teardown is complete.
pub type CloseErrors = ReceiverStream<SessionError>;

/// Capabilities a connection needs from its session.
///
/// `PtySession` is the only production implementation; the trait lets the
/// dispatcher and event loop run against a test double.
pub trait SessionHandle: Send + Sync + 'static {
    fn id(&self) -> SessionId;

    /// Write raw bytes to the terminal.
    fn write_data(&self, data: &[u8]) -> Result<(), SessionError>;

    /// Apply a new terminal geometry.
    fn resize(&self, size: WindowSize) -> Result<(), SessionError>;

    /// Tear the session down. Safe to call more than once; only the first
    /// call has side effects, later calls finish when that teardown does and
    /// yield no errors.
    fn close(&self) -> CloseErrors;
}

/// A shell running on a pseudo-terminal, bound to one socket connection.
#[derive(Clone)]
pub struct PtySession {
    inner: Arc<Inner>,
}

struct Inner {
    id: SessionId,
    pid: Option<u32>,
    grace_period: Duration,
    state: Mutex<SessionState>,
    pty: Mutex<Option<Pty>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    conn: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reports: mpsc::UnboundedSender<SessionId>,
    /// Cancelled during teardown; ends the relay and the dispatcher.
    cancelled: CancellationToken,
    /// Cancelled by the exit watcher once the child has been reaped.
    exited: CancellationToken,
    /// Cancelled once the first teardown has finished.
    closed: CancellationToken,
    close_started: AtomicBool,
    reported: AtomicBool,
    force_killed: AtomicBool,
}

impl fmt::Debug for PtySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PtySession {
    /// Spawn the configured shell on a new pty and bind it to `stream`.
    ///
    /// Returns the session and the read half of the connection, which the
    /// caller hands to the dispatcher. If the shell cannot be started, an
    /// error notice is written to the peer and the connection is dropped.
    pub async fn start(
        id: SessionId,
        mut stream: UnixStream,
        config: &Config,
        reports: mpsc::UnboundedSender<SessionId>,
    ) -> Result<(Self, OwnedReadHalf), SessionError> {
        let shell = config.shell.clone();
        let spawned = tokio::task::spawn_blocking(move || {
            let mut pty = Pty::spawn(&shell, INITIAL_SIZE)?;
            let reader = pty.take_reader()?;
            let writer = pty.take_writer()?;
            let child = pty.take_child();
            Ok::<_, PtyError>((pty, reader, writer, child))
        })
        .await?;

        let (pty, pty_reader, pty_writer, child) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!(session = %id, ?e, "failed to start shell");
                let notice = format!("failed to start shell: {}\n", e);
                let _ = tokio::time::timeout(NOTICE_TIMEOUT, stream.write_all(notice.as_bytes())).await;
                return Err(SessionError::Spawn(e));
            }
        };

        let pid = pty.pid();
        let (read_half, write_half) = stream.into_split();

        let inner = Arc::new(Inner {
            id,
            pid,
            grace_period: config.grace_period(),
            state: Mutex::new(SessionState::Starting),
            pty: Mutex::new(Some(pty)),
            writer: Mutex::new(Some(pty_writer)),
            conn: tokio::sync::Mutex::new(Some(write_half)),
            reports,
            cancelled: CancellationToken::new(),
            exited: CancellationToken::new(),
            closed: CancellationToken::new(),
            close_started: AtomicBool::new(false),
            reported: AtomicBool::new(false),
            force_killed: AtomicBool::new(false),
        });

        // Running before the watcher exists, so an instant exit still moves
        // the session on to Terminating.
        inner.transition(SessionState::Starting, SessionState::Running);
        match child {
            Some(child) => spawn_exit_watcher(inner.clone(), child),
            None => inner.exited.cancel(),
        }

        // Pty output: blocking reader thread → channel → socket relay.
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(64);
        spawn_pty_reader(id, pty_reader, output_tx);
        tokio::spawn(relay_output(inner.clone(), output_rx));

        tracing::info!(session = %id, ?pid, "session started");

        Ok((Self { inner }, read_half))
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Token that fires when teardown begins; the dispatcher stops on it.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancelled.clone()
    }

    /// True once the child process has exited and been reaped.
    pub fn has_exited(&self) -> bool {
        self.inner.exited.is_cancelled()
    }

    /// True if teardown had to escalate to SIGKILL.
    pub fn was_force_killed(&self) -> bool {
        self.inner.force_killed.load(Ordering::Acquire)
    }

    /// Current pty geometry.
    pub fn window_size(&self) -> Result<WindowSize, SessionError> {
        let pty = self.inner.pty.lock();
        let pty = pty.as_ref().ok_or(SessionError::Closed)?;
        pty.size().map_err(SessionError::Resize)
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Running => Ok(()),
            _ => Err(SessionError::Closed),
        }
    }
}

impl SessionHandle for PtySession {
    fn id(&self) -> SessionId {
        self.inner.id
    }

    fn write_data(&self, data: &[u8]) -> Result<(), SessionError> {
        self.ensure_running()?;
        let mut writer = self.inner.writer.lock();
        let writer = writer.as_mut().ok_or(SessionError::Closed)?;

        // The master is non-blocking; a full input queue is a short write.
        let written = match writer.write(data) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(SessionError::Write(e)),
        };
        if written != data.len() {
            return Err(SessionError::ShortWrite {
                written,
                requested: data.len(),
            });
        }
        writer.flush().map_err(SessionError::Write)
    }

    fn resize(&self, size: WindowSize) -> Result<(), SessionError> {
        self.ensure_running()?;
        let pty = self.inner.pty.lock();
        let pty = pty.as_ref().ok_or(SessionError::Closed)?;
        pty.resize(size).map_err(SessionError::Resize)?;
        tracing::debug!(session = %self.inner.id, ?size, "pty resized");
        Ok(())
    }

    fn close(&self) -> CloseErrors {
        let (errors_tx, errors_rx) = mpsc::channel(2);
        let inner = self.inner.clone();
        if inner.close_started.swap(true, Ordering::AcqRel) {
            tokio::spawn(async move {
                inner.closed.cancelled().await;
                drop(errors_tx);
            });
        } else {
            tokio::spawn(inner.teardown(errors_tx));
        }
        ReceiverStream::new(errors_rx)
    }
}

impl Inner {
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        tracing::debug!(session = %self.id, ?from, ?to, "session state changed");
        true
    }

    /// File this session's termination report, at most once.
    fn report_termination(&self) {
        if self.reported.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.reports.send(self.id).is_err() {
            tracing::debug!(session = %self.id, "termination queue closed, report dropped");
        }
    }

    async fn teardown(self: Arc<Self>, errors: mpsc::Sender<SessionError>) {
        self.transition(SessionState::Running, SessionState::Terminating);
        self.report_termination();

        self.write_notice().await;
        self.ensure_process_exited().await;

        self.cancelled.cancel();
        self.release_pty();
        let conn = self.conn.lock().await.take();
        if let Some(mut conn) = conn {
            if let Err(e) = conn.shutdown().await {
                let _ = errors.send(SessionError::Connection(e)).await;
            }
        }

        self.transition(SessionState::Terminating, SessionState::Closed);
        self.closed.cancel();
        tracing::info!(session = %self.id, "session closed");
    }

    async fn write_notice(&self) {
        let write = async {
            let mut conn = self.conn.lock().await;
            match conn.as_mut() {
                Some(conn) => conn.write_all(CLOSE_NOTICE).await,
                None => Ok(()),
            }
        };
        match tokio::time::timeout(NOTICE_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(session = %self.id, ?e, "failed to write close notice"),
            Err(_) => tracing::debug!(session = %self.id, "timed out writing close notice"),
        }
    }

    /// Make sure the child is gone: SIGHUP and SIGTERM, close the pty, then
    /// SIGKILL if it is still running once the grace period has elapsed.
    async fn ensure_process_exited(&self) {
        if self.exited.is_cancelled() {
            tracing::debug!(session = %self.id, "process already exited");
            return;
        }

        // The pty reader thread still holds a dup of the master, so dropping
        // our handle does not hang the terminal up; deliver the hangup directly.
        // Signals go first so that nothing below can delay the grace period.
        self.signal(libc::SIGHUP);
        self.signal(libc::SIGTERM);
        tracing::debug!(session = %self.id, pid = ?self.pid, "sent SIGHUP and SIGTERM");
        self.release_pty();

        let exited_in_time = tokio::time::timeout(self.grace_period, self.exited.cancelled())
            .await
            .is_ok();
        if exited_in_time || self.exited.is_cancelled() {
            return;
        }

        tracing::warn!(
            session = %self.id,
            pid = ?self.pid,
            grace_period = ?self.grace_period,
            "grace period elapsed, killing process"
        );
        self.force_killed.store(true, Ordering::Release);
        self.signal(libc::SIGKILL);

        if tokio::time::timeout(KILL_REAP_TIMEOUT, self.exited.cancelled())
            .await
            .is_err()
        {
            tracing::error!(session = %self.id, pid = ?self.pid, "process not reaped after SIGKILL");
        }
    }

    /// Drop the pty master and writer.
    ///
    /// Runs on the async runtime, so it never waits for a handle that a
    /// blocking-pool writer is using. A busy handle is left in place and goes
    /// away with the session; `write_data` already refuses new writes by then.
    fn release_pty(&self) {
        match self.writer.try_lock() {
            Some(mut writer) => drop(writer.take()),
            None => tracing::debug!(session = %self.id, "pty writer busy, leaving it to drop with the session"),
        }
        match self.pty.try_lock() {
            Some(mut pty) => drop(pty.take()),
            None => tracing::debug!(session = %self.id, "pty busy, leaving it to drop with the session"),
        }
    }

    /// Signal the child's process group.
    ///
    /// The pty child is a session leader, so the group covers anything the
    /// shell started. Skipped once the child has been reaped so a recycled
    /// PID is never hit.
    fn signal(&self, signal: libc::c_int) {
        let Some(pid) = self.pid else { return };
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return;
        }
        if self.exited.is_cancelled() {
            return;
        }
        let rc = unsafe { libc::kill(-(pid as i32), signal) };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            tracing::debug!(session = %self.id, pid, signal, ?e, "kill failed");
        }
    }
}

/// Wait for the child on the blocking pool; on exit, mark the session as
/// terminating and file its termination report.
fn spawn_exit_watcher(inner: Arc<Inner>, mut child: PtyChild) {
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            match child.wait() {
                Ok(status) => tracing::debug!(session = %inner.id, ?status, "session child exited"),
                Err(e) => tracing::error!(session = %inner.id, ?e, "error waiting for session child"),
            }
        }));
        if let Err(e) = result {
            tracing::error!("child exit watcher panicked: {:?}", e);
        }
        inner.exited.cancel();
        inner.transition(SessionState::Running, SessionState::Terminating);
        inner.report_termination();
    });
}

fn spawn_pty_reader(id: SessionId, mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Bytes>) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; PTY_READ_BUFFER];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                // EIO once the slave side is gone
                Err(e) => {
                    tracing::debug!(session = %id, ?e, "pty read ended");
                    break;
                }
            }
        }
    });
}

/// Copy pty output to the peer verbatim until either side goes away.
async fn relay_output(inner: Arc<Inner>, mut output_rx: mpsc::Receiver<Bytes>) {
    let mut copied = 0usize;
    loop {
        let data = tokio::select! {
            _ = inner.cancelled.cancelled() => break,
            data = output_rx.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        let mut conn = inner.conn.lock().await;
        let Some(writer) = conn.as_mut() else { break };
        tokio::select! {
            _ = inner.cancelled.cancelled() => break,
            result = writer.write_all(&data) => {
                if let Err(e) = result {
                    tracing::debug!(session = %inner.id, ?e, "relay write to peer failed");
                    break;
                }
            }
        }
        copied += data.len();
    }
    tracing::debug!(session = %inner.id, copied, "pty relay finished");
}
