//! Unix socket server: accepts connections and owns the session registry.
//!
//! A dedicated acceptor task feeds new connections into the event loop. The
//! loop is the only place the registry is touched: it starts a session for
//! every connection, closes sessions whose termination report arrives and
//! unregisters them once that close has finished, and closes everything
//! still registered on shutdown.

use futures::future::BoxFuture;
use futures::StreamExt;
use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch;
use crate::registry::SessionRegistry;
use crate::session::{PtySession, SessionError, SessionHandle, SessionId};

/// Connections accepted but not yet picked up by the event loop.
const ACCEPT_QUEUE: usize = 64;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Compute the default Unix socket path for this user.
pub fn default_socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/tmp/ish-{}", whoami()));
    PathBuf::from(runtime_dir).join("ish.sock")
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Bind the daemon's listening socket.
///
/// A leftover socket file is removed unless another daemon still answers on
/// it. The parent directory is created if needed and the socket is
/// restricted to its owner.
pub async fn bind_listener(socket_path: &Path) -> io::Result<UnixListener> {
    // connect() runs on the blocking pool: a live but wedged daemon must not
    // stall the runtime.
    if socket_path.exists() {
        let path_owned = socket_path.to_path_buf();
        let is_active = tokio::time::timeout(
            Duration::from_secs(3),
            tokio::task::spawn_blocking(move || {
                std::os::unix::net::UnixStream::connect(&path_owned).is_ok()
            }),
        )
        .await;

        match is_active {
            Ok(Ok(true)) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("another daemon is already listening on {}", socket_path.display()),
                ));
            }
            _ => {
                tracing::debug!(path = %socket_path.display(), "removing stale socket");
                std::fs::remove_file(socket_path)?;
            }
        }
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %socket_path.display(), "listening");
    Ok(listener)
}

/// Starts a session for a freshly accepted connection.
///
/// The returned session is already serving its connection; the event loop
/// only has to register it. `reports` is where the session files its
/// termination report.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: SessionHandle;

    fn start(
        &self,
        id: SessionId,
        stream: UnixStream,
        reports: mpsc::UnboundedSender<SessionId>,
    ) -> BoxFuture<'static, Result<Arc<Self::Session>, SessionError>>;
}

/// Spawns the configured shell on a pty and runs a dispatcher for it.
pub struct PtySessionFactory {
    config: Arc<Config>,
}

impl PtySessionFactory {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl SessionFactory for PtySessionFactory {
    type Session = PtySession;

    fn start(
        &self,
        id: SessionId,
        stream: UnixStream,
        reports: mpsc::UnboundedSender<SessionId>,
    ) -> BoxFuture<'static, Result<Arc<PtySession>, SessionError>> {
        let config = self.config.clone();
        Box::pin(async move {
            let (session, reader) = PtySession::start(id, stream, &config, reports).await?;
            let session = Arc::new(session);
            tokio::spawn(dispatch::serve_connection(
                reader,
                session.clone(),
                session.cancellation(),
            ));
            Ok(session)
        })
    }
}

/// The daemon's event loop.
pub struct EventLoop<F: SessionFactory> {
    factory: F,
    registry: SessionRegistry<F::Session>,
    next_id: u64,
    reports_tx: mpsc::UnboundedSender<SessionId>,
    reports_rx: mpsc::UnboundedReceiver<SessionId>,
    /// Teardowns in flight. Each task yields the id of the session it closed.
    closing: JoinSet<SessionId>,
    /// Sessions with a teardown in `closing`; they stay registered until it ends.
    closing_ids: HashSet<SessionId>,
}

impl<F: SessionFactory> EventLoop<F> {
    pub fn new(factory: F) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            registry: SessionRegistry::new(),
            next_id: 1,
            reports_tx,
            reports_rx,
            closing: JoinSet::new(),
            closing_ids: HashSet::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry<F::Session> {
        &self.registry
    }

    /// Serve `listener` until `shutdown` resolves, then close every session.
    ///
    /// Returns once all sessions are closed and the registry is empty.
    pub async fn run(&mut self, listener: UnixListener, shutdown: impl Future<Output = ()>) {
        let (conn_tx, mut conn_rx) = mpsc::channel(ACCEPT_QUEUE);
        let cancel = CancellationToken::new();
        let acceptor = tokio::spawn(accept_loop(listener, conn_tx, cancel.clone()));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("shutting down");
                    break;
                }
                Some(id) = self.reports_rx.recv() => self.handle_report(id),
                Some(stream) = conn_rx.recv() => self.handle_connection(stream).await,
                Some(joined) = self.closing.join_next(), if !self.closing.is_empty() => {
                    self.finish_close(joined);
                }
            }
        }

        cancel.cancel();
        if let Err(e) = acceptor.await {
            tracing::error!(?e, "acceptor task failed");
        }
        drop(conn_rx);
        self.shutdown_all().await;
    }

    /// Start and register a session for a new connection.
    pub async fn handle_connection(&mut self, stream: UnixStream) {
        let id = SessionId(self.next_id);
        self.next_id += 1;

        match self.factory.start(id, stream, self.reports_tx.clone()).await {
            Ok(session) => {
                self.registry.add(session);
                tracing::debug!(session = %id, live = self.registry.len(), "session registered");
            }
            Err(e) => tracing::warn!(session = %id, %e, "failed to start session"),
        }
    }

    /// Handle a termination report: start closing the session.
    ///
    /// The session stays registered until that close has finished. A report
    /// for a session that is not registered, or one already closing, is
    /// ignored.
    pub fn handle_report(&mut self, id: SessionId) {
        let Some(session) = self.registry.get(id).cloned() else {
            tracing::debug!(session = %id, "termination report for unknown session");
            return;
        };
        if !self.closing_ids.insert(id) {
            tracing::debug!(session = %id, "session already closing");
            return;
        }
        self.closing.spawn(close_session(session));
    }

    /// Unregister the session whose close task just ended.
    fn finish_close(&mut self, joined: Result<SessionId, JoinError>) {
        match joined {
            Ok(id) => {
                self.closing_ids.remove(&id);
                self.registry.remove(id);
                tracing::debug!(session = %id, live = self.registry.len(), "session unregistered");
            }
            // The id is lost with the task; shutdown drains whatever is left.
            Err(e) => tracing::error!(?e, "session close task failed"),
        }
    }

    /// Wait for every close in flight and unregister those sessions.
    pub async fn wait_for_closing(&mut self) {
        while let Some(joined) = self.closing.join_next().await {
            self.finish_close(joined);
        }
    }

    /// Close every registered session and wait for all teardowns to finish.
    pub async fn shutdown_all(&mut self) {
        let ids = self.registry.ids();
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "closing sessions");
        }
        for id in ids {
            self.handle_report(id);
        }
        self.wait_for_closing().await;

        let leftover = self.registry.drain();
        if !leftover.is_empty() {
            tracing::warn!(count = leftover.len(), "sessions left after failed close tasks");
        }
        self.closing_ids.clear();
    }
}

async fn close_session<S: SessionHandle>(session: Arc<S>) -> SessionId {
    let id = session.id();
    let mut errors = session.close();
    while let Some(e) = errors.next().await {
        tracing::warn!(session = %id, %e, "error while closing session");
    }
    id
}

async fn accept_loop(
    listener: UnixListener,
    conns: mpsc::Sender<UnixStream>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("acceptor received cancel signal, stopping");
                break;
            }
            result = listener.accept() => match result {
                Ok((stream, _addr)) => {
                    if conns.send(stream).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(?e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}

/// Run the daemon on `config`'s socket until `shutdown` resolves.
///
/// The socket file is removed before returning.
pub async fn run_daemon(config: Config, shutdown: impl Future<Output = ()>) -> io::Result<()> {
    let socket_path = config.socket_path();
    let listener = bind_listener(&socket_path).await?;

    let mut event_loop = EventLoop::new(PtySessionFactory::new(config));
    event_loop.run(listener, shutdown).await;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!(?e, path = %socket_path.display(), "failed to remove socket file");
    }
    Ok(())
}
