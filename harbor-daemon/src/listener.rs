//! Listening sockets and their accept loops.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use harbor_core::framing::Framing;
use tokio::task::JoinHandle;

use crate::error::{io_err, DaemonError};
use crate::handler::SocketHandler;
use crate::session::{self, SessionContext, SessionRegistry};

/// `sun_path` is 104 bytes on macOS and 108 on Linux; enforce the
/// conservative limit so configurations stay portable.
pub(crate) const MAX_SOCKET_PATH: usize = 104;

/// A bound, not-yet-accepting Unix socket.
pub(crate) struct SocketListener {
    path: PathBuf,
    handler: Arc<dyn SocketHandler>,
    framing: Arc<dyn Framing>,
    listener: StdUnixListener,
}

impl std::fmt::Debug for SocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketListener")
            .field("path", &self.path)
            .finish()
    }
}

impl SocketListener {
    /// Validate the path, optionally unlink a stale socket, then bind and
    /// start listening (non-blocking, owner-only permissions).
    pub(crate) fn bind(
        path: PathBuf,
        handler: Arc<dyn SocketHandler>,
        framing: Arc<dyn Framing>,
        remove_before_use: bool,
    ) -> Result<Self, DaemonError> {
        let len = path.as_os_str().len();
        if len >= MAX_SOCKET_PATH {
            return Err(DaemonError::SocketPathTooLong {
                path,
                len,
                max: MAX_SOCKET_PATH - 1,
            });
        }

        if remove_before_use {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_err(&path, err)),
            }
        }

        let listener = StdUnixListener::bind(&path).map_err(|e| io_err(&path, e))?;
        listener.set_nonblocking(true).map_err(|e| io_err(&path, e))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .map_err(|e| io_err(&path, e))?;

        Ok(Self {
            path,
            handler,
            framing,
            listener,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Hand the socket to the runtime and spawn the accept loop. The
    /// returned value tears the listener down (sessions included) when
    /// dropped.
    pub(crate) fn start(self) -> Result<RunningListener, DaemonError> {
        let listener =
            tokio::net::UnixListener::from_std(self.listener).map_err(|e| io_err(&self.path, e))?;
        let path = Arc::new(self.path);
        let registry = Arc::new(SessionRegistry::new());

        let accept_task = tokio::spawn(accept_loop(
            listener,
            path.clone(),
            self.handler.clone(),
            self.framing,
            registry.clone(),
        ));

        Ok(RunningListener {
            path,
            handler: self.handler,
            registry,
            accept_task,
        })
    }
}

/// A listener whose accept loop is live.
pub(crate) struct RunningListener {
    path: Arc<PathBuf>,
    handler: Arc<dyn SocketHandler>,
    registry: Arc<SessionRegistry>,
    accept_task: JoinHandle<()>,
}

impl Drop for RunningListener {
    // Teardown order: stop accepting, destroy live sessions, unlink the
    // path. Runs both on graceful shutdown and when the run future is
    // cancelled.
    fn drop(&mut self) {
        self.accept_task.abort();
        self.registry.teardown(&self.handler);
        match fs::remove_file(self.path.as_ref()) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "socket removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                path = %self.path.display(),
                error = %err,
                "failed to remove socket",
            ),
        }
    }
}

async fn accept_loop(
    listener: tokio::net::UnixListener,
    path: Arc<PathBuf>,
    handler: Arc<dyn SocketHandler>,
    framing: Arc<dyn Framing>,
    registry: Arc<SessionRegistry>,
) {
    let mut next_id: u64 = 0;

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                next_id += 1;
                session::spawn(
                    SessionContext {
                        id: next_id,
                        socket_path: path.clone(),
                        handler: handler.clone(),
                        framing: framing.clone(),
                        registry: registry.clone(),
                    },
                    stream,
                );
            }
            // Every accept error is an errno-level, per-connection event:
            // log it and keep accepting.
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "accept failed, continuing");
                if is_fd_exhaustion(&err) {
                    // Back off so a run of EMFILEs cannot spin the loop.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE | libc::ENFILE))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
