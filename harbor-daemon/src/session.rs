//! Per-connection sessions.
//!
//! Each accepted connection gets a read task (stream bytes → decoder →
//! handler, one message at a time) and a write task (acknowledged outbound
//! frames). The [`SessionHandle`] is the cloneable face the application
//! sees. Session destruction — peer disconnect, handler failure, or
//! listener teardown — is idempotent: the registry slot is removed once and
//! `on_disconnect` fires exactly once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use harbor_core::framing::{Framing, MessageDecoder};
use harbor_core::FrameError;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::handler::SocketHandler;

/// Errors reported by [`SessionHandle::write`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// The payload cannot be framed.
    #[error(transparent)]
    Encode(#[from] FrameError),

    /// The transport write failed. After the first failure every subsequent
    /// write reports the original error without touching the socket.
    #[error("session write failed: {0}")]
    Write(String),

    /// The session has been destroyed.
    #[error("session is closed")]
    Closed,
}

/// Handle to one live session, given to every [`SocketHandler`] callback.
///
/// Cloning is cheap; clones stay valid until the session is destroyed, after
/// which [`write`](SessionHandle::write) reports [`SessionError::Closed`].
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    framing: Arc<dyn Framing>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Identifier of this session, unique within its listener.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send one message to the peer.
    ///
    /// Resolves once the frame has been written to the socket. Reports the
    /// first write error the session encountered, or
    /// [`SessionError::Closed`] if the session is gone.
    pub async fn write(&self, payload: &[u8]) -> Result<(), SessionError> {
        let frame = self.framing.encode(payload)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                frame,
                ack: ack_tx,
            })
            .map_err(|_| SessionError::Closed)?;
        ack_rx.await.map_err(|_| SessionError::Closed)?
    }
}

struct Outbound {
    frame: Vec<u8>,
    ack: oneshot::Sender<Result<(), SessionError>>,
}

pub(crate) struct SessionEntry {
    handle: SessionHandle,
    disconnected: Arc<AtomicBool>,
    read_abort: AbortHandle,
    write_abort: AbortHandle,
}

/// Live sessions of one listener, keyed by session id.
pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<u64, SessionEntry>>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    // The table must stay usable during teardown even if a handler panicked
    // while holding the lock.
    fn table(&self) -> MutexGuard<'_, HashMap<u64, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Destroy every live session: stop its tasks, fire `on_disconnect` for
    /// any session that has not already observed its own end.
    pub(crate) fn teardown(&self, handler: &Arc<dyn SocketHandler>) {
        let entries: Vec<SessionEntry> = {
            let mut table = self.table();
            table.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.read_abort.abort();
            entry.write_abort.abort();
            if !entry.disconnected.swap(true, Ordering::SeqCst) {
                handler.on_disconnect(&entry.handle);
            }
        }
    }
}

/// Everything the per-session context holds before the tasks exist.
pub(crate) struct SessionContext {
    pub(crate) id: u64,
    pub(crate) socket_path: Arc<PathBuf>,
    pub(crate) handler: Arc<dyn SocketHandler>,
    pub(crate) framing: Arc<dyn Framing>,
    pub(crate) registry: Arc<SessionRegistry>,
}

/// Install a session for an accepted connection.
///
/// Consults `on_connect` first; a rejected connection is dropped on the spot
/// (fd closed, nothing registered, no error). Otherwise the session is
/// registered and its read/write tasks spawned.
pub(crate) fn spawn(ctx: SessionContext, stream: UnixStream) {
    let SessionContext {
        id,
        socket_path,
        handler,
        framing,
        registry,
    } = ctx;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        id,
        framing: framing.clone(),
        outbound: outbound_tx,
    };

    if !handler.on_connect(&handle) {
        tracing::debug!(
            path = %socket_path.display(),
            session = id,
            "connection rejected by on_connect",
        );
        return;
    }

    let decoder = framing.decoder();
    let (read_half, write_half) = stream.into_split();
    let disconnected = Arc::new(AtomicBool::new(false));

    let shared = Arc::new(SessionShared {
        id,
        socket_path,
        handler,
        handle: handle.clone(),
        registry: registry.clone(),
        disconnected: disconnected.clone(),
    });

    // Insert under the same lock the destroy path takes, so a session whose
    // peer vanishes immediately still finds its registry slot.
    let mut table = registry.table();
    let write_task = tokio::spawn(write_loop(write_half, outbound_rx));
    let read_task = tokio::spawn(read_loop(shared, read_half, decoder));
    table.insert(
        id,
        SessionEntry {
            handle,
            disconnected,
            read_abort: read_task.abort_handle(),
            write_abort: write_task.abort_handle(),
        },
    );
}

struct SessionShared {
    id: u64,
    socket_path: Arc<PathBuf>,
    handler: Arc<dyn SocketHandler>,
    handle: SessionHandle,
    registry: Arc<SessionRegistry>,
    disconnected: Arc<AtomicBool>,
}

impl SessionShared {
    /// Idempotent destroy: `on_disconnect` at most once, then detach the
    /// registry slot and stop the write task.
    fn destroy(&self) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            self.handler.on_disconnect(&self.handle);
        }
        if let Some(entry) = self.registry.table().remove(&self.id) {
            entry.write_abort.abort();
        }
    }
}

enum ReadEnd {
    PeerClosed,
    ReadError(std::io::Error),
    Frame(FrameError),
    Handler(anyhow::Error),
}

async fn read_loop(
    shared: Arc<SessionShared>,
    mut reader: OwnedReadHalf,
    mut decoder: Box<dyn MessageDecoder>,
) {
    let mut buf = [0u8; 64 * 1024];

    let end = 'read: loop {
        match reader.read(&mut buf).await {
            Ok(0) => break 'read ReadEnd::PeerClosed,
            Ok(n) => {
                let messages = match decoder.feed(&buf[..n]) {
                    Ok(messages) => messages,
                    Err(err) => break 'read ReadEnd::Frame(err),
                };
                for message in messages {
                    // Awaiting here is what serializes delivery: the next
                    // message is not read until this one is handled.
                    if let Err(err) = shared.handler.on_message(&shared.handle, message).await {
                        break 'read ReadEnd::Handler(err);
                    }
                }
            }
            Err(err) => break 'read ReadEnd::ReadError(err),
        }
    };

    let path = shared.socket_path.display();
    match &end {
        ReadEnd::PeerClosed => {
            tracing::debug!(path = %path, session = shared.id, "peer disconnected");
        }
        ReadEnd::ReadError(err) => {
            tracing::debug!(path = %path, session = shared.id, error = %err, "session read failed");
        }
        ReadEnd::Frame(err) => {
            tracing::warn!(path = %path, session = shared.id, error = %err, "closing session on framing error");
        }
        ReadEnd::Handler(err) => {
            tracing::error!(path = %path, session = shared.id, error = %err, "message handler failed");
        }
    }

    shared.destroy();
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    let mut latched: Option<String> = None;

    while let Some(Outbound { frame, ack }) = outbound.recv().await {
        if let Some(message) = &latched {
            let _ = ack.send(Err(SessionError::Write(message.clone())));
            continue;
        }
        match writer.write_all(&frame).await {
            Ok(()) => {
                let _ = ack.send(Ok(()));
            }
            Err(err) => {
                let message = err.to_string();
                let _ = ack.send(Err(SessionError::Write(message.clone())));
                latched = Some(message);
            }
        }
    }
}
