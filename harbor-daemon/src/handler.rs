//! Application surface: lifecycle hooks and per-socket message handlers.

use async_trait::async_trait;

use crate::session::SessionHandle;

/// Lifecycle callbacks for a daemon embedder.
///
/// All methods default to no-ops; implement the ones you care about on your
/// daemon's state type. `()` implements this for hook-less daemons.
pub trait DaemonHooks: Send + 'static {
    /// Invoked once, on the event loop, after every listener has started.
    fn startup(&mut self) {}

    /// Invoked on SIGHUP or SIGUSR1. The daemon keeps running.
    fn reconfigure(&mut self) {}

    /// Invoked during shutdown, after all listeners and sessions are gone
    /// and before the pid file is released.
    fn shutdown(&mut self) {}
}

impl DaemonHooks for () {}

/// Per-connection callbacks for one listening socket.
///
/// One handler instance serves every connection accepted on its socket, so
/// per-connection state belongs in the handler keyed by
/// [`SessionHandle::id`], or in whatever the messages themselves carry.
#[async_trait]
pub trait SocketHandler: Send + Sync + 'static {
    /// Invoked synchronously for each accepted connection, before it is
    /// installed. Return `false` to reject: the connection is closed
    /// immediately, no messages are read, and `on_disconnect` does not fire.
    fn on_connect(&self, session: &SessionHandle) -> bool {
        let _ = session;
        true
    }

    /// Invoked exactly once when a session that passed [`on_connect`] goes
    /// away — peer disconnect, handler failure, or daemon shutdown.
    ///
    /// [`on_connect`]: SocketHandler::on_connect
    fn on_disconnect(&self, session: &SessionHandle) {
        let _ = session;
    }

    /// Invoked once per complete inbound message, in arrival order. The next
    /// message of the same session is not delivered until the returned
    /// future resolves. An `Err` destroys the session.
    async fn on_message(&self, session: &SessionHandle, message: Vec<u8>) -> anyhow::Result<()>;
}
