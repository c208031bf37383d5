//! Framework for daemons serving framed messages over Unix-domain sockets.
//!
//! A [`Daemon`] owns a set of listening sockets. Each accepted connection
//! becomes a session whose inbound messages are dispatched, in order, to the
//! socket's [`SocketHandler`]; lifecycle edges (startup, SIGHUP/SIGUSR1
//! reconfigure, shutdown) are reported to the embedder's [`DaemonHooks`].
//! The daemon runs until SIGINT/SIGTERM or the disappearance of an
//! optionally watched process, then tears everything down — sessions,
//! sockets, pid file — before returning.
//!
//! `setup` ignores SIGPIPE process-wide: a write to a half-closed peer must
//! come back as an error, not a signal.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use harbor_daemon::{Daemon, DaemonError, SessionHandle, SocketHandler};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl SocketHandler for Echo {
//!     async fn on_message(
//!         &self,
//!         session: &SessionHandle,
//!         message: Vec<u8>,
//!     ) -> anyhow::Result<()> {
//!         session.write(&message).await?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), DaemonError> {
//!     let mut daemon = Daemon::setup("echo", None, None, ())?;
//!     daemon.add_unix("/run/echo.sock", Arc::new(Echo))?;
//!     daemon.start_blocking(None)
//! }
//! ```

mod error;
mod handler;
mod listener;
mod runtime;
mod session;

pub use error::DaemonError;
pub use handler::{DaemonHooks, SocketHandler};
pub use runtime::Daemon;
pub use session::{SessionError, SessionHandle};
