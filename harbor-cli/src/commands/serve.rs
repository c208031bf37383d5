//! `harbor serve` — the echo daemon.
//!
//! A minimal embedder of the framework: every inbound message is written
//! back verbatim, lifecycle edges are logged. Useful as a smoke-test target
//! and as the daemon the end-to-end tests drive.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Args;
use harbor_daemon::{Daemon, DaemonError, DaemonHooks, SessionHandle, SocketHandler};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to serve (repeatable).
    #[arg(long = "socket", required = true)]
    sockets: Vec<PathBuf>,

    /// Acquire an exclusive pid file before serving.
    #[arg(long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Exit when this process disappears.
    #[arg(long = "watch-pid")]
    watch_pid: Option<i32>,

    /// Log filter directives (tracing EnvFilter syntax).
    #[arg(long = "log")]
    log: Option<String>,
}

struct EchoHooks;

impl DaemonHooks for EchoHooks {
    fn startup(&mut self) {
        tracing::info!("echo daemon ready");
    }

    fn reconfigure(&mut self) {
        tracing::info!("reconfigure requested, nothing to reload");
    }

    fn shutdown(&mut self) {
        tracing::info!("echo daemon stopped");
    }
}

struct EchoHandler;

#[async_trait]
impl SocketHandler for EchoHandler {
    fn on_disconnect(&self, session: &SessionHandle) {
        tracing::debug!(session = session.id(), "client gone");
    }

    async fn on_message(&self, session: &SessionHandle, message: Vec<u8>) -> anyhow::Result<()> {
        session.write(&message).await?;
        Ok(())
    }
}

impl ServeArgs {
    pub fn run(self) -> ExitCode {
        match self.serve() {
            // An operator-requested stop is a clean exit.
            Ok(()) | Err(DaemonError::Interrupted) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("harbor serve failed: {err}");
                ExitCode::FAILURE
            }
        }
    }

    fn serve(self) -> Result<(), DaemonError> {
        let mut daemon = Daemon::setup(
            "harbor-echo",
            self.log.as_deref(),
            self.pid_file.as_deref(),
            EchoHooks,
        )?;

        let handler = Arc::new(EchoHandler);
        for path in &self.sockets {
            daemon.add_unix(path, handler.clone())?;
        }

        daemon.start_blocking(self.watch_pid)
    }
}
