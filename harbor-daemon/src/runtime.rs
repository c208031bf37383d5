//! Daemon controller: setup, listener registration, run lifecycle.

use std::future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use harbor_core::framing::{Framing, LengthPrefixed};
use harbor_core::pidfile::{process_exists, PidFile};
use harbor_core::PidFileError;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::error::{io_err, DaemonError};
use crate::handler::{DaemonHooks, SocketHandler};
use crate::listener::{RunningListener, SocketListener};

/// The daemon controller.
///
/// Owns the lifecycle hooks, the optional pid file, and the registered
/// listeners. Built with [`setup`](Daemon::setup), populated with
/// [`add_unix`](Daemon::add_unix), consumed by [`run`](Daemon::run).
#[derive(Debug)]
pub struct Daemon<H: DaemonHooks> {
    name: String,
    hooks: H,
    pidfile: Option<PidFile>,
    listeners: Vec<SocketListener>,
}

impl<H: DaemonHooks> Daemon<H> {
    /// Initialize logging, ignore SIGPIPE process-wide, and optionally
    /// acquire an exclusive pid file.
    ///
    /// `log_filter` is a tracing `EnvFilter` directive string; when absent
    /// the `RUST_LOG` environment applies, falling back to `info`.
    ///
    /// # Errors
    ///
    /// [`DaemonError::AlreadyRunning`] when the pid file is held by another
    /// process.
    pub fn setup(
        name: impl Into<String>,
        log_filter: Option<&str>,
        pidfile: Option<&Path>,
        hooks: H,
    ) -> Result<Self, DaemonError> {
        init_tracing(log_filter);
        ignore_sigpipe();

        let pidfile = match pidfile {
            Some(path) => Some(PidFile::acquire(path).map_err(|err| match err {
                PidFileError::AlreadyLocked { path, holder } => {
                    DaemonError::AlreadyRunning { path, holder }
                }
                PidFileError::Io { path, source } => DaemonError::Io { path, source },
            })?),
            None => None,
        };

        Ok(Self {
            name: name.into(),
            hooks,
            pidfile,
            listeners: Vec::new(),
        })
    }

    /// Register a listener on `path` with the default length-prefixed
    /// framing. The socket is created and bound immediately; accepting
    /// starts in [`run`](Daemon::run).
    pub fn add_unix(
        &mut self,
        path: impl Into<PathBuf>,
        handler: Arc<dyn SocketHandler>,
    ) -> Result<(), DaemonError> {
        self.add_unix_with_framing(path, handler, Arc::new(LengthPrefixed))
    }

    /// [`add_unix`](Daemon::add_unix) with a custom wire format.
    pub fn add_unix_with_framing(
        &mut self,
        path: impl Into<PathBuf>,
        handler: Arc<dyn SocketHandler>,
        framing: Arc<dyn Framing>,
    ) -> Result<(), DaemonError> {
        // With an exclusive pid file held, any socket left at the path is
        // stale and ours to replace.
        let remove_before_use = self.pidfile.is_some();
        let listener = SocketListener::bind(path.into(), handler, framing, remove_before_use)?;
        tracing::info!(path = %listener.path().display(), "listening on unix socket");
        self.listeners.push(listener);
        Ok(())
    }

    /// Run the daemon until a fatal signal or the disappearance of
    /// `pid_watch`.
    ///
    /// Starts every registered listener, installs SIGHUP/SIGUSR1 (→
    /// [`DaemonHooks::reconfigure`]) and SIGINT/SIGTERM (→ shutdown)
    /// handlers, invokes [`DaemonHooks::startup`], and, when `pid_watch`
    /// names a process, probes it after 1 second and every 5 seconds
    /// thereafter.
    ///
    /// Always returns an error describing why the daemon stopped
    /// ([`DaemonError::Interrupted`] for an operator-requested stop); the
    /// shutdown sequence — listeners and sessions destroyed, socket paths
    /// unlinked, [`DaemonHooks::shutdown`] invoked, pid file released — has
    /// completed by the time it returns. Cancelling the returned future
    /// tears the listeners and sessions down as well, without running the
    /// shutdown hook.
    pub async fn run(mut self, pid_watch: Option<i32>) -> Result<(), DaemonError> {
        let mut sighup = unix_signal(SignalKind::hangup(), "SIGHUP")?;
        let mut sigusr1 = unix_signal(SignalKind::user_defined1(), "SIGUSR1")?;
        let mut sigint = unix_signal(SignalKind::interrupt(), "SIGINT")?;
        let mut sigterm = unix_signal(SignalKind::terminate(), "SIGTERM")?;

        let mut running: Vec<RunningListener> = Vec::with_capacity(self.listeners.len());
        for listener in self.listeners.drain(..) {
            running.push(listener.start()?);
        }

        tracing::info!(daemon = %self.name, pid = std::process::id(), "daemon started");
        self.hooks.startup();

        let watch_pid = pid_watch.filter(|&pid| pid > 1);
        let mut watch_timer = watch_pid.map(|_| watch_interval());

        let cause = loop {
            tokio::select! {
                _ = sighup.recv() => {
                    tracing::info!("received SIGHUP, reconfiguring");
                    self.hooks.reconfigure();
                }
                _ = sigusr1.recv() => {
                    tracing::info!("received SIGUSR1, reconfiguring");
                    self.hooks.reconfigure();
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, shutting down");
                    break DaemonError::Interrupted;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break DaemonError::Interrupted;
                }
                _ = watch_tick(&mut watch_timer) => {
                    if let Some(pid) = watch_pid {
                        match process_exists(pid) {
                            Ok(true) => {}
                            Ok(false) => {
                                tracing::error!(pid, "watched process gone, exiting");
                                break DaemonError::WatchedPidGone { pid };
                            }
                            Err(err) => {
                                tracing::error!(pid, error = %err, "failed to probe watched process");
                            }
                        }
                    }
                }
            }
        };

        self.shutdown(running);
        Err(cause)
    }

    /// Build a current-thread runtime and block on [`run`](Daemon::run).
    pub fn start_blocking(self, pid_watch: Option<i32>) -> Result<(), DaemonError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| io_err("tokio-runtime", e))?;
        runtime.block_on(self.run(pid_watch))
    }

    // The single shutdown path. `run` breaks out of its loop exactly once,
    // and the listener vector was drained when they started, so this cannot
    // tear down twice.
    fn shutdown(&mut self, running: Vec<RunningListener>) {
        tracing::info!(daemon = %self.name, "shutting down");
        // Each listener destroys its sessions and unlinks its socket path.
        drop(running);
        self.hooks.shutdown();
        // Releases the lock and removes the file.
        self.pidfile.take();
    }
}

impl<H: DaemonHooks> Drop for Daemon<H> {
    fn drop(&mut self) {
        // Listeners that were bound but never started still own a path on
        // disk.
        for listener in &self.listeners {
            let _ = std::fs::remove_file(listener.path());
        }
    }
}

fn watch_interval() -> Interval {
    let mut timer = interval_at(
        Instant::now() + Duration::from_secs(1),
        Duration::from_secs(5),
    );
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

async fn watch_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => future::pending().await,
    }
}

fn unix_signal(kind: SignalKind, name: &'static str) -> Result<Signal, DaemonError> {
    signal(kind).map_err(|e| io_err(name, e))
}

fn init_tracing(filter: Option<&str>) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

// Writes to a peer that already closed must surface as EPIPE on the write
// path, not kill the process.
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
