use std::path::PathBuf;

use thiserror::Error;

/// Error surface for daemon setup, listeners, and the run lifecycle.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    SocketPathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    #[error("daemon already running (pid file {path} is locked)")]
    AlreadyRunning {
        path: PathBuf,
        /// Pid recorded by the lock holder, when readable.
        holder: Option<u32>,
    },

    #[error("interrupted by termination signal")]
    Interrupted,

    #[error("watched process {pid} has exited")]
    WatchedPidGone { pid: i32 },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
