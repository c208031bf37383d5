//! Error types for harbor-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the framing codec. Any of these is terminal for the
/// connection that produced it.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A message (inbound or outbound) exceeds the codec's size limit.
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    Oversize { len: usize, max: usize },
}

/// Errors from pid-file acquisition.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Underlying I/O failure while opening, locking, or writing the file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is flock-held by another process. `holder` is the pid read
    /// from the file, when it was readable.
    #[error("pid file {path} is locked by another process")]
    AlreadyLocked {
        path: PathBuf,
        holder: Option<u32>,
    },
}
