//! Exclusive pid file and process-liveness probe.
//!
//! A [`PidFile`] is an `flock`-held file containing the owner's pid. The
//! lock lives as long as the value; dropping it releases the lock and
//! unlinks the file. Because the lock (not the file's existence) is the
//! source of truth, a pid file left behind by a crashed process does not
//! block the next start.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::PidFileError;

/// An exclusively locked pid file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    // Held open for the lifetime of the value; closing the fd releases the
    // flock.
    _file: File,
}

impl PidFile {
    /// Open (or create) `path`, take a non-blocking exclusive lock, and write
    /// the current pid into it.
    ///
    /// # Errors
    ///
    /// [`PidFileError::AlreadyLocked`] if another process holds the lock,
    /// [`PidFileError::Io`] on any filesystem failure.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                let holder = read_holder(&mut file);
                return Err(PidFileError::AlreadyLocked { path, holder });
            }
            return Err(io_err(&path, err));
        }

        let pid = std::process::id();
        file.set_len(0).map_err(|e| io_err(&path, e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| io_err(&path, e))?;
        write!(file, "{pid}").map_err(|e| io_err(&path, e))?;
        file.flush().map_err(|e| io_err(&path, e))?;

        tracing::debug!(path = %path.display(), pid, "pid file acquired");

        Ok(Self { path, _file: file })
    }

    /// Path of the locked file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to remove pid file",
                );
            }
        }
    }
}

/// Best-effort read of the pid recorded by the current lock holder.
fn read_holder(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn io_err(path: &Path, source: io::Error) -> PidFileError {
    PidFileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Zero-signal `kill` probe: does `pid` name a live process?
///
/// `EPERM` counts as alive (the process exists, we just may not signal it).
/// Any other errno is an error.
pub fn process_exists(pid: i32) -> io::Result<bool> {
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        Some(libc::EPERM) => Ok(true),
        _ => Err(err),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
