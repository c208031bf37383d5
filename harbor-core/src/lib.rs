//! Harbor core library — framing codec, pid file, process probes.
//!
//! Leaf building blocks shared by the daemon framework and its embedders:
//! - [`framing`] — the message codec seam and the default length-prefixed
//!   wire format
//! - [`pidfile`] — exclusive pid-file acquisition and the zero-signal
//!   process-liveness probe
//! - [`error`] — [`FrameError`], [`PidFileError`]

pub mod error;
pub mod framing;
pub mod pidfile;

pub use error::{FrameError, PidFileError};
pub use framing::{Framing, LengthPrefixed, MessageDecoder, MAX_MESSAGE_SIZE};
pub use pidfile::{process_exists, PidFile};
