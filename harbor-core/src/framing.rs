//! Message framing for stream sockets.
//!
//! The daemon framework is payload-agnostic: it moves whole messages, not
//! bytes. [`Framing`] is the seam where a wire format plugs in, and
//! [`LengthPrefixed`] is the default implementation:
//!
//! ```text
//! [u32 LE payload length] [payload: length bytes]
//! ```
//!
//! Zero-length payloads are legal (an empty message). Payloads above
//! [`MAX_MESSAGE_SIZE`] are rejected on both the encode and decode side.

use crate::error::FrameError;

/// Maximum message payload size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A wire format for messages on a stream socket.
///
/// Implementations must be cheap to share; one instance serves every
/// connection of a listener.
pub trait Framing: Send + Sync {
    /// Encode one payload into its on-wire representation.
    fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, FrameError>;

    /// Create a fresh decoder for one connection's inbound byte stream.
    fn decoder(&self) -> Box<dyn MessageDecoder>;
}

/// Incremental decoder for one connection.
///
/// Feed stream bytes as they arrive; complete messages come back in order,
/// partial data is buffered for the next call. An error is terminal for the
/// connection.
pub trait MessageDecoder: Send {
    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, FrameError>;
}

/// The default `[u32 LE length][payload]` wire format.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixed;

impl Framing for LengthPrefixed {
    fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(FrameError::Oversize {
                len: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    fn decoder(&self) -> Box<dyn MessageDecoder> {
        Box::new(LengthPrefixedDecoder::new())
    }
}

/// Stream reassembler for [`LengthPrefixed`] frames.
#[derive(Debug, Default)]
pub struct LengthPrefixedDecoder {
    buf: Vec<u8>,
}

impl LengthPrefixedDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// True if the decoder holds bytes of an incomplete message.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl MessageDecoder for LengthPrefixedDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }

            let len =
                u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if len > MAX_MESSAGE_SIZE {
                return Err(FrameError::Oversize {
                    len,
                    max: MAX_MESSAGE_SIZE,
                });
            }

            let total = 4 + len;
            if self.buf.len() < total {
                break;
            }

            messages.push(self.buf[4..total].to_vec());
            self.buf.drain(..total);
        }

        Ok(messages)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
