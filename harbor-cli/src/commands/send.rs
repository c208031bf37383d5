//! `harbor send` — one-shot framed client.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use harbor_core::framing::{Framing, LengthPrefixed};

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Daemon socket to connect to.
    #[arg(long = "socket")]
    socket: PathBuf,

    /// Message payload, sent verbatim.
    message: String,

    /// Send only; do not wait for a reply.
    #[arg(long = "no-reply")]
    no_reply: bool,

    /// Seconds to wait for the reply.
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

impl SendArgs {
    pub fn run(self) -> Result<()> {
        let mut stream = UnixStream::connect(&self.socket)
            .with_context(|| format!("failed to connect to {}", self.socket.display()))?;
        stream
            .set_read_timeout(Some(Duration::from_secs(self.timeout)))
            .context("failed to set read timeout")?;

        let frame = LengthPrefixed.encode(self.message.as_bytes())?;
        stream.write_all(&frame).context("failed to send message")?;

        if self.no_reply {
            return Ok(());
        }

        let reply = read_reply(&mut stream)?;
        println!("{}", String::from_utf8_lossy(&reply));
        Ok(())
    }
}

/// Read until the first complete framed message arrives.
fn read_reply(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut decoder = LengthPrefixed.decoder();
    let mut buf = [0u8; 4096];

    loop {
        let n = stream.read(&mut buf).context("failed to read reply")?;
        if n == 0 {
            bail!("daemon closed connection before responding");
        }
        let mut messages = decoder.feed(&buf[..n])?;
        if !messages.is_empty() {
            return Ok(messages.remove(0));
        }
    }
}
