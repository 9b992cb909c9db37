//! The protocol every server variant speaks.
//!
//! One command per receive: `cookie`, `ping` or `drop`. Anything else, an
//! empty read or a hard socket error ends the connection.

use std::io::{self, Read, Write};
use std::path::Path;

/// Bytes read per protocol step.
pub const RECV_SIZE: usize = 1024;

/// What the caller should do with the connection after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep the connection and step again when it is readable.
    Continue,
    /// Drop the connection.
    Close,
}

#[derive(Debug, Clone)]
pub struct ProtocolHandler {
    cookie: String,
}

impl ProtocolHandler {
    pub fn new(cookie: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
        }
    }

    /// Read the generation's cookie from `path`.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let cookie = std::fs::read_to_string(path)?;
        let cookie = cookie.trim();
        if cookie.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("cookie file {} is empty", path.display()),
            ));
        }
        Ok(Self::new(cookie))
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Reply for one command; `None` means drop the connection.
    pub fn reply(&self, command: &[u8]) -> Option<(&[u8], Step)> {
        match command {
            b"cookie" => Some((self.cookie.as_bytes(), Step::Continue)),
            b"ping" => Some((b"pong", Step::Continue)),
            b"drop" => Some((b"okay", Step::Close)),
            _ => None,
        }
    }

    /// Handle one command from `stream`.
    ///
    /// Interrupted and would-block reads are not failures; the caller steps
    /// again later.
    pub fn step<S: Read + Write>(&self, stream: &mut S) -> Step {
        let mut buf = [0u8; RECV_SIZE];
        let n = match stream.read(&mut buf) {
            Ok(0) => return Step::Close,
            Ok(n) => n,
            Err(e) if is_transient(&e) => return Step::Continue,
            Err(_) => return Step::Close,
        };

        let Some((reply, next)) = self.reply(&buf[..n]) else {
            return Step::Close;
        };
        match write_reply(stream, reply) {
            Ok(()) => next,
            Err(_) => Step::Close,
        }
    }

    /// Step a blocking connection until it closes.
    pub fn serve<S: Read + Write>(&self, stream: &mut S) {
        while self.step(stream) == Step::Continue {}
    }
}

fn write_reply<S: Write>(stream: &mut S, mut reply: &[u8]) -> io::Result<()> {
    while !reply.is_empty() {
        match stream.write(reply) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => reply = &reply[n..],
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(e),
        }
    }
    stream.flush()
}

pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}
