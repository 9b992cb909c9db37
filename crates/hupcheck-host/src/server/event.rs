//! Readiness loop: one thread multiplexing the listener and every open
//! connection with `poll`. Each readiness event runs one protocol step.

use std::io;
use std::net::TcpStream;
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use super::accept::LoopContext;
use crate::handler::{Step, is_transient};
use crate::tracker::ConnectionGuard;

/// How long one `poll` waits before rechecking the closing flag.
const POLL_INTERVAL_MS: u16 = 100;

struct Open {
    stream: TcpStream,
    _guard: ConnectionGuard,
}

pub fn event_loop(ctx: &LoopContext) -> io::Result<()> {
    ctx.listener.set_nonblocking(true)?;
    let mut open: Vec<Open> = Vec::new();

    loop {
        if ctx.is_closing() {
            tracing::debug!(open = open.len(), "Event loop closing");
            return Ok(());
        }

        let ready = match readiness(ctx, &open) {
            Ok(ready) => ready,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        };

        // ready[0] is the listener; ready[i + 1] is open[i].
        let mut index = 0;
        open.retain_mut(|conn| {
            index += 1;
            !ready[index] || ctx.handler.step(&mut conn.stream) == Step::Continue
        });

        if ready[0] && !accept_ready(ctx, &mut open)? {
            return Ok(());
        }
    }
}

/// Poll once and report which descriptors have events.
fn readiness(ctx: &LoopContext, open: &[Open]) -> Result<Vec<bool>, Errno> {
    let mut fds = Vec::with_capacity(open.len() + 1);
    fds.push(PollFd::new(ctx.listener.as_fd(), PollFlags::POLLIN));
    fds.extend(
        open.iter()
            .map(|conn| PollFd::new(conn.stream.as_fd(), PollFlags::POLLIN)),
    );

    poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS))?;
    Ok(fds
        .iter()
        .map(|fd| fd.revents().is_some_and(|events| !events.is_empty()))
        .collect())
}

/// Accept every pending connection. Returns false once the server is
/// closing and the listener has been shut down.
fn accept_ready(ctx: &LoopContext, open: &mut Vec<Open>) -> io::Result<bool> {
    loop {
        match ctx.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                tracing::debug!(%peer, "Accepted connection");
                open.push(Open {
                    stream,
                    _guard: ctx.tracker.acquire(),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
            Err(_) if ctx.is_closing() => return Ok(false),
            Err(e) if is_transient(&e) || e.kind() == io::ErrorKind::ConnectionAborted => {
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}
