//! Blocking accept loops: a single acceptor, or a pool of them.

use std::io;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use super::worker::{Connection, InlineWorker, Member, Worker, WorkerKind};
use crate::handler::{ProtocolHandler, is_transient};
use crate::tracker::ConnectionTracker;

/// Shared state every loop needs.
#[derive(Clone)]
pub struct LoopContext {
    pub listener: Arc<TcpListener>,
    pub handler: Arc<ProtocolHandler>,
    pub tracker: Arc<ConnectionTracker>,
    pub closing: Arc<AtomicBool>,
    /// Set in forked members, which must not log.
    pub quiet: bool,
}

impl LoopContext {
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// Errors after which `accept` is worth retrying.
fn is_retryable(e: &io::Error) -> bool {
    is_transient(e) || e.kind() == io::ErrorKind::ConnectionAborted
}

/// Accept until the server closes, handing each connection to `worker`.
pub fn accept_loop(ctx: &LoopContext, worker: &dyn Worker) -> io::Result<()> {
    loop {
        match ctx.listener.accept() {
            Ok((stream, peer)) => {
                if ctx.is_closing() {
                    return Ok(());
                }
                if !ctx.quiet {
                    tracing::debug!(%peer, "Accepted connection");
                }
                let guard = ctx.tracker.acquire();
                worker.handoff(Connection { stream, guard }, &ctx.handler);
            }
            Err(_) if ctx.is_closing() => return Ok(()),
            Err(e) if is_retryable(&e) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Run a pool of `size` acceptors: `size - 1` members created by `worker`
/// plus the calling thread. Members are recorded in `members` before the
/// caller starts accepting.
pub fn pool_loop(
    ctx: &LoopContext,
    worker: &dyn Worker,
    size: usize,
    members: &Mutex<Vec<Member>>,
) -> io::Result<()> {
    {
        let mut members = members.lock().unwrap_or_else(|p| p.into_inner());
        for index in 1..size.max(1) {
            let mut member_ctx = ctx.clone();
            if worker.kind() == WorkerKind::Process {
                // Counted per process; the parent's lock may be held at fork.
                member_ctx.tracker = ConnectionTracker::new();
                member_ctx.quiet = true;
            }
            let body = Box::new(move || {
                let _ = accept_loop(&member_ctx, &InlineWorker);
            });
            let member = worker.spawn_member(format!("pool-{index}"), body)?;
            members.push(member);
        }
        tracing::info!(size, members = ?*members, "Pool started");
    }
    accept_loop(ctx, &InlineWorker)
}
