//! Worker policies: who serves an accepted connection, and how pool
//! members are created.
//!
//! Forked children detach from the bridge and never log; the tracing
//! subscriber's locks may be held by a parent thread at fork time.

use std::fmt;
use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, fork};

use crate::fd_redirect;
use crate::handler::ProtocolHandler;
use crate::tracker::ConnectionGuard;

/// An accepted connection together with its slot in the connection count.
pub struct Connection {
    pub stream: TcpStream,
    pub guard: ConnectionGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Serve on the accepting thread.
    Inline,
    Thread,
    Process,
}

/// A running pool member.
pub enum Member {
    Thread(JoinHandle<()>),
    Process(Pid),
}

impl Member {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Thread(_) => None,
            Self::Process(pid) => u32::try_from(pid.as_raw()).ok(),
        }
    }

    /// Stop the member. Threads are detached; they leave their accept loop
    /// once the listener is shut down.
    pub fn stop(self) {
        match self {
            Self::Thread(handle) => drop(handle),
            Self::Process(pid) => {
                if let Err(e) = kill(pid, Signal::SIGTERM) {
                    tracing::debug!(%pid, error = %e, "Pool member already gone");
                }
                if let Err(e) = waitpid(pid, None) {
                    tracing::warn!(%pid, error = %e, "Failed to reap pool member");
                }
            }
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread(handle) => write!(f, "Thread({:?})", handle.thread().id()),
            Self::Process(pid) => write!(f, "Process({pid})"),
        }
    }
}

pub type MemberBody = Box<dyn FnOnce() + Send + 'static>;

pub trait Worker: Send + Sync {
    fn kind(&self) -> WorkerKind;

    /// Take ownership of an accepted connection and serve it to completion.
    fn handoff(&self, conn: Connection, handler: &Arc<ProtocolHandler>);

    /// Start a pool member running `body`.
    fn spawn_member(&self, name: String, body: MemberBody) -> io::Result<Member> {
        let handle = std::thread::Builder::new().name(name).spawn(body)?;
        Ok(Member::Thread(handle))
    }
}

pub fn worker(kind: WorkerKind) -> Box<dyn Worker> {
    match kind {
        WorkerKind::Inline => Box::new(InlineWorker),
        WorkerKind::Thread => Box::new(ThreadWorker),
        WorkerKind::Process => Box::new(ProcessWorker),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InlineWorker;

impl Worker for InlineWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Inline
    }

    fn handoff(&self, mut conn: Connection, handler: &Arc<ProtocolHandler>) {
        handler.serve(&mut conn.stream);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadWorker;

impl Worker for ThreadWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Thread
    }

    fn handoff(&self, conn: Connection, handler: &Arc<ProtocolHandler>) {
        let handler = Arc::clone(handler);
        let spawned = std::thread::Builder::new()
            .name("connection".to_string())
            .spawn(move || {
                let mut conn = conn;
                handler.serve(&mut conn.stream);
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to spawn connection thread, dropping connection");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessWorker;

impl Worker for ProcessWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Process
    }

    fn handoff(&self, conn: Connection, handler: &Arc<ProtocolHandler>) {
        // Safety: the child only touches its own copy of the stream and the
        // handler, then leaves through _exit without running destructors.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let mut stream = conn.stream;
                if fd_redirect::detach_from_bridge().is_ok() {
                    handler.serve(&mut stream);
                }
                unsafe { libc::_exit(0) }
            }
            Ok(ForkResult::Parent { child }) => {
                let Connection { stream, guard } = conn;
                drop(stream);
                tracing::debug!(%child, "Connection handed to child");
                let reaper = std::thread::Builder::new()
                    .name("reaper".to_string())
                    .spawn(move || reap(child, guard));
                if let Err(e) = reaper {
                    tracing::warn!(%child, error = %e, "Failed to spawn reaper, child left unreaped");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "fork failed, dropping connection");
            }
        }
    }

    fn spawn_member(&self, _name: String, body: MemberBody) -> io::Result<Member> {
        // Safety: as in handoff.
        match unsafe { fork() }? {
            ForkResult::Child => {
                if fd_redirect::detach_from_bridge().is_ok() {
                    body();
                }
                unsafe { libc::_exit(0) }
            }
            ForkResult::Parent { child } => Ok(Member::Process(child)),
        }
    }
}

fn reap(child: Pid, guard: ConnectionGuard) {
    if let Err(e) = waitpid(child, None) {
        tracing::warn!(%child, error = %e, "waitpid failed");
    }
    drop(guard);
}
