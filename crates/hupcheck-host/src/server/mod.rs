//! Toy protocol servers.
//!
//! Every variant is a loop paired with a worker policy:
//!
//! | variant        | loop      | worker  |
//! |----------------|-----------|---------|
//! | `simple`       | accept    | inline  |
//! | `event`        | poll      | inline  |
//! | `thread`       | accept    | thread  |
//! | `process`      | accept    | process |
//! | `thread-pool`  | pool of N | thread  |
//! | `process-pool` | pool of N | process |
//!
//! Lifecycle: `bind` → `listen` → `run` (blocks until `close`).

mod accept;
mod event;
pub mod socket;
mod worker;

use std::io;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hupcheck::ServerKind;
use hupcheck::bridge::Fault;

pub use worker::{Member, WorkerKind};

use crate::handler::ProtocolHandler;
use crate::tracker::ConnectionTracker;
use accept::LoopContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Accept,
    Event,
    Pool { size: usize },
}

/// Loop and worker policy for a server variant.
pub fn composition(kind: ServerKind, workers: usize) -> (LoopKind, WorkerKind) {
    let pool = LoopKind::Pool {
        size: workers.max(1),
    };
    match kind {
        ServerKind::Simple => (LoopKind::Accept, WorkerKind::Inline),
        ServerKind::Event => (LoopKind::Event, WorkerKind::Inline),
        ServerKind::Thread => (LoopKind::Accept, WorkerKind::Thread),
        ServerKind::Process => (LoopKind::Accept, WorkerKind::Process),
        ServerKind::ThreadPool => (pool, WorkerKind::Thread),
        ServerKind::ProcessPool => (pool, WorkerKind::Process),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already bound")]
    AlreadyBound,
    #[error("server is not bound")]
    NotBound,
    #[error("server is not listening")]
    NotListening,
    #[error("server is closed")]
    Closed,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl From<ServerError> for Fault {
    fn from(e: ServerError) -> Self {
        match e {
            ServerError::Io(e) => Fault::from(e),
            other => Fault::operation_failed(other.to_string()),
        }
    }
}

#[derive(Debug, Default)]
enum SocketState {
    #[default]
    Unbound,
    Bound(Arc<TcpListener>),
    Listening(Arc<TcpListener>),
    Closed,
}

impl SocketState {
    fn listener(&self) -> Option<&Arc<TcpListener>> {
        match self {
            Self::Bound(l) | Self::Listening(l) => Some(l),
            Self::Unbound | Self::Closed => None,
        }
    }
}

pub struct Server {
    kind: ServerKind,
    loop_kind: LoopKind,
    worker: Box<dyn worker::Worker>,
    handler: Arc<ProtocolHandler>,
    tracker: Arc<ConnectionTracker>,
    socket: Mutex<SocketState>,
    closing: Arc<AtomicBool>,
    members: Mutex<Vec<Member>>,
}

impl Server {
    pub fn new(kind: ServerKind, handler: ProtocolHandler, workers: usize) -> Self {
        let (loop_kind, worker_kind) = composition(kind, workers);
        Self {
            kind,
            loop_kind,
            worker: worker::worker(worker_kind),
            handler: Arc::new(handler),
            tracker: ConnectionTracker::new(),
            socket: Mutex::new(SocketState::Unbound),
            closing: Arc::new(AtomicBool::new(false)),
            members: Mutex::new(Vec::new()),
        }
    }

    fn socket(&self) -> MutexGuard<'_, SocketState> {
        self.socket.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn members(&self) -> MutexGuard<'_, Vec<Member>> {
        self.members.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    pub fn bind(&self, host: &str, port: u16) -> Result<(), ServerError> {
        let mut state = self.socket();
        match *state {
            SocketState::Unbound => {}
            SocketState::Closed => return Err(ServerError::Closed),
            _ => return Err(ServerError::AlreadyBound),
        }
        let addr = socket::resolve(host, port)?;
        let listener = socket::bind(addr)?;
        tracing::info!(server = %self.kind, %addr, "Bound");
        *state = SocketState::Bound(Arc::new(listener));
        Ok(())
    }

    pub fn listen(&self, backlog: u32) -> Result<(), ServerError> {
        let mut state = self.socket();
        let listener = match &*state {
            SocketState::Bound(l) | SocketState::Listening(l) => Arc::clone(l),
            SocketState::Unbound => return Err(ServerError::NotBound),
            SocketState::Closed => return Err(ServerError::Closed),
        };
        socket::listen(&listener, backlog)?;
        tracing::info!(server = %self.kind, backlog, "Listening");
        *state = SocketState::Listening(listener);
        Ok(())
    }

    /// Serve connections until [`close`](Self::close).
    pub fn run(&self) -> Result<(), ServerError> {
        let listener = match &*self.socket() {
            SocketState::Listening(l) => Arc::clone(l),
            SocketState::Closed => return Err(ServerError::Closed),
            _ => return Err(ServerError::NotListening),
        };
        let ctx = LoopContext {
            listener,
            handler: Arc::clone(&self.handler),
            tracker: Arc::clone(&self.tracker),
            closing: Arc::clone(&self.closing),
            quiet: false,
        };

        tracing::info!(server = %self.kind, loop_kind = ?self.loop_kind, worker = ?self.worker.kind(), "Running");
        let result = match self.loop_kind {
            LoopKind::Accept => accept::accept_loop(&ctx, self.worker.as_ref()),
            LoopKind::Event => event::event_loop(&ctx),
            LoopKind::Pool { size } => {
                accept::pool_loop(&ctx, self.worker.as_ref(), size, &self.members)
            }
        };
        match result {
            Ok(()) => {
                tracing::info!(server = %self.kind, "Run loop finished");
                Ok(())
            }
            Err(_) if self.is_closing() => Ok(()),
            Err(e) => {
                tracing::error!(server = %self.kind, error = %e, "Run loop failed");
                Err(e.into())
            }
        }
    }

    /// Stop accepting and release the socket. Safe to call more than once.
    pub fn close(&self) -> Result<(), ServerError> {
        self.closing.store(true, Ordering::Release);
        let previous = std::mem::replace(&mut *self.socket(), SocketState::Closed);
        if let Some(listener) = previous.listener() {
            socket::wake(listener)?;
        }

        let members = std::mem::take(&mut *self.members());
        let stopped = members.len();
        for member in members {
            member.stop();
        }
        tracing::info!(server = %self.kind, stopped_members = stopped, "Closed");
        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn pid(&self) -> u32 {
        std::process::id()
    }

    /// Host pid followed by every pool process.
    pub fn pids(&self) -> Vec<u32> {
        std::iter::once(self.pid())
            .chain(self.members().iter().filter_map(Member::pid))
            .collect()
    }

    pub fn cookie(&self) -> &str {
        self.handler.cookie()
    }

    pub fn port(&self) -> Result<u16, ServerError> {
        let state = self.socket();
        let listener = state.listener().ok_or(ServerError::NotBound)?;
        Ok(listener.local_addr()?.port())
    }

    /// Open connections counted by this process.
    pub fn active(&self) -> usize {
        self.tracker.active()
    }

    /// Block until every counted connection has closed.
    pub fn wait(&self) {
        self.tracker.wait();
    }
}
