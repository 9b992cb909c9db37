//! Restart cycles against in-process generations, without a restart tool.
//!
//! Every generation is a dispatcher thread serving a fresh [`Server`] on one
//! shared bridge. A restart closes the old server, waits for its connections
//! to drain and starts the next generation in its place, so the pid stays
//! the same the way it does across an exec restart.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use hupcheck::bridge::{Dispatcher, RemoteServer};
use hupcheck::mode::{ExecMode, Lifecycle, ModeState, PidSource, RestartOutcome, StartupTask};
use hupcheck::signal::PollPolicy;
use hupcheck::{
    ClientBatch, ClientObservation, GenerationChange, Harness, HarnessConfig, HarnessError, Mode,
    ModeError, ModeKind, ServerKind,
};
use hupcheck_host::{ProtocolHandler, Server, registry};

const HOST: &str = env!("CARGO_BIN_EXE_hupcheck-host");
const TIMEOUT: Duration = Duration::from_secs(10);
const CYCLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handover {
    /// Stop accepting, drain, then start the next generation.
    Drain,
    /// Start the next generation while the old one still has clients.
    Immediate,
}

/// Host side of the bridge and every generation started on it.
struct Generations {
    kind: ServerKind,
    cookie_file: PathBuf,
    input: UnixStream,
    output: UnixStream,
    current: Mutex<Option<Arc<Server>>>,
    retired: Mutex<Vec<Arc<Server>>>,
}

impl Generations {
    /// Start a generation serving the cookie file as it reads now.
    fn launch(&self) {
        let handler = ProtocolHandler::from_file(&self.cookie_file).unwrap();
        let server = Arc::new(Server::new(self.kind, handler, 2));
        let input = self.input.try_clone().unwrap();
        let output = self.output.try_clone().unwrap();
        let dispatcher = Dispatcher::new(registry(), Arc::clone(&server));
        std::thread::spawn(move || dispatcher.serve(input, output));
        *self.current.lock().unwrap() = Some(server);
    }

    fn replace(&self, handover: Handover) {
        let old = self.current.lock().unwrap().take().unwrap();
        if handover == Handover::Drain {
            old.close().unwrap();
            old.wait();
        }
        self.retired.lock().unwrap().push(old);
        self.launch();
    }

    fn close_all(&self) {
        let current = self.current.lock().unwrap().take();
        let retired = std::mem::take(&mut *self.retired.lock().unwrap());
        for server in current.into_iter().chain(retired) {
            let _ = server.close();
        }
    }
}

fn async_end(stream: UnixStream) -> tokio::net::UnixStream {
    stream.set_nonblocking(true).unwrap();
    tokio::net::UnixStream::from_std(stream).unwrap()
}

fn flag_value(command: &[String], flag: &str) -> Option<String> {
    let at = command.iter().position(|arg| arg == flag)?;
    command.get(at + 1).cloned()
}

/// Exec restarts carried out inside the test process.
struct InProcessExec {
    exec: ExecMode,
    kind: ServerKind,
    handover: Handover,
    generations: Option<Arc<Generations>>,
}

impl InProcessExec {
    fn new(kind: ServerKind, handover: Handover) -> Self {
        Self {
            exec: ExecMode::new(PollPolicy::default()),
            kind,
            handover,
            generations: None,
        }
    }
}

#[async_trait]
impl Mode for InProcessExec {
    fn kind(&self) -> ModeKind {
        ModeKind::Exec
    }

    fn lifecycle(&self) -> &Lifecycle {
        self.exec.lifecycle()
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        self.exec.lifecycle_mut()
    }

    fn signal_policy(&self) -> &PollPolicy {
        self.exec.signal_policy()
    }

    async fn start(
        &mut self,
        command: &[String],
        startup_timeout: Duration,
    ) -> Result<RemoteServer, ModeError> {
        let cookie_file = flag_value(command, "--cookie-file").unwrap();
        let (driver_out, input) = UnixStream::pair().unwrap();
        let (output, driver_in) = UnixStream::pair().unwrap();
        let generations = Arc::new(Generations {
            kind: self.kind,
            cookie_file: PathBuf::from(cookie_file),
            input,
            output,
            current: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
        });
        generations.launch();

        let remote = RemoteServer::connect(async_end(driver_in), async_end(driver_out));
        remote.wait_startup_timeout(startup_timeout).await?;
        self.lifecycle_mut().advance(ModeState::Running)?;
        self.generations = Some(generations);
        Ok(remote)
    }

    async fn restart(&mut self, _pids: &[u32]) -> Result<(), ModeError> {
        self.lifecycle_mut().advance(ModeState::RestartTriggered)?;
        let generations = Arc::clone(self.generations.as_ref().unwrap());
        let handover = self.handover;
        std::thread::spawn(move || generations.replace(handover));
        Ok(())
    }

    async fn stop(&mut self, _pids: &[u32], _timeout: Duration) -> Result<(), ModeError> {
        self.lifecycle_mut().advance(ModeState::Stopped)?;
        if let Some(generations) = &self.generations {
            generations.close_all();
        }
        Ok(())
    }

    async fn check_restart(
        &mut self,
        old_pid: u32,
        source: &dyn PidSource,
        startup: StartupTask,
        old_clients: &ClientBatch,
    ) -> Result<RestartOutcome, ModeError> {
        self.exec
            .check_restart(old_pid, source, startup, old_clients)
            .await
    }

    fn check_clients(
        &self,
        change: &GenerationChange,
        old: &[ClientObservation],
        new: &[ClientObservation],
    ) -> Result<(), ModeError> {
        self.exec.check_clients(change, old, new)
    }
}

fn config(server: ServerKind) -> HarnessConfig {
    // One held client: a second could queue behind the closed listener.
    HarnessConfig::new(HOST, server, ModeKind::Exec)
        .with_bind_host("127.0.0.1")
        .with_port(0)
        .with_clients(1)
        .with_cookie("C1")
        .with_call_timeout(TIMEOUT)
        .with_startup_timeout(TIMEOUT)
        .with_client_timeout(TIMEOUT)
}

async fn cycles(server: ServerKind) {
    let mode = Box::new(InProcessExec::new(server, Handover::Drain));
    let mut harness = Harness::start_with_mode(config(server), mode).await.unwrap();
    let pid = harness.pid();
    let port = harness.port();
    assert_eq!(pid, std::process::id());

    for round in 0..CYCLES {
        let old_cookie = harness.cookie().to_string();
        let new_cookie = format!("C{}", round + 2);
        let report = match harness.restart(Some(&new_cookie)).await {
            Ok(report) => report,
            Err(e) => {
                harness.stop().await;
                panic!("{server} round {round}: {e}");
            }
        };

        assert_eq!(report.change.old_pid, pid);
        assert_eq!(report.change.new_pid, pid);
        assert_eq!(report.change.old_cookie, old_cookie);
        assert_eq!(report.change.new_cookie, new_cookie);
        assert_eq!(harness.port(), port, "{server} round {round}");
        assert_eq!(harness.cookie(), new_cookie);

        // Held across the restart, so served to completion by the old generation.
        assert_eq!(report.old_clients.len(), 1);
        assert!(report.old_clients[0].completed(), "{:?}", report.old_clients);
        assert_eq!(report.old_clients[0].cookie.as_deref(), Some(old_cookie.as_str()));

        assert_eq!(report.new_clients.len(), 1);
        assert!(report.new_clients[0].completed(), "{:?}", report.new_clients);
        assert_eq!(report.new_clients[0].cookie.as_deref(), Some(new_cookie.as_str()));
    }

    assert_eq!(harness.mode().state(), ModeState::Restarted);
    harness.stop().await;
    assert_eq!(harness.mode().state(), ModeState::Stopped);
}

#[tokio::test]
async fn thread_server_survives_exec_cycles() {
    hupcheck::init_tracing();
    cycles(ServerKind::Thread).await;
}

#[tokio::test]
async fn simple_server_survives_exec_cycles() {
    hupcheck::init_tracing();
    cycles(ServerKind::Simple).await;
}

#[tokio::test]
async fn generation_started_before_drain_is_rejected() {
    let mode = Box::new(InProcessExec::new(ServerKind::Thread, Handover::Immediate));
    let mut harness = Harness::start_with_mode(config(ServerKind::Thread), mode)
        .await
        .unwrap();

    let err = harness.restart(Some("C2")).await.unwrap_err();
    harness.stop().await;
    match err {
        HarnessError::Mode(ModeError::Invariant(detail)) => {
            assert!(detail.contains("old clients still connected"), "{detail}");
        }
        other => panic!("unexpected error {other}"),
    }
}
