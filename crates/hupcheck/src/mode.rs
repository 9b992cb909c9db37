//! Restart strategies.
//!
//! Fork spawns the next generation immediately and lets both coexist while
//! old clients finish. Exec drains the old generation and replaces it in
//! place, keeping the pid. Both share one lifecycle; they differ in what
//! they assert around the restart.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::bridge::{BridgeError, PendingCall, RemoteServer};
use crate::client::{ClientBatch, ClientObservation};
use crate::signal::{self, PollPolicy, SignalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Fork,
    Exec,
}

impl ModeKind {
    pub const ALL: [ModeKind; 2] = [ModeKind::Fork, ModeKind::Exec];

    /// Restart tool flag selecting this strategy.
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Fork => "--fork",
            Self::Exec => "--exec",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fork => "fork",
            Self::Exec => "exec",
        }
    }

    pub fn build(self, policy: PollPolicy) -> Box<dyn Mode> {
        match self {
            Self::Fork => Box::new(ForkMode::new(policy)),
            Self::Exec => Box::new(ExecMode::new(policy)),
        }
    }
}

impl std::fmt::Display for ModeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fork" => Ok(Self::Fork),
            "exec" => Ok(Self::Exec),
            other => Err(format!("unknown mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    NotStarted,
    Running,
    RestartTriggered,
    Restarted,
    Stopped,
}

impl ModeState {
    fn can_become(self, next: ModeState) -> bool {
        use ModeState::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (Running, RestartTriggered)
                | (RestartTriggered, Restarted)
                | (Restarted, RestartTriggered)
                | (_, Stopped)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModeError {
    #[error("restart invariant violated: {0}")]
    Invariant(String),
    #[error("invalid mode transition from {from:?} to {to:?}")]
    InvalidTransition { from: ModeState, to: ModeState },
    #[error("startup sequence failed: {0}")]
    Startup(String),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// The identities on either side of one restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationChange {
    pub old_pid: u32,
    pub new_pid: u32,
    pub old_cookie: String,
    pub new_cookie: String,
}

/// What the start sequence yields once a generation is serving.
#[derive(Debug)]
pub struct StartedGeneration {
    /// The outstanding `run` call; resolves when the generation stops serving.
    pub run: PendingCall,
    pub port: u16,
}

pub type StartupTask = JoinHandle<Result<StartedGeneration, BridgeError>>;

/// Result of [`Mode::check_restart`].
#[derive(Debug)]
pub struct RestartOutcome {
    pub new_pid: u32,
    pub generation: StartedGeneration,
}

/// Asks the current generation who it is.
#[async_trait]
pub trait PidSource: Send + Sync {
    async fn current_pid(&self) -> Result<u32, BridgeError>;
}

#[async_trait]
impl PidSource for RemoteServer {
    async fn current_pid(&self) -> Result<u32, BridgeError> {
        let value = self
            .call("pid", Vec::new(), serde_json::Map::new())
            .await?;
        serde_json::from_value(value)
            .map_err(|e| BridgeError::Protocol(format!("pid is not a process id: {e}")))
    }
}

/// Lifecycle bookkeeping shared by every mode.
#[derive(Debug)]
pub struct Lifecycle {
    state: ModeState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: ModeState::NotStarted,
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> ModeState {
        self.state
    }

    pub fn advance(&mut self, next: ModeState) -> Result<(), ModeError> {
        if !self.state.can_become(next) {
            return Err(ModeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(from = ?self.state, to = ?next, "Mode transition");
        self.state = next;
        Ok(())
    }
}

async fn join_startup(startup: StartupTask) -> Result<StartedGeneration, ModeError> {
    match startup.await {
        Ok(Ok(generation)) => Ok(generation),
        Ok(Err(e)) => Err(ModeError::Startup(e.to_string())),
        Err(e) => Err(ModeError::Startup(format!("startup task failed: {e}"))),
    }
}

/// Checks common to both modes: the new batch sees only the new cookie,
/// the old batch sees the old or the new one.
fn check_cookies(
    change: &GenerationChange,
    old: &[ClientObservation],
    new: &[ClientObservation],
) -> Result<(), ModeError> {
    for (i, observation) in new.iter().enumerate() {
        if let Some(error) = &observation.error {
            return Err(ModeError::Invariant(format!(
                "new client {i} failed: {error}"
            )));
        }
        if observation.cookie.as_deref() != Some(change.new_cookie.as_str()) {
            return Err(ModeError::Invariant(format!(
                "new client {i} saw cookie {:?}, expected {:?}",
                observation.cookie, change.new_cookie
            )));
        }
    }

    for (i, observation) in old.iter().enumerate() {
        match observation.cookie.as_deref() {
            Some(cookie) if cookie == change.old_cookie || cookie == change.new_cookie => {}
            Some(cookie) => {
                return Err(ModeError::Invariant(format!(
                    "old client {i} saw unknown cookie {cookie:?}"
                )));
            }
            None => {
                return Err(ModeError::Invariant(format!(
                    "old client {i} never got a cookie: {}",
                    observation.error.as_deref().unwrap_or("no error recorded")
                )));
            }
        }
    }
    Ok(())
}

/// A restart strategy driven by the harness.
#[async_trait]
pub trait Mode: Send + Sync {
    fn kind(&self) -> ModeKind;

    fn lifecycle(&self) -> &Lifecycle;

    fn lifecycle_mut(&mut self) -> &mut Lifecycle;

    fn signal_policy(&self) -> &PollPolicy;

    fn state(&self) -> ModeState {
        self.lifecycle().state()
    }

    /// Command line for launching `host` under this mode.
    fn command_line(&self, restart_tool: Option<&Path>, debug: bool, host: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(host.len() + 3);
        if let Some(tool) = restart_tool {
            argv.push(tool.display().to_string());
            argv.push(self.kind().flag().to_string());
            if debug {
                argv.push("--debug".to_string());
            }
        }
        argv.extend(host.iter().cloned());
        argv
    }

    /// Launch `command` and wait for the first generation to announce itself.
    async fn start(
        &mut self,
        command: &[String],
        startup_timeout: Duration,
    ) -> Result<RemoteServer, ModeError> {
        if self.state() != ModeState::NotStarted {
            return Err(ModeError::InvalidTransition {
                from: self.state(),
                to: ModeState::Running,
            });
        }
        let remote = RemoteServer::spawn(command)?;
        remote.wait_startup_timeout(startup_timeout).await?;
        self.lifecycle_mut().advance(ModeState::Running)?;
        tracing::info!(mode = %self.kind(), pid = ?remote.pid(), "Host started");
        Ok(remote)
    }

    /// Hang up every pid and wait until each has taken the signal.
    async fn restart(&mut self, pids: &[u32]) -> Result<(), ModeError> {
        self.lifecycle_mut().advance(ModeState::RestartTriggered)?;
        for pid in pids {
            signal::hangup(*pid)?;
        }
        for pid in pids {
            signal::wait_for_signal_processed(*pid, Signal::SIGHUP, self.signal_policy()).await?;
        }
        tracing::info!(mode = %self.kind(), ?pids, "Restart signalled");
        Ok(())
    }

    /// Terminate every pid still alive and wait for it to exit.
    async fn stop(&mut self, pids: &[u32], timeout: Duration) -> Result<(), ModeError> {
        self.lifecycle_mut().advance(ModeState::Stopped)?;
        let mut first_error = None;
        for pid in pids.iter().copied().filter(|pid| signal::is_alive(*pid)) {
            match signal::terminate(pid) {
                Ok(()) => {}
                Err(SignalError::Send { source, .. }) if source == nix::errno::Errno::ESRCH => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        for pid in pids {
            if let Err(e) = signal::wait_for_exit(*pid, timeout).await {
                tracing::warn!(pid, error = %e, "Process did not exit");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Verify the generation change and return the new pid.
    async fn check_restart(
        &mut self,
        old_pid: u32,
        source: &dyn PidSource,
        startup: StartupTask,
        old_clients: &ClientBatch,
    ) -> Result<RestartOutcome, ModeError>;

    /// Verify what each client batch observed.
    fn check_clients(
        &self,
        change: &GenerationChange,
        old: &[ClientObservation],
        new: &[ClientObservation],
    ) -> Result<(), ModeError>;
}

/// New generation starts at once in a new process.
#[derive(Debug, Default)]
pub struct ForkMode {
    lifecycle: Lifecycle,
    policy: PollPolicy,
}

impl ForkMode {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            lifecycle: Lifecycle::default(),
            policy,
        }
    }
}

#[async_trait]
impl Mode for ForkMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Fork
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn signal_policy(&self) -> &PollPolicy {
        &self.policy
    }

    async fn check_restart(
        &mut self,
        old_pid: u32,
        source: &dyn PidSource,
        startup: StartupTask,
        old_clients: &ClientBatch,
    ) -> Result<RestartOutcome, ModeError> {
        let generation = join_startup(startup).await?;
        let new_pid = source.current_pid().await?;
        if new_pid == old_pid {
            return Err(ModeError::Invariant(format!(
                "fork restart kept pid {old_pid}"
            )));
        }
        // The old generation keeps serving its clients until they leave.
        old_clients.release();
        self.lifecycle.advance(ModeState::Restarted)?;
        Ok(RestartOutcome {
            new_pid,
            generation,
        })
    }

    fn check_clients(
        &self,
        change: &GenerationChange,
        old: &[ClientObservation],
        new: &[ClientObservation],
    ) -> Result<(), ModeError> {
        if change.new_pid == change.old_pid {
            return Err(ModeError::Invariant(format!(
                "fork restart kept pid {}",
                change.old_pid
            )));
        }
        check_cookies(change, old, new)?;
        for (i, observation) in old.iter().enumerate() {
            if let Some(error) = &observation.error {
                tracing::warn!(client = i, %error, "Old client failed after fetching its cookie");
            }
        }
        Ok(())
    }
}

/// How long held clients must keep an exec restart from completing.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// New generation replaces the old one in place once it has drained.
#[derive(Debug)]
pub struct ExecMode {
    lifecycle: Lifecycle,
    policy: PollPolicy,
    drain_grace: Duration,
}

impl Default for ExecMode {
    fn default() -> Self {
        Self::new(PollPolicy::default())
    }
}

impl ExecMode {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            lifecycle: Lifecycle::default(),
            policy,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }
}

#[async_trait]
impl Mode for ExecMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Exec
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn signal_policy(&self) -> &PollPolicy {
        &self.policy
    }

    async fn check_restart(
        &mut self,
        old_pid: u32,
        source: &dyn PidSource,
        mut startup: StartupTask,
        old_clients: &ClientBatch,
    ) -> Result<RestartOutcome, ModeError> {
        let outstanding = old_clients.outstanding();
        if outstanding > 0 {
            // Held clients keep the old generation from draining, so the new
            // one must not announce itself while they are connected.
            tokio::select! {
                joined = &mut startup => {
                    let started = match joined {
                        Ok(Ok(_)) => "started".to_string(),
                        Ok(Err(e)) => format!("failed to start ({e})"),
                        Err(e) => format!("failed to start ({e})"),
                    };
                    return Err(ModeError::Invariant(format!(
                        "new generation {started} with {outstanding} old clients still connected"
                    )));
                }
                _ = tokio::time::sleep(self.drain_grace) => {}
            }
            tracing::debug!(outstanding, "Releasing old clients to let the generation drain");
            old_clients.release();
        }

        let generation = join_startup(startup).await?;
        let new_pid = source.current_pid().await?;
        if new_pid != old_pid {
            return Err(ModeError::Invariant(format!(
                "exec restart changed pid {old_pid} to {new_pid}"
            )));
        }
        self.lifecycle.advance(ModeState::Restarted)?;
        Ok(RestartOutcome {
            new_pid,
            generation,
        })
    }

    fn check_clients(
        &self,
        change: &GenerationChange,
        old: &[ClientObservation],
        new: &[ClientObservation],
    ) -> Result<(), ModeError> {
        if change.new_pid != change.old_pid {
            return Err(ModeError::Invariant(format!(
                "exec restart changed pid {} to {}",
                change.old_pid, change.new_pid
            )));
        }
        for (i, observation) in old.iter().enumerate() {
            if let Some(error) = &observation.error {
                return Err(ModeError::Invariant(format!(
                    "old client {i} failed during exec restart: {error}"
                )));
            }
        }
        check_cookies(change, old, new)
    }
}
