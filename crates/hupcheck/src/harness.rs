//! Test harness: launches a host under a mode and drives restart cycles.
//!
//! A cycle connects a held batch of clients to the running generation,
//! rewrites the cookie file, retires the old generation's hold on the
//! bridge, signals the restart and lets the mode check the result against
//! a fresh batch of clients.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tempfile::{NamedTempFile, TempDir};

use crate::bridge::{BridgeError, PendingCall, RETIRE_OPERATION, RemoteServer};
use crate::client::{ClientBatch, ClientError, ClientObservation, Hold, ProtocolClient};
use crate::config::{HarnessConfig, HookKind};
use crate::mode::{GenerationChange, Mode, ModeError, StartedGeneration, StartupTask};

/// Old generation holders the harness waits for before signalling.
const MIN_HELD_CLIENTS: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to prepare {what}: {source}")]
    Setup {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Mode(#[from] ModeError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("unexpected reply to {operation}: {detail}")]
    Protocol {
        operation: &'static str,
        detail: String,
    },
    #[error("harness already stopped")]
    Stopped,
}

/// Everything observed during one restart cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartReport {
    pub change: GenerationChange,
    pub old_clients: Vec<ClientObservation>,
    pub new_clients: Vec<ClientObservation>,
}

/// Where the next generation should bind.
#[derive(Debug, Clone)]
struct BindTarget {
    host: String,
    port: u16,
    backlog: u32,
    timeout: Duration,
    startup_timeout: Duration,
}

/// `bind`, `listen` and `run` on a generation that has announced itself.
async fn serve_generation(
    remote: &RemoteServer,
    target: &BindTarget,
) -> Result<StartedGeneration, BridgeError> {
    remote
        .call_timeout(
            "bind",
            vec![json!(target.host), json!(target.port)],
            Map::new(),
            target.timeout,
        )
        .await?;
    remote
        .call_timeout("listen", vec![json!(target.backlog)], Map::new(), target.timeout)
        .await?;
    let port = remote
        .call_timeout("port", Vec::new(), Map::new(), target.timeout)
        .await?;
    let port: u16 = serde_json::from_value(port)
        .map_err(|e| BridgeError::Protocol(format!("port is not a port number: {e}")))?;
    let run = remote.send("run", Vec::new(), Map::new()).await?;
    tracing::debug!(port, "Generation serving");
    Ok(StartedGeneration { run, port })
}

/// Start sequence of a restarted generation, run as a task.
async fn start_generation(
    remote: Arc<RemoteServer>,
    target: BindTarget,
) -> Result<StartedGeneration, BridgeError> {
    remote.wait_startup_timeout(target.startup_timeout).await?;
    serve_generation(&remote, &target).await
}

pub struct Harness {
    config: HarnessConfig,
    mode: Box<dyn Mode>,
    remote: Arc<RemoteServer>,
    cookie_file: NamedTempFile,
    state_dir: TempDir,
    cookie: String,
    pid: u32,
    pids: Vec<u32>,
    port: u16,
    run: Option<PendingCall>,
    stopped: bool,
}

impl Harness {
    /// Launch the host under the mode named by `config`.
    pub async fn start(config: HarnessConfig) -> Result<Self, HarnessError> {
        let mode = config.mode.build(config.signal_policy.clone());
        Self::start_with_mode(config, mode).await
    }

    /// Launch the host under `mode`, which decides how generations are
    /// started, restarted and stopped.
    pub async fn start_with_mode(
        config: HarnessConfig,
        mut mode: Box<dyn Mode>,
    ) -> Result<Self, HarnessError> {
        let cookie = config
            .cookie
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut cookie_file = NamedTempFile::new().map_err(|source| HarnessError::Setup {
            what: "cookie file",
            source,
        })?;
        write_cookie(&mut cookie_file, &cookie)?;
        let state_dir = tempfile::tempdir().map_err(|source| HarnessError::Setup {
            what: "state directory",
            source,
        })?;

        let host = config.host_command(cookie_file.path(), state_dir.path());
        let command = mode.command_line(config.restart_tool.as_deref(), config.debug, &host);

        tracing::info!(
            server = %config.server,
            mode = %mode.kind(),
            restart_tool = ?config.restart_tool,
            "Starting harness"
        );
        let remote = Arc::new(mode.start(&command, config.startup_timeout).await?);

        let mut harness = Self {
            mode,
            remote,
            cookie_file,
            state_dir,
            cookie,
            pid: 0,
            pids: Vec::new(),
            port: config.port,
            run: None,
            stopped: false,
            config,
        };

        // The mode already consumed the startup announcement.
        let target = harness.bind_target(harness.config.port);
        let started = serve_generation(&harness.remote, &target).await;

        let generation = match started {
            Ok(generation) => generation,
            Err(e) => {
                harness.stop().await;
                return Err(e.into());
            }
        };
        harness.port = generation.port;
        harness.run = Some(generation.run);

        match harness.refresh_identity().await {
            Ok(()) => {}
            Err(e) => {
                harness.stop().await;
                return Err(e);
            }
        }
        tracing::info!(pid = harness.pid, port = harness.port, "Harness started");
        Ok(harness)
    }

    fn bind_target(&self, port: u16) -> BindTarget {
        BindTarget {
            host: self.config.bind_host.clone(),
            port,
            backlog: self.config.backlog,
            timeout: self.config.call_timeout,
            startup_timeout: self.config.startup_timeout,
        }
    }

    async fn call(&self, operation: &str) -> Result<Value, BridgeError> {
        self.remote
            .call_timeout(operation, Vec::new(), Map::new(), self.config.call_timeout)
            .await
    }

    async fn refresh_identity(&mut self) -> Result<(), HarnessError> {
        let pid = self.call("pid").await?;
        self.pid = serde_json::from_value(pid).map_err(|e| HarnessError::Protocol {
            operation: "pid",
            detail: e.to_string(),
        })?;
        self.pids = self.fetch_pids().await?;
        Ok(())
    }

    async fn fetch_pids(&self) -> Result<Vec<u32>, HarnessError> {
        let pids = self.call("pids").await?;
        serde_json::from_value(pids).map_err(|e| HarnessError::Protocol {
            operation: "pids",
            detail: e.to_string(),
        })
    }

    /// Run one restart cycle, switching to `cookie` (a fresh UUID if unset).
    pub async fn restart(&mut self, cookie: Option<&str>) -> Result<RestartReport, HarnessError> {
        if self.stopped {
            return Err(HarnessError::Stopped);
        }
        let addr = self.address();

        let old_clients = ClientBatch::connect_with_timeout(
            addr,
            self.config.clients,
            Hold::UntilReleased,
            self.config.client_timeout,
        );
        if self.config.clients > 0
            && !old_clients
                .wait_holding(MIN_HELD_CLIENTS, self.config.client_timeout)
                .await
        {
            let observations = old_clients.finish().await;
            let detail = observations
                .iter()
                .find_map(|o| o.error.clone())
                .unwrap_or_else(|| "no client reached the server".to_string());
            return Err(HarnessError::Protocol {
                operation: "cookie",
                detail,
            });
        }

        let old_cookie = std::mem::take(&mut self.cookie);
        let new_cookie = cookie
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        write_cookie(&mut self.cookie_file, &new_cookie)?;
        self.cookie = new_cookie.clone();

        let old_pid = self.pid;
        let pids = self.fetch_pids().await?;
        self.retire().await?;

        tracing::info!(old_pid, ?pids, "Restarting");
        self.mode.restart(&pids).await?;

        // The next generation takes over the port the first one bound.
        let startup: StartupTask = tokio::spawn(start_generation(
            Arc::clone(&self.remote),
            self.bind_target(self.port),
        ));
        let outcome = self
            .mode
            .check_restart(old_pid, self.remote.as_ref(), startup, &old_clients)
            .await?;
        self.run = Some(outcome.generation.run);
        self.port = outcome.generation.port;

        let new_clients = ClientBatch::connect_with_timeout(
            self.address(),
            self.config.clients,
            Hold::Immediate,
            self.config.client_timeout,
        )
        .finish()
        .await;
        let old_clients = old_clients.finish().await;

        let change = GenerationChange {
            old_pid,
            new_pid: outcome.new_pid,
            old_cookie,
            new_cookie,
        };
        self.mode.check_clients(&change, &old_clients, &new_clients)?;

        self.refresh_identity().await?;
        tracing::info!(
            old_pid = change.old_pid,
            new_pid = change.new_pid,
            "Restart verified"
        );
        Ok(RestartReport {
            change,
            old_clients,
            new_clients,
        })
    }

    /// Hand the bridge to the next generation; the old `run` must come back
    /// as a restart fault.
    async fn retire(&mut self) -> Result<(), HarnessError> {
        self.call(RETIRE_OPERATION).await?;
        let Some(run) = self.run.take() else {
            return Ok(());
        };
        match self.remote.wait_timeout(run, self.config.call_timeout).await {
            Err(e) if e.is_restart() => Ok(()),
            Err(e) => Err(HarnessError::Protocol {
                operation: "run",
                detail: format!("expected restart fault, got {e}"),
            }),
            Ok(value) => Err(HarnessError::Protocol {
                operation: "run",
                detail: format!("expected restart fault, got value {value}"),
            }),
        }
    }

    pub async fn client(&self) -> Result<ProtocolClient, HarnessError> {
        Ok(ProtocolClient::connect_with_timeout(self.address(), self.config.client_timeout).await?)
    }

    /// A batch of unheld clients against the current generation.
    pub async fn clients(&self, n: usize) -> Vec<ClientObservation> {
        ClientBatch::connect_with_timeout(self.address(), n, Hold::Immediate, self.config.client_timeout)
            .finish()
            .await
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pids(&self) -> &[u32] {
        &self.pids
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Loopback address of the server under test.
    pub fn address(&self) -> SocketAddr {
        let ip = match self.config.bind_host.parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => ip,
            _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        SocketAddr::new(ip, self.port)
    }

    pub fn mode(&self) -> &dyn Mode {
        self.mode.as_ref()
    }

    pub fn remote(&self) -> &RemoteServer {
        &self.remote
    }

    pub fn state_dir(&self) -> &Path {
        self.state_dir.path()
    }

    pub fn pidfile(&self) -> PathBuf {
        self.state_dir.path().join(HookKind::Pidfile.file_name())
    }

    pub fn lockfile(&self) -> PathBuf {
        self.state_dir.path().join(HookKind::Lockfile.file_name())
    }

    /// Close the server and tear everything down. Never fails; safe to call
    /// more than once and after the host has died.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Some(run) = self.run.take() {
            self.remote.forget(run);
        }
        if !self.remote.is_closed() {
            let close = self
                .remote
                .call_timeout("close", Vec::new(), Map::new(), Duration::from_secs(2))
                .await;
            if let Err(e) = close {
                tracing::debug!(error = %e, "Close during stop failed");
            }
        }
        self.remote.close_input().await;

        let mut pids = self.pids.clone();
        if self.pid != 0 && !pids.contains(&self.pid) {
            pids.push(self.pid);
        }
        if let Err(e) = self.mode.stop(&pids, self.config.stop_timeout).await {
            tracing::warn!(error = %e, "Mode stop failed");
        }

        if let Err(e) = self.remote.kill().await {
            tracing::debug!(error = %e, "Kill during stop failed");
        }
        match tokio::time::timeout(self.config.stop_timeout, self.remote.wait_exit()).await {
            Ok(Ok(status)) => tracing::debug!(?status, "Host exited"),
            Ok(Err(e)) => tracing::debug!(error = %e, "Waiting for host failed"),
            Err(_) => tracing::warn!("Host did not exit in time"),
        }
        tracing::info!("Harness stopped");
    }
}

fn write_cookie(file: &mut NamedTempFile, cookie: &str) -> Result<(), HarnessError> {
    let setup = |source| HarnessError::Setup {
        what: "cookie file",
        source,
    };
    let handle = file.as_file_mut();
    handle.set_len(0).map_err(setup)?;
    std::io::Seek::rewind(handle).map_err(setup)?;
    handle.write_all(cookie.as_bytes()).map_err(setup)?;
    handle.flush().map_err(setup)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn cookie_rewrite_truncates() {
        let mut file = NamedTempFile::new().unwrap();
        write_cookie(&mut file, "a-much-longer-first-cookie").unwrap();
        write_cookie(&mut file, "C2").unwrap();

        let mut contents = String::new();
        std::fs::File::open(file.path())
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "C2");
    }

    #[test]
    fn report_serializes() {
        let report = RestartReport {
            change: GenerationChange {
                old_pid: 10,
                new_pid: 11,
                old_cookie: "C1".to_string(),
                new_cookie: "C2".to_string(),
            },
            old_clients: vec![ClientObservation {
                cookie: Some("C1".to_string()),
                pinged: true,
                dropped: true,
                error: None,
            }],
            new_clients: Vec::new(),
        };
        insta::assert_json_snapshot!(report, @r#"
        {
          "change": {
            "old_pid": 10,
            "new_pid": 11,
            "old_cookie": "C1",
            "new_cookie": "C2"
          },
          "old_clients": [
            {
              "cookie": "C1",
              "pinged": true,
              "dropped": true,
              "error": null
            }
          ],
          "new_clients": []
        }
        "#);
    }
}
