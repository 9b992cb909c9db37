//! Harness configuration.
//!
//! Built in code with the `with_*` methods, or seeded from the environment:
//!
//! | variable                     | effect                                 |
//! |------------------------------|----------------------------------------|
//! | `HUPCHECK_RESTART_TOOL`      | restart tool wrapping the host         |
//! | `HUPCHECK_PORT`              | port passed to `bind` (0 = ephemeral)  |
//! | `HUPCHECK_CLIENTS`           | clients per batch                      |
//! | `HUPCHECK_DEBUG`             | pass `--debug` to the restart tool     |
//! | `HUPCHECK_CALL_TIMEOUT_SECS` | deadline for lifecycle calls           |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::mode::ModeKind;
use crate::signal::PollPolicy;

pub const DEFAULT_PORT: u16 = 7869;
pub const DEFAULT_BACKLOG: u32 = 1;
pub const DEFAULT_CLIENTS: usize = 10;
pub const DEFAULT_WORKERS: usize = 8;

/// Concurrency strategy of the server under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerKind {
    Simple,
    Event,
    Thread,
    Process,
    ThreadPool,
    ProcessPool,
}

impl ServerKind {
    pub const ALL: [ServerKind; 6] = [
        ServerKind::Simple,
        ServerKind::Event,
        ServerKind::Thread,
        ServerKind::Process,
        ServerKind::ThreadPool,
        ServerKind::ProcessPool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Event => "event",
            Self::Thread => "thread",
            Self::Process => "process",
            Self::ThreadPool => "thread-pool",
            Self::ProcessPool => "process-pool",
        }
    }

    pub fn is_pool(&self) -> bool {
        matches!(self, Self::ThreadPool | Self::ProcessPool)
    }
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown server {s:?}"))
    }
}

/// Bookkeeping hooks run around server operations in the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Pidfile,
    Lockfile,
}

impl HookKind {
    pub const ALL: [HookKind; 2] = [HookKind::Pidfile, HookKind::Lockfile];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pidfile => "pidfile",
            Self::Lockfile => "lockfile",
        }
    }

    /// File the hook maintains inside the state directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Pidfile => "server.pid",
            Self::Lockfile => "server.lock",
        }
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown variant {s:?}"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub host_binary: PathBuf,
    pub server: ServerKind,
    pub mode: ModeKind,
    pub hooks: Vec<HookKind>,
    pub restart_tool: Option<PathBuf>,
    pub debug: bool,
    /// Address passed to `bind`; empty means all interfaces.
    pub bind_host: String,
    pub port: u16,
    pub backlog: u32,
    pub workers: Option<usize>,
    pub clients: usize,
    /// Initial cookie; a fresh UUID when unset.
    pub cookie: Option<String>,
    pub call_timeout: Duration,
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
    pub client_timeout: Duration,
    pub signal_policy: PollPolicy,
}

impl HarnessConfig {
    pub fn new(host_binary: impl Into<PathBuf>, server: ServerKind, mode: ModeKind) -> Self {
        Self {
            host_binary: host_binary.into(),
            server,
            mode,
            hooks: Vec::new(),
            restart_tool: None,
            debug: false,
            bind_host: String::new(),
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            workers: None,
            clients: DEFAULT_CLIENTS,
            cookie: None,
            call_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
            client_timeout: Duration::from_secs(30),
            signal_policy: PollPolicy::default(),
        }
    }

    /// Defaults overridden by `HUPCHECK_*` variables.
    pub fn from_env(
        host_binary: impl Into<PathBuf>,
        server: ServerKind,
        mode: ModeKind,
    ) -> Result<Self, ConfigError> {
        Self::new(host_binary, server, mode).apply_env(|var| std::env::var(var).ok())
    }

    fn apply_env(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(tool) = lookup("HUPCHECK_RESTART_TOOL").filter(|s| !s.is_empty()) {
            self.restart_tool = Some(PathBuf::from(tool));
        }
        if let Some(port) = parse_var(&lookup, "HUPCHECK_PORT")? {
            self.port = port;
        }
        if let Some(clients) = parse_var(&lookup, "HUPCHECK_CLIENTS")? {
            self.clients = clients;
        }
        if let Some(debug) = lookup("HUPCHECK_DEBUG") {
            self.debug = matches!(debug.as_str(), "1" | "true" | "yes");
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "HUPCHECK_CALL_TIMEOUT_SECS")? {
            self.call_timeout = Duration::from_secs(secs);
        }
        Ok(self)
    }

    pub fn with_hook(mut self, hook: HookKind) -> Self {
        if !self.hooks.contains(&hook) {
            self.hooks.push(hook);
        }
        self
    }

    pub fn with_restart_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.restart_tool = Some(tool.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_clients(mut self, clients: usize) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn with_signal_policy(mut self, policy: PollPolicy) -> Self {
        self.signal_policy = policy;
        self
    }

    /// Host command line, before any restart tool prefix.
    pub fn host_command(&self, cookie_file: &std::path::Path, state_dir: &std::path::Path) -> Vec<String> {
        let mut argv = vec![
            self.host_binary.display().to_string(),
            "--server".to_string(),
            self.server.as_str().to_string(),
            "--cookie-file".to_string(),
            cookie_file.display().to_string(),
            "--state-dir".to_string(),
            state_dir.display().to_string(),
        ];
        for hook in &self.hooks {
            argv.push("--variant".to_string());
            argv.push(hook.as_str().to_string());
        }
        if let Some(workers) = self.workers {
            argv.push("--workers".to_string());
            argv.push(workers.to_string());
        }
        argv
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
    }
}
