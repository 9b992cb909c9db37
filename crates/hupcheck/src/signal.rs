//! Signal delivery and completion polling for host processes.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("pid {0} is not a valid process id")]
    InvalidPid(u32),
    #[error("failed to send {signal} to pid {pid}: {source}")]
    Send {
        pid: u32,
        signal: &'static str,
        #[source]
        source: Errno,
    },
    #[error("{signal} still pending for pid {pid} after {attempts} polls")]
    StillPending {
        pid: u32,
        signal: &'static str,
        attempts: u32,
    },
    #[error("pid {pid} still alive {elapsed:?} after SIGTERM")]
    StillAlive { pid: u32, elapsed: Duration },
}

/// Bounded exponential backoff for polling process state.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub attempts: u32,
    /// Used instead of polling where the OS offers no introspection.
    pub settle_delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(200),
            attempts: 50,
            settle_delay: Duration::from_millis(250),
        }
    }
}

impl PollPolicy {
    fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut delay = self.initial_delay;
        (0..self.attempts).map(move |_| {
            let current = delay;
            delay = (delay * 2).min(self.max_delay);
            current
        })
    }
}

fn to_pid(pid: u32) -> Result<Pid, SignalError> {
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .map(Pid::from_raw)
        .ok_or(SignalError::InvalidPid(pid))
}

pub fn send(pid: u32, sig: Signal) -> Result<(), SignalError> {
    tracing::debug!(pid, signal = sig.as_str(), "Sending signal");
    signal::kill(to_pid(pid)?, sig).map_err(|source| SignalError::Send {
        pid,
        signal: sig.as_str(),
        source,
    })
}

pub fn hangup(pid: u32) -> Result<(), SignalError> {
    send(pid, Signal::SIGHUP)
}

pub fn terminate(pid: u32) -> Result<(), SignalError> {
    send(pid, Signal::SIGTERM)
}

/// Whether `pid` names a live (non-zombie) process.
pub fn is_alive(pid: u32) -> bool {
    let Ok(nix_pid) = to_pid(pid) else {
        return false;
    };
    match signal::kill(nix_pid, None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/status"))
        .map(|status| process_state(&status) == Some('Z'))
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Parse the `State:` line of `/proc/<pid>/status`.
pub fn process_state(status: &str) -> Option<char> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("State:"))
        .and_then(|rest| rest.trim_start().chars().next())
}

/// Union of the thread and process pending-signal masks in a
/// `/proc/<pid>/status` document.
pub fn pending_mask(status: &str) -> Option<u64> {
    let mut mask = None;
    for line in status.lines() {
        let hex = line
            .strip_prefix("SigPnd:")
            .or_else(|| line.strip_prefix("ShdPnd:"));
        if let Some(hex) = hex {
            let bits = u64::from_str_radix(hex.trim(), 16).ok()?;
            mask = Some(mask.unwrap_or(0) | bits);
        }
    }
    mask
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn signal_bit(sig: Signal) -> u64 {
    1u64 << ((sig as i32) - 1)
}

/// Wait until `sig` is no longer pending for `pid`, or the process is gone.
#[cfg(target_os = "linux")]
pub async fn wait_for_signal_processed(
    pid: u32,
    sig: Signal,
    policy: &PollPolicy,
) -> Result<(), SignalError> {
    let bit = signal_bit(sig);
    for delay in policy.delays() {
        let status = match tokio::fs::read_to_string(format!("/proc/{pid}/status")).await {
            Ok(status) => status,
            Err(_) => {
                tracing::debug!(pid, "Process gone while waiting for signal");
                return Ok(());
            }
        };
        // A zombie keeps its pending bits but will never take the signal.
        if process_state(&status) == Some('Z') {
            tracing::debug!(pid, "Process exited while waiting for signal");
            return Ok(());
        }
        match pending_mask(&status) {
            Some(mask) if mask & bit != 0 => {}
            _ => {
                tracing::debug!(pid, signal = sig.as_str(), "Signal processed");
                return Ok(());
            }
        }
        tokio::time::sleep(delay).await;
    }
    Err(SignalError::StillPending {
        pid,
        signal: sig.as_str(),
        attempts: policy.attempts,
    })
}

/// Without `/proc` there is no way to observe pending signals.
#[cfg(not(target_os = "linux"))]
pub async fn wait_for_signal_processed(
    pid: u32,
    sig: Signal,
    policy: &PollPolicy,
) -> Result<(), SignalError> {
    tracing::debug!(pid, signal = sig.as_str(), delay = ?policy.settle_delay, "Settling after signal");
    tokio::time::sleep(policy.settle_delay).await;
    Ok(())
}

/// Poll until `pid` has exited.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> Result<(), SignalError> {
    let started = tokio::time::Instant::now();
    let mut delay = Duration::from_millis(5);
    while is_alive(pid) {
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(SignalError::StillAlive { pid, elapsed });
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_millis(100));
    }
    Ok(())
}
