//! Bookkeeping hooks layered over the server operations.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use hupcheck::HookKind;
use hupcheck::bridge::{Fault, Hook};

use crate::server::Server;

/// Build the hooks for `kinds`, in order, writing under `state_dir`.
pub fn hooks(kinds: &[HookKind], state_dir: &Path) -> Vec<Box<dyn Hook<Server>>> {
    kinds
        .iter()
        .map(|kind| -> Box<dyn Hook<Server>> {
            let path = state_dir.join(kind.file_name());
            match kind {
                HookKind::Pidfile => Box::new(PidfileHook { path }),
                HookKind::Lockfile => Box::new(LockfileHook { path }),
            }
        })
        .collect()
}

fn write_pid(path: &Path, pid: u32) -> Result<(), Fault> {
    fs::write(path, format!("{pid}\n")).map_err(|e| {
        Fault::from(e).with_detail(serde_json::Value::String(path.display().to_string()))
    })
}

fn read_pid(path: &Path) -> io::Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove(path: &Path) -> Result<(), Fault> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Writes the host pid after `bind`, removes it after `close`.
#[derive(Debug)]
pub struct PidfileHook {
    path: PathBuf,
}

impl Hook<Server> for PidfileHook {
    fn name(&self) -> &str {
        "pidfile"
    }

    fn post(&self, operation: &str, server: &Server) -> Result<(), Fault> {
        match operation {
            "bind" => {
                write_pid(&self.path, server.pid())?;
                tracing::debug!(path = %self.path.display(), "Pidfile written");
                Ok(())
            }
            "close" => remove(&self.path),
            _ => Ok(()),
        }
    }
}

/// Claims a lockfile before `run` and releases it after `close`.
///
/// A newer generation may have claimed the lock already; `close` only
/// removes a lockfile that still names this process.
#[derive(Debug)]
pub struct LockfileHook {
    path: PathBuf,
}

impl Hook<Server> for LockfileHook {
    fn name(&self) -> &str {
        "lockfile"
    }

    fn pre(&self, operation: &str, server: &Server) -> Result<(), Fault> {
        if operation != "run" {
            return Ok(());
        }
        if let Some(holder) = read_pid(&self.path)?
            && holder != server.pid()
        {
            tracing::info!(holder, path = %self.path.display(), "Taking over lockfile");
        }
        write_pid(&self.path, server.pid())
    }

    fn post(&self, operation: &str, server: &Server) -> Result<(), Fault> {
        if operation != "close" {
            return Ok(());
        }
        match read_pid(&self.path)? {
            Some(holder) if holder == server.pid() => remove(&self.path),
            Some(holder) => {
                tracing::debug!(holder, "Lockfile held by another generation, leaving it");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ProtocolHandler;
    use hupcheck::ServerKind;

    fn server() -> Server {
        Server::new(ServerKind::Simple, ProtocolHandler::new("V"), 1)
    }

    #[test]
    fn hooks_follow_requested_order() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = hooks(&[HookKind::Lockfile, HookKind::Pidfile], dir.path());
        let names: Vec<&str> = hooks.iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["lockfile", "pidfile"]);
    }

    #[test]
    fn pidfile_tracks_bind_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        let hook = PidfileHook { path: path.clone() };
        let server = server();

        hook.post("listen", &server).unwrap();
        assert!(!path.exists());

        hook.post("bind", &server).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id()));

        hook.post("close", &server).unwrap();
        assert!(!path.exists());
        hook.post("close", &server).unwrap();
    }

    #[test]
    fn lockfile_is_claimed_before_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.lock");
        let hook = LockfileHook { path: path.clone() };
        let server = server();

        fs::write(&path, "1\n").unwrap();
        hook.pre("run", &server).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id()));

        hook.post("close", &server).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn lockfile_of_another_generation_survives_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.lock");
        let hook = LockfileHook { path: path.clone() };

        fs::write(&path, "1\n").unwrap();
        hook.post("close", &server()).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(1));
    }

    #[test]
    fn unwritable_state_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let hook = PidfileHook {
            path: dir.path().join("missing").join("server.pid"),
        };
        let fault = hook.post("bind", &server()).unwrap_err();
        assert_eq!(fault.kind, hupcheck::FaultKind::OperationFailed);
    }
}
