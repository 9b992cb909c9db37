//! File descriptor redirection for forked connection handlers.
//!
//! The host uses fd 0 and fd 1 as the bridge channel. A forked child that
//! inherits them could read a call meant for the parent or write into the
//! result stream, so children point both at /dev/null before doing anything
//! else.
//!
//! The host itself talks through private duplicates of fds 0 and 1. Those are
//! close-on-exec, so a generation exec'd by the restart tool only sees the
//! standard fds.
//!
//! ## Safety contracts
//!
//! 1. Called in a freshly forked child, which has a single thread
//! 2. fds 0 and 1 are open at process startup
//! 3. `from_raw_fd` + `forget` on the standard fds prevents closing them

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};

use nix::unistd::dup2;

const BRIDGE_FDS: [i32; 2] = [0, 1];

/// Own a close-on-exec duplicate of a bridge fd as an unbuffered file.
pub fn bridge_file(fd: impl AsFd) -> io::Result<File> {
    // F_DUPFD_CLOEXEC, never below fd 3.
    let owned = fd.as_fd().try_clone_to_owned()?;
    Ok(File::from(owned))
}

/// Point fds 0 and 1 at /dev/null.
pub fn detach_from_bridge() -> io::Result<()> {
    let null: OwnedFd = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?
        .into();

    for fd in BRIDGE_FDS {
        // Safety: fd is a standard fd that stays open; forget keeps it that way.
        let mut target = unsafe { OwnedFd::from_raw_fd(fd) };
        let result = dup2(&null, &mut target);
        std::mem::forget(target);
        result.map_err(|e| io::Error::other(format!("dup2({fd}) failed: {e}")))?;
    }
    Ok(())
}
