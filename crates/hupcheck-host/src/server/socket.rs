//! Listening socket setup.
//!
//! `bind` and `listen` are separate syscalls here, and the socket is created
//! without close-on-exec, so a restart tool interposing on them can hand an
//! inherited listener to the next generation.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{
    self, AddressFamily, Backlog, Shutdown, SockFlag, SockType, SockaddrStorage, sockopt,
};

/// Resolve `host:port`; an empty host means every IPv4 interface.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{host}:{port} did not resolve"),
        )
    })
}

/// Create a TCP socket with `SO_REUSEADDR` and bind it, without listening.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd: OwnedFd = socket::socket(family, SockType::Stream, SockFlag::empty(), None)?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;
    Ok(TcpListener::from(fd))
}

pub fn listen(listener: &TcpListener, backlog: u32) -> io::Result<()> {
    let backlog = i32::try_from(backlog)
        .ok()
        .and_then(|n| Backlog::new(n).ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("backlog {backlog} out of range"),
            )
        })?;
    socket::listen(listener, backlog)?;
    Ok(())
}

/// Shut the socket down so threads blocked in `accept` return.
///
/// A socket that never listened reports ENOTCONN, which is not an error here.
pub fn wake(listener: &TcpListener) -> io::Result<()> {
    match socket::shutdown(listener.as_raw_fd(), Shutdown::Both) {
        Ok(()) | Err(Errno::ENOTCONN) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
