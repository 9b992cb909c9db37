//! Protocol client for the toy servers.
//!
//! One text command per send, one reply per 1024-byte receive:
//! `ping` → `pong`, `cookie` → the generation's cookie, `drop` → `okay`
//! followed by the server closing the connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Receive buffer size, matching what the servers read per step.
pub const RECV_SIZE: usize = 1024;

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("i/o error during {command}: {source}")]
    Io {
        command: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("server closed the connection during {0}")]
    Closed(&'static str),
    #[error("unexpected reply to {command}: {reply:?}")]
    UnexpectedReply { command: &'static str, reply: String },
    #[error("{0} timed out")]
    Timeout(&'static str),
}

pub struct ProtocolClient {
    stream: TcpStream,
    addr: SocketAddr,
    timeout: Duration,
}

impl ProtocolClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        Self::connect_with_timeout(addr, DEFAULT_IO_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout("connect"))?
            .map_err(|source| ClientError::Connect { addr, source })?;
        tracing::trace!(%addr, "Client connected");
        Ok(Self {
            stream,
            addr,
            timeout,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn request(&mut self, command: &'static str) -> Result<String, ClientError> {
        let timeout = self.timeout;
        let stream = &mut self.stream;
        let exchange = async {
            stream
                .write_all(command.as_bytes())
                .await
                .map_err(|source| ClientError::Io { command, source })?;
            let mut buf = [0u8; RECV_SIZE];
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|source| ClientError::Io { command, source })?;
            if n == 0 {
                return Err(ClientError::Closed(command));
            }
            Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(command))?
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        let reply = self.request("ping").await?;
        if reply != "pong" {
            return Err(ClientError::UnexpectedReply {
                command: "ping",
                reply,
            });
        }
        Ok(())
    }

    pub async fn cookie(&mut self) -> Result<String, ClientError> {
        let reply = self.request("cookie").await?;
        if reply.is_empty() {
            return Err(ClientError::UnexpectedReply {
                command: "cookie",
                reply,
            });
        }
        Ok(reply)
    }

    /// Send `drop`, expect `okay`, then expect the server to close.
    pub async fn drop_connection(mut self) -> Result<(), ClientError> {
        let reply = self.request("drop").await?;
        if reply != "okay" {
            return Err(ClientError::UnexpectedReply {
                command: "drop",
                reply,
            });
        }

        let mut buf = [0u8; RECV_SIZE];
        let read = tokio::time::timeout(self.timeout, self.stream.read(&mut buf))
            .await
            .map_err(|_| ClientError::Timeout("drop"))?;
        match read {
            Ok(0) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(()),
            Ok(n) => Err(ClientError::UnexpectedReply {
                command: "drop",
                reply: String::from_utf8_lossy(&buf[..n]).into_owned(),
            }),
            Err(source) => Err(ClientError::Io {
                command: "drop",
                source,
            }),
        }
    }
}

/// What one client saw over its connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientObservation {
    pub cookie: Option<String>,
    pub pinged: bool,
    pub dropped: bool,
    pub error: Option<String>,
}

impl ClientObservation {
    /// Ping, cookie and drop all succeeded.
    pub fn completed(&self) -> bool {
        self.error.is_none() && self.pinged && self.dropped && self.cookie.is_some()
    }
}

/// Whether batch clients drop right away or wait to be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    Immediate,
    UntilReleased,
}

/// A set of concurrent clients, each doing ping + cookie + drop.
pub struct ClientBatch {
    tasks: Vec<JoinHandle<ClientObservation>>,
    release: CancellationToken,
    holding: watch::Receiver<usize>,
}

impl ClientBatch {
    pub fn connect(addr: SocketAddr, n: usize, hold: Hold) -> Self {
        Self::connect_with_timeout(addr, n, hold, DEFAULT_IO_TIMEOUT)
    }

    /// Spawn `n` client tasks. Returns without waiting for any of them.
    pub fn connect_with_timeout(
        addr: SocketAddr,
        n: usize,
        hold: Hold,
        timeout: Duration,
    ) -> Self {
        let release = CancellationToken::new();
        let (holding_tx, holding) = watch::channel(0usize);
        let holding_tx = Arc::new(holding_tx);

        let tasks = (0..n)
            .map(|_| {
                let release = match hold {
                    Hold::Immediate => None,
                    Hold::UntilReleased => Some(release.clone()),
                };
                let holding_tx = Arc::clone(&holding_tx);
                tokio::spawn(async move {
                    let mut observation = ClientObservation::default();
                    if let Err(e) =
                        drive_client(addr, timeout, release, &holding_tx, &mut observation).await
                    {
                        tracing::debug!(%addr, error = %e, "Client failed");
                        observation.error = Some(e.to_string());
                    }
                    observation
                })
            })
            .collect();

        Self {
            tasks,
            release,
            holding,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Clients whose task has not finished yet.
    pub fn outstanding(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Clients that fetched their cookie and reached the hold point.
    pub fn holding(&self) -> usize {
        *self.holding.borrow()
    }

    /// Wait until at least `count` clients are holding their connection.
    pub async fn wait_holding(&self, count: usize, timeout: Duration) -> bool {
        let mut holding = self.holding.clone();
        let reached = tokio::time::timeout(timeout, holding.wait_for(|n| *n >= count)).await;
        matches!(reached, Ok(Ok(_)))
    }

    pub fn release(&self) {
        self.release.cancel();
    }

    /// Cancelled once the held clients are released.
    pub fn release_token(&self) -> CancellationToken {
        self.release.clone()
    }

    /// Release held clients and collect every observation.
    pub async fn finish(mut self) -> Vec<ClientObservation> {
        self.release();
        let tasks = std::mem::take(&mut self.tasks);
        let mut observations = Vec::with_capacity(tasks.len());
        for task in tasks {
            let observation = task.await.unwrap_or_else(|e| ClientObservation {
                error: Some(format!("client task failed: {e}")),
                ..Default::default()
            });
            observations.push(observation);
        }
        observations
    }
}

impl Drop for ClientBatch {
    fn drop(&mut self) {
        self.release.cancel();
    }
}

async fn drive_client(
    addr: SocketAddr,
    timeout: Duration,
    release: Option<CancellationToken>,
    holding: &watch::Sender<usize>,
    observation: &mut ClientObservation,
) -> Result<(), ClientError> {
    let mut client = ProtocolClient::connect_with_timeout(addr, timeout).await?;
    client.ping().await?;
    observation.pinged = true;
    observation.cookie = Some(client.cookie().await?);

    if let Some(release) = release {
        holding.send_modify(|n| *n += 1);
        release.cancelled().await;
    }

    client.drop_connection().await?;
    observation.dropped = true;
    Ok(())
}
