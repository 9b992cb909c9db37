//! Caller side of the bridge.
//!
//! A [`RemoteServer`] owns the outbound call stream, a receiver task reading
//! results from the inbound stream, and the [`PendingCalls`] table that pairs
//! them up. Usually the streams are a child's stdin/stdout; tests can wire
//! it to any pair of async byte streams.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::pending::{PendingCalls, WaitFailure};
use super::protocol::{Call, CallId, CallResult, Fault};

type CallWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonCodec<Call>>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge channel closed")]
    ChannelClosed,
    #[error("call {operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
    #[error("remote fault: {0}")]
    Remote(#[from] Fault),
    #[error("bridge i/o error: {0}")]
    Io(#[source] io::Error),
    #[error("failed to spawn host: {0}")]
    Spawn(String),
    #[error("bridge protocol error: {0}")]
    Protocol(String),
}

impl From<io::Error> for BridgeError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => Self::ChannelClosed,
            _ => Self::Io(e),
        }
    }
}

impl BridgeError {
    /// The fault carried back from the host, if this is one.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Remote(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn is_restart(&self) -> bool {
        self.fault().is_some_and(Fault::is_restart)
    }
}

/// Handle to a call that has been sent but not yet waited on.
#[must_use = "a sent call must be waited on or forgotten"]
#[derive(Debug)]
pub struct PendingCall {
    id: CallId,
    operation: String,
}

impl PendingCall {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// A handle that was never sent, for exercising code that consumes one.
    #[cfg(test)]
    pub(crate) fn detached(operation: &str) -> Self {
        Self {
            id: CallId::new(),
            operation: operation.to_string(),
        }
    }
}

pub struct RemoteServer {
    writer: Mutex<Option<CallWriter>>,
    pending: Arc<PendingCalls>,
    receiver: JoinHandle<()>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
}

impl RemoteServer {
    /// Launch `argv` with piped stdin/stdout and serve the bridge over them.
    pub fn spawn(argv: &[String]) -> Result<Self, BridgeError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BridgeError::Spawn("empty command line".to_string()))?;

        tracing::info!(command = ?argv, "Spawning host");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("{program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Spawn("stdout not captured".to_string()))?;

        let pid = child.id();
        let mut remote = Self::connect(stdout, stdin);
        remote.pid = pid;
        remote.child = Mutex::new(Some(child));
        Ok(remote)
    }

    /// Build a bridge over an existing pair of streams.
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(PendingCalls::new());
        let reader = FramedRead::new(reader, JsonCodec::<CallResult>::new());
        let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let writer = FramedWrite::new(boxed, JsonCodec::<Call>::new());

        let receiver = tokio::spawn(receive_results(reader, Arc::clone(&pending)));

        Self {
            writer: Mutex::new(Some(writer)),
            pending,
            receiver,
            child: Mutex::new(None),
            pid: None,
        }
    }

    /// Pid of the directly spawned child, if there is one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn send(
        &self,
        operation: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<PendingCall, BridgeError> {
        let call = Call::new(operation, args, kwargs);
        let id = call.id;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BridgeError::ChannelClosed)?;

        // Register before writing so a fast result always finds its slot.
        if !self.pending.register(id) {
            return Err(BridgeError::ChannelClosed);
        }
        tracing::trace!(%id, operation, "Sending call");
        if let Err(e) = writer.send(call).await {
            self.pending.abandon(id);
            return Err(e.into());
        }

        Ok(PendingCall {
            id,
            operation: operation.to_string(),
        })
    }

    pub async fn wait(&self, pending: PendingCall) -> Result<Value, BridgeError> {
        let outcome = self.pending.wait(pending.id).await;
        resolve(pending, outcome, None)
    }

    /// Wait with a deadline. On expiry the slot is abandoned, unless the
    /// result raced in, in which case it is returned.
    pub async fn wait_timeout(
        &self,
        pending: PendingCall,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let outcome = self.pending.wait_timeout(pending.id, timeout).await;
        resolve(pending, outcome, Some(timeout))
    }

    pub async fn call(
        &self,
        operation: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, BridgeError> {
        let pending = self.send(operation, args, kwargs).await?;
        self.wait(pending).await
    }

    pub async fn call_timeout(
        &self,
        operation: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let pending = self.send(operation, args, kwargs).await?;
        self.wait_timeout(pending, timeout).await
    }

    /// Drop interest in a call; its result, if it ever comes, is discarded.
    pub fn forget(&self, pending: PendingCall) {
        tracing::debug!(id = %pending.id, operation = %pending.operation, "Forgetting call");
        self.pending.abandon(pending.id);
    }

    /// Consume one startup announcement from the host.
    pub async fn wait_startup(&self) -> Result<(), BridgeError> {
        self.pending
            .wait_startup()
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }

    pub async fn wait_startup_timeout(&self, timeout: Duration) -> Result<(), BridgeError> {
        match tokio::time::timeout(timeout, self.wait_startup()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::Timeout {
                operation: "startup".to_string(),
                timeout,
            }),
        }
    }

    /// Number of calls still waiting for a result.
    pub fn pending_calls(&self) -> usize {
        self.pending.outstanding()
    }

    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    /// Close the outbound stream; the host sees end-of-stream.
    pub async fn close_input(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                tracing::debug!(error = %e, "Error closing bridge input");
            }
        }
    }

    /// Kill the directly spawned child. No-op for connected bridges.
    pub async fn kill(&self) -> Result<(), BridgeError> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match child.start_kill() {
                Ok(()) => {}
                // Already exited and reaped.
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
                Err(e) => return Err(BridgeError::Io(e)),
            }
        }
        Ok(())
    }

    /// Wait for the directly spawned child to exit.
    pub async fn wait_exit(&self) -> Result<Option<ExitStatus>, BridgeError> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => Ok(Some(child.wait().await.map_err(BridgeError::Io)?)),
            None => Ok(None),
        }
    }
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

fn resolve(
    pending: PendingCall,
    outcome: Result<CallResult, WaitFailure>,
    timeout: Option<Duration>,
) -> Result<Value, BridgeError> {
    match outcome {
        Ok(result) => result.outcome.into_result().map_err(BridgeError::Remote),
        Err(WaitFailure::Closed) => Err(BridgeError::ChannelClosed),
        Err(WaitFailure::TimedOut) => Err(BridgeError::Timeout {
            operation: pending.operation,
            timeout: timeout.unwrap_or_default(),
        }),
        Err(WaitFailure::Unknown) => Err(BridgeError::Protocol(format!(
            "no pending slot for call {} ({})",
            pending.id, pending.operation
        ))),
    }
}

async fn receive_results<R>(
    mut reader: FramedRead<R, JsonCodec<CallResult>>,
    pending: Arc<PendingCalls>,
) where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(result) => {
                let id = result.id;
                if result.is_startup() {
                    tracing::info!("Host generation announced startup");
                }
                if !pending.complete(result) {
                    tracing::debug!(%id, "Dropping result for unknown or abandoned call");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Bridge receive failed, closing channel");
                break;
            }
        }
    }
    tracing::debug!("Bridge receiver exiting");
    pending.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream as StdUnixStream;

    use serde_json::json;

    use crate::bridge::codec::{FrameReader, FrameWriter};
    use crate::bridge::dispatch::Dispatcher;
    use crate::bridge::protocol::FaultKind;
    use crate::bridge::registry::Registry;

    fn async_end(stream: StdUnixStream) -> tokio::net::UnixStream {
        stream.set_nonblocking(true).unwrap();
        tokio::net::UnixStream::from_std(stream).unwrap()
    }

    /// Bridge connected to a dispatcher on a plain thread.
    fn dispatched() -> RemoteServer {
        let mut registry = Registry::<()>::new();
        registry
            .register("echo", |_: &(), args| args.required::<Value>(0, "value"))
            .register("sleep", |_: &(), args| {
                let ms: u64 = args.required(0, "ms")?;
                std::thread::sleep(Duration::from_millis(ms));
                Ok(ms)
            });

        let (driver_out, host_in) = StdUnixStream::pair().unwrap();
        let (host_out, driver_in) = StdUnixStream::pair().unwrap();
        std::thread::spawn(move || {
            let _ = Dispatcher::new(registry, Arc::new(())).serve(host_in, host_out);
        });

        RemoteServer::connect(async_end(driver_in), async_end(driver_out))
    }

    /// Bridge connected to raw frame endpoints driven by the test.
    fn scripted() -> (
        RemoteServer,
        FrameReader<StdUnixStream, Call>,
        FrameWriter<StdUnixStream, CallResult>,
    ) {
        let (driver_out, host_in) = StdUnixStream::pair().unwrap();
        let (host_out, driver_in) = StdUnixStream::pair().unwrap();
        let remote = RemoteServer::connect(async_end(driver_in), async_end(driver_out));
        (remote, FrameReader::new(host_in), FrameWriter::new(host_out))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_get_their_own_results() {
        let remote = Arc::new(dispatched());
        remote.wait_startup().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..32 {
            let remote = Arc::clone(&remote);
            tasks.push(tokio::spawn(async move {
                let value = json!({"n": i, "list": [i, "x"]});
                let echoed = remote
                    .call("echo", vec![value.clone()], Map::new())
                    .await
                    .unwrap();
                assert_eq!(echoed, value);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(remote.pending_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_operation_is_remote_fault() {
        let remote = dispatched();
        remote.wait_startup().await.unwrap();

        let err = remote
            .call("frobnicate", Vec::new(), Map::new())
            .await
            .unwrap_err();
        let fault = err.fault().expect("remote fault");
        assert_eq!(fault.kind, FaultKind::UnknownOperation);
        assert!(!err.is_restart());
    }

    #[tokio::test]
    async fn deadline_removes_entry_and_bridge_stays_usable() {
        let remote = dispatched();
        remote.wait_startup().await.unwrap();

        let err = remote
            .call_timeout("sleep", vec![json!(300)], Map::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { ref operation, .. } if operation == "sleep"));
        assert_eq!(remote.pending_calls(), 0);

        let value = remote
            .call_timeout("echo", vec![json!("still here")], Map::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, json!("still here"));
    }

    #[tokio::test]
    async fn results_are_matched_by_id_out_of_order() {
        let (remote, mut calls, mut results) = scripted();

        let first = remote.send("a", Vec::new(), Map::new()).await.unwrap();
        let second = remote.send("b", Vec::new(), Map::new()).await.unwrap();

        let host = std::thread::spawn(move || {
            let a: Call = calls.read_frame().unwrap().unwrap();
            let b: Call = calls.read_frame().unwrap().unwrap();
            results.write_frame(CallResult::value(b.id, json!("b"))).unwrap();
            results.write_frame(CallResult::value(a.id, json!("a"))).unwrap();
            (calls, results)
        });

        assert_eq!(remote.wait(second).await.unwrap(), json!("b"));
        assert_eq!(remote.wait(first).await.unwrap(), json!("a"));
        let _ends = host.join().unwrap();
    }

    #[tokio::test]
    async fn closed_channel_fails_outstanding_and_new_calls() {
        let (remote, mut calls, results) = scripted();

        let pending = remote.send("run", Vec::new(), Map::new()).await.unwrap();
        let host = std::thread::spawn(move || {
            let _call: Call = calls.read_frame().unwrap().unwrap();
            drop(results);
            calls
        });
        let _calls = host.join().unwrap();

        let err = remote.wait(pending).await.unwrap_err();
        assert!(matches!(err, BridgeError::ChannelClosed));
        assert!(remote.is_closed());

        let err = remote.call("ping", Vec::new(), Map::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::ChannelClosed));
        assert!(matches!(
            remote.wait_startup().await.unwrap_err(),
            BridgeError::ChannelClosed
        ));
    }

    #[tokio::test]
    async fn forgotten_call_result_is_dropped() {
        let (remote, mut calls, mut results) = scripted();

        let pending = remote.send("run", Vec::new(), Map::new()).await.unwrap();
        let id = pending.id();
        remote.forget(pending);
        assert_eq!(remote.pending_calls(), 0);

        let host = std::thread::spawn(move || {
            let call: Call = calls.read_frame().unwrap().unwrap();
            assert_eq!(call.id, id);
            results
                .write_frame(CallResult::fault(id, Fault::restart("retired")))
                .unwrap();
            results.write_frame(CallResult::startup()).unwrap();
            (calls, results)
        });

        remote.wait_startup().await.unwrap();
        assert_eq!(remote.pending_calls(), 0);
        let _ends = host.join().unwrap();
    }

    #[tokio::test]
    async fn close_input_gives_host_end_of_stream() {
        let (remote, mut calls, _results) = scripted();
        remote.close_input().await;

        let host = std::thread::spawn(move || calls.read_frame().unwrap());
        assert!(host.join().unwrap().is_none());

        let err = remote.send("ping", Vec::new(), Map::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::ChannelClosed));
    }

    #[test]
    fn broken_pipe_maps_to_channel_closed() {
        let err = BridgeError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, BridgeError::ChannelClosed));
        let err = BridgeError::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, BridgeError::Io(_)));
    }
}
