//! Callee side of the bridge - runs inside the host process.
//!
//! The driver side (spawning, correlation) is in remote.rs.
//!
//! Flow:
//! 1. Write the startup announcement
//! 2. Read calls one at a time from the inbound stream on a reader thread,
//!    never ahead of the loop
//! 3. Run each call on its own thread (a blocking `run` must not hold up
//!    `close`), with hooks around it
//! 4. Write exactly one result per call
//!
//! The host is plain threads rather than tokio because server variants fork.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, mpsc};

use serde_json::{Value, json};

use super::codec::{FrameReader, FrameWriter};
use super::protocol::{Call, CallId, CallResult, Fault};
use super::registry::{CallArgs, Hook, Registry};

/// Built-in operation that hands the bridge channel to the next generation.
pub const RETIRE_OPERATION: &str = "retire";

/// How [`Dispatcher::serve`] ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The driver closed the inbound stream.
    EndOfStream,
    /// `retire` was called; the inbound stream is no longer read.
    Retired,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to write startup announcement: {0}")]
    Startup(#[source] io::Error),
    #[error("inbound channel error: {0}")]
    Inbound(#[source] io::Error),
    #[error("failed to write result for call {id}: {source}")]
    Outbound {
        id: CallId,
        #[source]
        source: io::Error,
    },
}

/// What wakes the dispatch loop.
enum Event {
    Frame(io::Result<Option<Call>>),
    /// A result could not be written; the loop must stop.
    Fatal,
}

/// Shared outbound state: the writer plus the set of unanswered calls.
struct Outbound<W> {
    writer: Mutex<FrameWriter<W, CallResult>>,
    in_flight: Mutex<HashMap<CallId, String>>,
    fatal: Mutex<Option<DispatchError>>,
    wake: mpsc::Sender<Event>,
}

impl<W: Write> Outbound<W> {
    fn new(writer: W, wake: mpsc::Sender<Event>) -> Self {
        Self {
            writer: Mutex::new(FrameWriter::new(writer)),
            in_flight: Mutex::new(HashMap::new()),
            fatal: Mutex::new(None),
            wake,
        }
    }

    fn write(&self, result: CallResult) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        writer.write_frame(result)
    }

    fn track(&self, id: CallId, operation: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, operation.to_string());
    }

    /// Write the result unless the call was already answered.
    fn answer(&self, result: CallResult) {
        let id = result.id;
        let owned = self
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
            .is_some();
        if !owned {
            tracing::debug!(%id, "Call already answered, dropping result");
            return;
        }
        if let Err(e) = self.write(result) {
            tracing::error!(%id, error = %e, "Failed to write call result");
            let mut fatal = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
            if fatal.is_none() {
                *fatal = Some(DispatchError::Outbound { id, source: e });
                let _ = self.wake.send(Event::Fatal);
            }
        }
    }

    /// Answer every unanswered call with a restart fault.
    fn retire_in_flight(&self) -> usize {
        let drained: Vec<(CallId, String)> = self
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .collect();
        let count = drained.len();
        for (id, operation) in drained {
            tracing::debug!(%id, %operation, "Resolving in-flight call with restart fault");
            let fault = Fault::restart(format!("generation retired during {operation}"));
            if let Err(e) = self.write(CallResult::fault(id, fault)) {
                tracing::warn!(%id, error = %e, "Failed to write restart fault");
            }
        }
        count
    }

    fn take_fatal(&self) -> Option<DispatchError> {
        self.fatal.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Read frames on a dedicated thread, one per `resume`.
///
/// The next frame may be addressed to a later generation, so nothing is read
/// until the loop has handled the previous call and asked for more.
fn spawn_reader<R>(reader: R, events: mpsc::Sender<Event>) -> io::Result<mpsc::SyncSender<()>>
where
    R: Read + Send + 'static,
{
    let (resume, resumed) = mpsc::sync_channel::<()>(1);
    std::thread::Builder::new()
        .name("bridge-reader".to_string())
        .spawn(move || {
            let mut reader = FrameReader::<R, Call>::new(reader);
            loop {
                let frame = reader.read_frame();
                let last = !matches!(frame, Ok(Some(_)));
                if events.send(Event::Frame(frame)).is_err() || last {
                    return;
                }
                if resumed.recv().is_err() {
                    return;
                }
            }
        })?;
    Ok(resume)
}

struct DispatchInner<T> {
    registry: Registry<T>,
    target: Arc<T>,
    hooks: Vec<Box<dyn Hook<T>>>,
}

impl<T> DispatchInner<T> {
    fn invoke(&self, operation: &str, args: &CallArgs) -> Result<Value, Fault> {
        if !self.registry.contains(operation) {
            return Err(Fault::unknown_operation(operation));
        }
        for hook in &self.hooks {
            hook.pre(operation, &self.target)
                .map_err(|f| Fault::hook_failed(format!("{} pre-{operation}: {}", hook.name(), f.message)))?;
        }
        let value = self.registry.invoke(&self.target, operation, args)?;
        for hook in &self.hooks {
            hook.post(operation, &self.target)
                .map_err(|f| Fault::hook_failed(format!("{} post-{operation}: {}", hook.name(), f.message)))?;
        }
        Ok(value)
    }

    fn run_call(&self, call: &Call) -> CallResult {
        let args = CallArgs::from_call(call);
        let outcome = catch_unwind(AssertUnwindSafe(|| self.invoke(&call.operation, &args)))
            .unwrap_or_else(|_| Err(Fault::internal(format!("{} panicked", call.operation))));

        match outcome {
            Ok(value) => {
                tracing::debug!(id = %call.id, operation = %call.operation, "Call succeeded");
                CallResult::value(call.id, value)
            }
            Err(fault) => {
                tracing::warn!(id = %call.id, operation = %call.operation, %fault, "Call failed");
                CallResult::fault(call.id, fault)
            }
        }
    }
}

/// Dispatch loop serving calls against `target`.
pub struct Dispatcher<T> {
    registry: Registry<T>,
    target: Arc<T>,
    hooks: Vec<Box<dyn Hook<T>>>,
}

impl<T: Send + Sync + 'static> Dispatcher<T> {
    pub fn new(registry: Registry<T>, target: Arc<T>) -> Self {
        Self {
            registry,
            target,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Box<dyn Hook<T>>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_hooks(mut self, hooks: impl IntoIterator<Item = Box<dyn Hook<T>>>) -> Self {
        self.hooks.extend(hooks);
        self
    }

    /// Serve calls until the inbound stream ends or `retire` is called.
    ///
    /// A failed result write ends the loop with [`DispatchError::Outbound`]
    /// even while the reader is blocked waiting for the next call.
    pub fn serve<R, W>(self, reader: R, writer: W) -> Result<ServeOutcome, DispatchError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let inner = Arc::new(DispatchInner {
            registry: self.registry,
            target: self.target,
            hooks: self.hooks,
        });
        let (events_tx, events) = mpsc::channel();
        let outbound = Arc::new(Outbound::new(writer, events_tx.clone()));

        outbound
            .write(CallResult::startup())
            .map_err(DispatchError::Startup)?;
        tracing::info!(pid = std::process::id(), "Startup announced, dispatching calls");

        let resume = spawn_reader(reader, events_tx).map_err(DispatchError::Inbound)?;

        loop {
            let event = events.recv().map_err(|_| {
                DispatchError::Inbound(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "bridge reader stopped",
                ))
            })?;
            if let Some(fatal) = outbound.take_fatal() {
                return Err(fatal);
            }

            let frame = match event {
                Event::Frame(frame) => frame,
                Event::Fatal => continue,
            };
            let call = match frame {
                Ok(Some(call)) => call,
                Ok(None) => {
                    tracing::info!("Inbound channel closed, dispatcher exiting");
                    return Ok(ServeOutcome::EndOfStream);
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(error = %e, "Inbound channel closed mid-frame, dispatcher exiting");
                    return Ok(ServeOutcome::EndOfStream);
                }
                Err(e) => return Err(DispatchError::Inbound(e)),
            };

            tracing::debug!(id = %call.id, operation = %call.operation, "Call received");

            if call.operation == RETIRE_OPERATION {
                let retired = outbound.retire_in_flight();
                outbound.track(call.id, &call.operation);
                outbound.answer(CallResult::value(
                    call.id,
                    json!({ "pid": std::process::id(), "retired": retired }),
                ));
                if let Some(fatal) = outbound.take_fatal() {
                    return Err(fatal);
                }
                tracing::info!(retired, "Generation retired, no longer reading calls");
                return Ok(ServeOutcome::Retired);
            }

            outbound.track(call.id, &call.operation);

            let worker_inner = Arc::clone(&inner);
            let worker_outbound = Arc::clone(&outbound);
            let id = call.id;
            let spawned = std::thread::Builder::new()
                .name(format!("call-{}", call.operation))
                .spawn(move || {
                    let result = worker_inner.run_call(&call);
                    worker_outbound.answer(result);
                });
            if let Err(e) = spawned {
                tracing::error!(%id, error = %e, "Failed to spawn call thread");
                outbound.answer(CallResult::fault(
                    id,
                    Fault::internal(format!("failed to spawn call thread: {e}")),
                ));
            }

            if resume.send(()).is_err() {
                return Err(DispatchError::Inbound(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "bridge reader stopped",
                )));
            }
        }
    }
}
