//! hupcheck: drives toy servers through seamless restarts and checks what
//! their clients saw.
//!
//! The driver talks to a host process (`hupcheck-host`) over a remote-call
//! bridge on the host's stdin/stdout. A [`Harness`](harness::Harness)
//! launches the host under a restart [`Mode`](mode::Mode), binds and runs the
//! server, and then repeats restart cycles:
//!
//! 1. connect a batch of clients to the running generation and hold them
//! 2. rewrite the cookie file and retire the old generation's bridge reader
//! 3. hang up the server and wait for the signal to be taken
//! 4. start the next generation and check the mode's restart invariants
//! 5. connect a fresh batch and check which cookie each client saw

pub mod bridge;
pub mod client;
pub mod config;
pub mod harness;
pub mod logging;
pub mod mode;
pub mod signal;

pub use bridge::{BridgeError, Fault, FaultKind, RemoteServer};
pub use client::{ClientBatch, ClientObservation, Hold, ProtocolClient};
pub use config::{HarnessConfig, HookKind, ServerKind};
pub use harness::{Harness, HarnessError, RestartReport};
pub use logging::init_tracing;
pub use mode::{ExecMode, ForkMode, GenerationChange, Mode, ModeError, ModeKind};
