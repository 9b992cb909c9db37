//! Remote-call bridge between the driver and a host process.

pub mod codec;
pub mod dispatch;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod remote;

pub use codec::{FrameReader, FrameWriter, JsonCodec};
pub use dispatch::{DispatchError, Dispatcher, RETIRE_OPERATION, ServeOutcome};
pub use protocol::{Call, CallId, CallResult, Fault, FaultKind, Outcome};
pub use registry::{CallArgs, Hook, Registry};
pub use remote::{BridgeError, PendingCall, RemoteServer};
