//! hupcheck-host: toy protocol servers driven over the hupcheck bridge.
//!
//! The `hupcheck-host` binary reads calls from stdin and writes results to
//! stdout; logs go to stderr.

mod fd_redirect;
pub mod handler;
pub mod host;
pub mod server;
pub mod tracker;
pub mod variants;

pub use fd_redirect::bridge_file;
pub use handler::{ProtocolHandler, Step};
pub use host::registry;
pub use server::{Server, ServerError};
pub use tracker::{ConnectionGuard, ConnectionTracker};
