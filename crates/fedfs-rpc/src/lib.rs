#![warn(missing_docs)]

//! FedFS remote session adapter.
//!
//! The gateway treats the federation's wire protocol as an opaque,
//! session-based call capability. This crate defines that capability
//! ([`RemoteSession`], [`Connector`]), its error taxonomy, the call-timeout
//! watchdog, and an in-memory federation used for tests and embedding.

pub mod error;
pub mod memory;
pub mod session;
pub mod watchdog;

pub use error::{Result, RpcError};
pub use session::{
    CallAbort, CollEntry, CollHandle, Connector, ObjKind, ObjStat, OpenFlags, RemoteFd,
    RemoteSession, ServerAddr,
};
pub use watchdog::{CallGuard, Watchdog, WatchdogConfig};
