//! FedFS gateway core.
//!
//! Exposes a remote storage federation as a filesystem data path: a pooled,
//! self-healing set of remote sessions, a registry of open handles bound to
//! them, a block cache with a per-path write-delta, and a sliding-window
//! read-ahead engine. [`Gateway`] wires the layers together and [`FsOps`] is
//! the errno-returning call surface a filesystem binding sits on.

pub mod block;
pub mod buffered;
pub mod config;
pub mod direct;
pub mod error;
pub mod gateway;
pub mod ops;
pub mod pool;
pub mod preload;
pub mod registry;
pub mod telemetry;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{DataPath, Gateway};
pub use ops::FsOps;
pub use pool::{ConnClass, ConnectionPool, PoolConfig, PoolStats};
pub use preload::{BlockStatus, PreloadConfig, PreloadFs};
pub use registry::{FileHandle, HandleId, Registry};
