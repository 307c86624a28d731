//! Error taxonomy for remote calls.

use thiserror::Error;

/// Result type alias for remote calls.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors a remote call can surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// Framing or header corruption on the session. The session must be
    /// torn down and re-established before it can be used again.
    #[error("transport error during {op}: {reason}")]
    Transport {
        /// The call that observed the failure.
        op: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// The remote object or collection does not exist.
    #[error("remote object not found: {path}")]
    NotFound {
        /// The path that was looked up.
        path: String,
    },

    /// The remote collection still has members.
    #[error("remote collection not empty: {path}")]
    NotEmpty {
        /// The collection path.
        path: String,
    },

    /// An allocation failed on either side of the call.
    #[error("out of memory during {op}")]
    OutOfMemory {
        /// The call that failed.
        op: &'static str,
    },

    /// Any other non-zero status reported by the server.
    #[error("remote call {op} failed with status {code}")]
    Protocol {
        /// The call that failed.
        op: &'static str,
        /// The server status code.
        code: i32,
    },

    /// A session could not be established at all.
    #[error("cannot reach {addr}: {reason}")]
    Unreachable {
        /// The server address.
        addr: String,
        /// Description of the failure.
        reason: String,
    },
}

impl RpcError {
    /// Whether the error means the session must be reconnected before retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport { .. })
    }

    /// Shorthand for a transport error.
    pub fn transport(op: &'static str, reason: impl Into<String>) -> Self {
        RpcError::Transport {
            op,
            reason: reason.into(),
        }
    }
}
