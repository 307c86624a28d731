use fedfs_rpc::RpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote federation unavailable: {reason}")]
    RemoteUnavailable { reason: String },

    #[error("Remote object not found: {path}")]
    NotFound { path: String },

    #[error("Remote collection not empty: {path}")]
    NotEmpty { path: String },

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Remote call {op} failed with status {code}")]
    Protocol { op: &'static str, code: i32 },

    #[error("Transport error during {op}: {reason}")]
    Transport { op: &'static str, reason: String },

    #[error("Unknown file handle: {fh}")]
    BadHandle { fh: u64 },

    #[error("Invalid argument: {msg}")]
    InvalidArgument { msg: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            GatewayError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            GatewayError::RemoteUnavailable { .. } => ENOTCONN,
            GatewayError::NotFound { .. } => ENOENT,
            GatewayError::NotEmpty { .. } => ENOTEMPTY,
            GatewayError::OutOfMemory => EIO,
            GatewayError::Protocol { .. } => EIO,
            GatewayError::Transport { .. } => EIO,
            GatewayError::BadHandle { .. } => EBADF,
            GatewayError::InvalidArgument { .. } => EINVAL,
            GatewayError::Config { .. } => EINVAL,
        }
    }

    /// Whether the failure came from a broken session that a reconnect may cure.
    pub fn is_transport(&self) -> bool {
        matches!(self, GatewayError::Transport { .. })
    }
}

impl From<RpcError> for GatewayError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Transport { op, reason } => GatewayError::Transport { op, reason },
            RpcError::NotFound { path } => GatewayError::NotFound { path },
            RpcError::NotEmpty { path } => GatewayError::NotEmpty { path },
            RpcError::OutOfMemory { .. } => GatewayError::OutOfMemory,
            RpcError::Protocol { op, code } => {
                tracing::error!(op, code, "remote call failed");
                GatewayError::Protocol { op, code }
            }
            RpcError::Unreachable { addr, reason } => GatewayError::RemoteUnavailable {
                reason: format!("{}: {}", addr, reason),
            },
        }
    }
}
