//! The remote call surface consumed by the gateway.
//!
//! A [`Connector`] establishes sessions; a [`RemoteSession`] issues
//! synchronous calls that block for the full round trip. Every call may fail
//! with [`RpcError::Transport`](crate::RpcError::Transport), after which the
//! session is unusable until it is replaced by a fresh one.

use crate::error::Result;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    /// Server host name.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// User name to authenticate as.
    pub user: String,
    /// Federation zone.
    pub zone: String,
}

impl ServerAddr {
    /// Creates a new address.
    pub fn new(host: &str, port: u16, user: &str, zone: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            zone: zone.to_string(),
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}:{}", self.user, self.zone, self.host, self.port)
    }
}

/// Access mode requested when opening a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenFlags {
    /// Read access only.
    ReadOnly,
    /// Write access only.
    WriteOnly,
    /// Read and write access.
    ReadWrite,
}

impl OpenFlags {
    /// Whether reads are permitted.
    pub fn is_readable(&self) -> bool {
        match self {
            OpenFlags::ReadOnly | OpenFlags::ReadWrite => true,
            OpenFlags::WriteOnly => false,
        }
    }

    /// Whether writes are permitted.
    pub fn is_writable(&self) -> bool {
        match self {
            OpenFlags::WriteOnly | OpenFlags::ReadWrite => true,
            OpenFlags::ReadOnly => false,
        }
    }

    /// Decodes the access mode bits of POSIX open flags.
    pub fn from_posix(flags: i32) -> Self {
        match flags & 0o3 {
            0 => OpenFlags::ReadOnly,
            1 => OpenFlags::WriteOnly,
            2 => OpenFlags::ReadWrite,
            _ => OpenFlags::ReadOnly,
        }
    }
}

/// A descriptor for an object opened on one particular session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteFd(pub i32);

/// A cursor over a remote collection opened on one particular session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollHandle(pub i32);

/// Kind of a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    /// A data object.
    File,
    /// A collection.
    Collection,
}

/// Attributes of a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjStat {
    /// Object kind.
    pub kind: ObjKind,
    /// Size in bytes (zero for collections).
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Creation time.
    pub ctime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
}

/// One member of a remote collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollEntry {
    /// Member name relative to the collection.
    pub name: String,
    /// Member kind.
    pub kind: ObjKind,
}

/// Out-of-band handle that forcibly breaks a session's transport.
///
/// The watchdog calls [`CallAbort::abort`] on calls that exceed their
/// deadline. The blocked call then returns a transport error.
pub trait CallAbort: Send + Sync {
    /// Closes the session's transport.
    fn abort(&self);
}

/// One authenticated session with the federation.
pub trait RemoteSession: Send {
    /// Authenticates the session.
    fn login(&mut self) -> Result<()>;
    /// Tears down the session. Never fails.
    fn disconnect(&mut self);
    /// Returns a handle the watchdog can use to break this session.
    fn abort_handle(&self) -> Arc<dyn CallAbort>;

    /// Opens a data object.
    fn obj_open(&mut self, path: &str, flags: OpenFlags) -> Result<RemoteFd>;
    /// Closes a data object.
    fn obj_close(&mut self, fd: RemoteFd) -> Result<()>;
    /// Moves the file pointer; returns the new position.
    fn obj_seek(&mut self, fd: RemoteFd, offset: u64) -> Result<u64>;
    /// Reads up to `len` bytes at the file pointer.
    fn obj_read(&mut self, fd: RemoteFd, len: usize) -> Result<Vec<u8>>;
    /// Writes `data` at the file pointer; returns bytes written.
    fn obj_write(&mut self, fd: RemoteFd, data: &[u8]) -> Result<usize>;
    /// Creates a data object and leaves it open read-write.
    fn obj_create(&mut self, path: &str, mode: u32) -> Result<RemoteFd>;
    /// Removes a data object.
    fn obj_unlink(&mut self, path: &str) -> Result<()>;
    /// Renames a data object or collection.
    fn obj_rename(&mut self, from: &str, to: &str) -> Result<()>;
    /// Sets the size of a data object.
    fn obj_truncate(&mut self, path: &str, size: u64) -> Result<()>;
    /// Fetches attributes.
    fn obj_stat(&mut self, path: &str) -> Result<ObjStat>;

    /// Opens a collection for listing.
    fn coll_open(&mut self, path: &str) -> Result<CollHandle>;
    /// Returns the next member, or `None` once exhausted.
    fn coll_read(&mut self, handle: CollHandle) -> Result<Option<CollEntry>>;
    /// Closes a collection cursor.
    fn coll_close(&mut self, handle: CollHandle) -> Result<()>;

    /// A call with no effect, used to keep idle sessions alive.
    fn noop(&mut self) -> Result<()>;
}

/// Establishes new sessions.
pub trait Connector: Send + Sync {
    /// Opens a transport to `addr`. The session still needs [`RemoteSession::login`].
    fn connect(&self, addr: &ServerAddr) -> Result<Box<dyn RemoteSession>>;
}
