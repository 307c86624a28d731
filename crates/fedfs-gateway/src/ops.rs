//! Filesystem call boundary.
//!
//! Calls are keyed by mount-relative paths and numeric file handles, routed to
//! the configured data path, and fail with a positive errno.

use std::sync::Arc;
use std::time::SystemTime;

use fedfs_rpc::{ObjKind, OpenFlags};
use tracing::debug;

use crate::error::GatewayError;
use crate::gateway::{DataPath, Gateway};
use crate::registry::{FileHandle, HandleId};

pub type OpResult<T> = std::result::Result<T, i32>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    pub kind: ObjKind,
    pub size: u64,
    pub mode: u32,
    pub ctime: SystemTime,
    pub mtime: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: ObjKind,
}

fn errno(op: &'static str, err: GatewayError) -> i32 {
    let code = err.to_errno();
    debug!(op, errno = code, error = %err, "call failed");
    code
}

pub struct FsOps {
    gateway: Arc<Gateway>,
}

impl FsOps {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Maps a mount-relative path into the exported remote collection.
    ///
    /// Empty and `.` components are dropped; `..` is refused with `EINVAL` so
    /// a path can never leave the collection.
    pub fn remote_path(&self, path: &str) -> OpResult<String> {
        let root = self.gateway.config().server.remote_root.trim_end_matches('/');
        let mut remote = root.to_string();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    debug!(path, "parent component in path refused");
                    return Err(libc::EINVAL);
                }
                name => {
                    remote.push('/');
                    remote.push_str(name);
                }
            }
        }
        if remote.is_empty() {
            remote.push('/');
        }
        Ok(remote)
    }

    fn handle(&self, fh: HandleId) -> OpResult<Arc<FileHandle>> {
        self.gateway
            .registry()
            .get(fh)
            .map_err(|e| errno("handle", e))
    }

    pub fn getattr(&self, path: &str) -> OpResult<FileAttr> {
        let remote = self.remote_path(path)?;
        let stat = match self.gateway.data_path() {
            DataPath::Direct => self.gateway.direct().getattr(&remote),
            DataPath::Buffered | DataPath::Preload => self.gateway.buffered().getattr(&remote),
        }
        .map_err(|e| errno("getattr", e))?;
        Ok(FileAttr {
            kind: stat.kind,
            size: stat.size,
            mode: stat.mode,
            ctime: stat.ctime,
            mtime: stat.mtime,
        })
    }

    /// Opens with POSIX `flags` and returns the new file handle.
    pub fn open(&self, path: &str, flags: i32) -> OpResult<HandleId> {
        let remote = self.remote_path(path)?;
        let flags = OpenFlags::from_posix(flags);
        let handle = match self.gateway.data_path() {
            DataPath::Direct => self.gateway.direct().open(&remote, flags),
            DataPath::Buffered => self.gateway.buffered().open(&remote, flags),
            DataPath::Preload => self.gateway.preload().open(&remote, flags),
        }
        .map_err(|e| errno("open", e))?;
        Ok(handle.id())
    }

    pub fn read(&self, fh: HandleId, offset: u64, size: usize) -> OpResult<Vec<u8>> {
        let handle = self.handle(fh)?;
        match self.gateway.data_path() {
            DataPath::Direct => self.gateway.direct().read(&handle, offset, size),
            DataPath::Buffered => self.gateway.buffered().read(&handle, offset, size),
            DataPath::Preload => self.gateway.preload().read(&handle, offset, size),
        }
        .map_err(|e| errno("read", e))
    }

    pub fn write(&self, fh: HandleId, offset: u64, data: &[u8]) -> OpResult<usize> {
        let handle = self.handle(fh)?;
        match self.gateway.data_path() {
            DataPath::Direct => self.gateway.direct().write(&handle, offset, data),
            DataPath::Buffered | DataPath::Preload => {
                self.gateway.buffered().write(&handle, offset, data)
            }
        }
        .map_err(|e| errno("write", e))
    }

    pub fn flush(&self, fh: HandleId) -> OpResult<()> {
        let handle = self.handle(fh)?;
        match self.gateway.data_path() {
            DataPath::Direct => self.gateway.direct().flush(&handle),
            DataPath::Buffered | DataPath::Preload => self.gateway.buffered().flush(&handle),
        }
        .map_err(|e| errno("flush", e))
    }

    pub fn fsync(&self, fh: HandleId) -> OpResult<()> {
        let handle = self.handle(fh)?;
        match self.gateway.data_path() {
            DataPath::Direct => Ok(()),
            DataPath::Buffered | DataPath::Preload => self.gateway.buffered().fsync(&handle),
        }
        .map_err(|e| errno("fsync", e))
    }

    /// Closes the handle. The handle is gone even when the final flush fails.
    pub fn release(&self, fh: HandleId) -> OpResult<()> {
        let handle = self.handle(fh)?;
        match self.gateway.data_path() {
            DataPath::Direct => {
                self.gateway.direct().close(&handle);
                Ok(())
            }
            DataPath::Buffered => self.gateway.buffered().close(&handle),
            DataPath::Preload => self.gateway.preload().close(&handle),
        }
        .map_err(|e| errno("release", e))
    }

    pub fn create(&self, path: &str, mode: u32) -> OpResult<HandleId> {
        let remote = self.remote_path(path)?;
        let handle = match self.gateway.data_path() {
            DataPath::Direct => self.gateway.direct().create(&remote, mode),
            DataPath::Buffered | DataPath::Preload => self.gateway.buffered().create(&remote, mode),
        }
        .map_err(|e| errno("create", e))?;
        Ok(handle.id())
    }

    pub fn unlink(&self, path: &str) -> OpResult<()> {
        let remote = self.remote_path(path)?;
        match self.gateway.data_path() {
            DataPath::Direct => self.gateway.direct().unlink(&remote),
            DataPath::Buffered | DataPath::Preload => self.gateway.buffered().unlink(&remote),
        }
        .map_err(|e| errno("unlink", e))
    }

    pub fn truncate(&self, path: &str, size: u64) -> OpResult<()> {
        let remote = self.remote_path(path)?;
        match self.gateway.data_path() {
            DataPath::Direct => self.gateway.direct().truncate(&remote, size),
            DataPath::Buffered | DataPath::Preload => {
                self.gateway.buffered().truncate(&remote, size)
            }
        }
        .map_err(|e| errno("truncate", e))
    }

    pub fn opendir(&self, path: &str) -> OpResult<HandleId> {
        let remote = self.remote_path(path)?;
        let dir = self
            .gateway
            .registry()
            .open_dir(&remote)
            .map_err(|e| errno("opendir", e))?;
        Ok(dir.id())
    }

    pub fn readdir(&self, fh: HandleId) -> OpResult<Vec<DirEntry>> {
        let registry = self.gateway.registry();
        let dir = registry.get_dir(fh).map_err(|e| errno("readdir", e))?;
        let entries = registry.read_dir(&dir).map_err(|e| errno("readdir", e))?;
        Ok(entries
            .into_iter()
            .map(|e| DirEntry {
                name: e.name,
                kind: e.kind,
            })
            .collect())
    }

    pub fn releasedir(&self, fh: HandleId) -> OpResult<()> {
        let registry = self.gateway.registry();
        let dir = registry.get_dir(fh).map_err(|e| errno("releasedir", e))?;
        registry.close_dir(&dir);
        Ok(())
    }
}
