//! Unbuffered data path straight to the remote store.

use std::sync::Arc;

use fedfs_rpc::{ObjStat, OpenFlags};
use tracing::debug;

use crate::error::Result;
use crate::pool::ConnClass;
use crate::registry::{FileHandle, Registry};

pub struct DirectFs {
    registry: Arc<Registry>,
}

impl DirectFs {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn getattr(&self, path: &str) -> Result<ObjStat> {
        let lease = self.registry.pool().acquire(ConnClass::ShortOp)?;
        let stat = lease.lock().call("stat", |s| s.obj_stat(path))?;
        Ok(stat)
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<Arc<FileHandle>> {
        self.registry.open(path, flags)
    }

    /// Reads until `size` bytes are gathered or the remote reports end of file.
    pub fn read(&self, handle: &FileHandle, offset: u64, size: usize) -> Result<Vec<u8>> {
        let mut guard = handle.lock();
        let mut out = Vec::new();
        while out.len() < size {
            let chunk = guard.read_at(offset + out.len() as u64, size - out.len())?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub fn write(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> Result<usize> {
        let mut guard = handle.lock();
        let mut written = 0;
        while written < data.len() {
            let n = guard.write_at(offset + written as u64, &data[written..])?;
            if n == 0 {
                break;
            }
            written += n;
        }
        Ok(written)
    }

    /// Commits written data server-side by reopening the descriptor.
    pub fn flush(&self, handle: &FileHandle) -> Result<()> {
        if !handle.flags().is_writable() {
            return Ok(());
        }
        debug!(fh = handle.id(), path = handle.path(), "flush by reopen");
        self.registry.reopen(handle)
    }

    pub fn close(&self, handle: &FileHandle) {
        self.registry.close(handle);
    }

    /// Creates an empty object and opens it read-write.
    pub fn create(&self, path: &str, mode: u32) -> Result<Arc<FileHandle>> {
        {
            let lease = self.registry.pool().acquire(ConnClass::ShortOp)?;
            let mut session = lease.lock();
            let fd = session.call("create", |s| s.obj_create(path, mode))?;
            session.call_once("close", |s| s.obj_close(fd))?;
        }
        debug!(path, mode, "created remote object");
        self.registry.open(path, OpenFlags::ReadWrite)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let lease = self.registry.pool().acquire(ConnClass::ShortOp)?;
        let result = lease.lock().call("unlink", |s| s.obj_unlink(path));
        result
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let lease = self.registry.pool().acquire(ConnClass::ShortOp)?;
        let result = lease.lock().call("truncate", |s| s.obj_truncate(path, size));
        result
    }
}
