//! Open file and directory handles.
//!
//! A handle binds a path to a remote descriptor on one pooled connection.
//! Locks are always taken in the order index, handle, connection: the index
//! hands out `Arc`s without holding its shard lock, and [`HandleGuard`] takes
//! the handle lock before the connection lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use fedfs_rpc::{CollEntry, CollHandle, OpenFlags, RemoteFd};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::pool::{exhausted, ConnClass, ConnLease, Connection, ConnectionPool, SessionGuard};

pub type HandleId = u64;

struct FileState {
    remote_fd: Option<RemoteFd>,
    last_pointer: Option<u64>,
    generation: u64,
    closed: bool,
}

/// An open remote file.
pub struct FileHandle {
    id: HandleId,
    path: String,
    flags: OpenFlags,
    lease: ConnLease,
    state: Mutex<FileState>,
}

impl FileHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn connection(&self) -> &Arc<Connection> {
        self.lease.connection()
    }

    /// Last known remote file pointer, `None` when unknown.
    pub fn last_pointer(&self) -> Option<u64> {
        self.state.lock().last_pointer
    }

    /// Serializes use of this handle, then of its connection.
    pub fn lock(&self) -> HandleGuard<'_> {
        let state = self.state.lock();
        let session = self.lease.lock();
        HandleGuard {
            handle: self,
            state,
            session,
        }
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("conn", &self.lease.id())
            .finish()
    }
}

/// Exclusive use of a handle and its connection.
pub struct HandleGuard<'a> {
    handle: &'a FileHandle,
    state: MutexGuard<'a, FileState>,
    session: SessionGuard<'a>,
}

impl HandleGuard<'_> {
    /// Makes sure the descriptor belongs to the current session, reopening
    /// it after a reconnect.
    fn ensure_fd(&mut self) -> Result<RemoteFd> {
        if self.state.closed {
            return Err(GatewayError::BadHandle { fh: self.handle.id });
        }
        let generation = self.session.generation();
        if let Some(fd) = self.state.remote_fd {
            if self.state.generation == generation {
                return Ok(fd);
            }
        }

        let path = self.handle.path.as_str();
        let flags = self.handle.flags;
        debug!(fh = self.handle.id, path, "reopening descriptor on new session");
        self.state.remote_fd = None;
        self.state.last_pointer = None;
        let fd = self.session.call_once("open", |s| s.obj_open(path, flags))?;
        self.state.remote_fd = Some(fd);
        self.state.last_pointer = Some(0);
        self.state.generation = self.session.generation();
        Ok(fd)
    }

    fn with_retry<T, F>(&mut self, op: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Self) -> Result<T>,
    {
        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.state.last_pointer = None;
                if !e.is_transport() {
                    return Err(e);
                }
                warn!(fh = self.handle.id, op, error = %e, "transport error, reconnecting");
                self.session.reconnect()?;
                f(self).map_err(|e| {
                    self.state.last_pointer = None;
                    exhausted(op, e)
                })
            }
        }
    }

    fn seek_to(&mut self, fd: RemoteFd, offset: u64) -> Result<()> {
        if self.state.last_pointer != Some(offset) {
            self.session.call_once("seek", |s| s.obj_seek(fd, offset))?;
            self.state.last_pointer = Some(offset);
        }
        Ok(())
    }

    /// Reads up to `len` bytes at `offset`. Short only at end of file.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.with_retry("read", |g| {
            let fd = g.ensure_fd()?;
            g.seek_to(fd, offset)?;
            let data = g.session.call_once("read", |s| s.obj_read(fd, len))?;
            g.state.last_pointer = Some(offset + data.len() as u64);
            Ok(data)
        })
    }

    /// Writes `data` at `offset`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        if !self.handle.flags.is_writable() {
            return Err(GatewayError::InvalidArgument {
                msg: format!("handle {} is not open for writing", self.handle.id),
            });
        }
        self.with_retry("write", |g| {
            let fd = g.ensure_fd()?;
            g.seek_to(fd, offset)?;
            let written = g.session.call_once("write", |s| s.obj_write(fd, data))?;
            g.state.last_pointer = Some(offset + written as u64);
            Ok(written)
        })
    }

    /// Closes and reopens the descriptor on the same path and flags.
    pub fn reopen(&mut self) -> Result<()> {
        self.close_remote();
        self.with_retry("open", |g| g.ensure_fd().map(|_| ()))
    }

    /// Closes the descriptor for good. Later I/O fails with `BadHandle`
    /// instead of reopening.
    fn close(&mut self) {
        self.close_remote();
        self.state.closed = true;
    }

    /// Best-effort remote close. Failures are logged, never returned.
    fn close_remote(&mut self) {
        let Some(fd) = self.state.remote_fd.take() else {
            return;
        };
        self.state.last_pointer = None;
        if self.state.generation != self.session.generation() {
            return;
        }
        match self.session.call_once("close", |s| s.obj_close(fd)) {
            Ok(()) => {}
            Err(e) if e.is_transport() => {
                warn!(fh = self.handle.id, error = %e, "close lost transport, reconnecting");
                // The descriptor died with the session.
                if let Err(e) = self.session.reconnect() {
                    warn!(fh = self.handle.id, error = %e, "reconnect after close failed");
                }
            }
            Err(e) => {
                warn!(fh = self.handle.id, path = %self.handle.path, error = %e, "remote close failed");
            }
        }
    }
}

struct DirState {
    coll: Option<CollHandle>,
    generation: u64,
}

/// An open remote collection.
pub struct DirHandle {
    id: HandleId,
    path: String,
    lease: ConnLease,
    state: Mutex<DirState>,
}

impl DirHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Process-wide table of open handles.
pub struct Registry {
    pool: Arc<ConnectionPool>,
    files: DashMap<HandleId, Arc<FileHandle>>,
    dirs: DashMap<HandleId, Arc<DirHandle>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            files: DashMap::new(),
            dirs: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Opens `path` on a FileIO connection.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<Arc<FileHandle>> {
        let lease = self.pool.acquire(ConnClass::FileIo)?;
        self.open_on(lease, path, flags)
    }

    /// Opens `path` on an already leased connection. The handle keeps the lease.
    pub fn open_on(&self, lease: ConnLease, path: &str, flags: OpenFlags) -> Result<Arc<FileHandle>> {
        let (fd, generation) = {
            let mut session = lease.lock();
            let fd = session.call("open", |s| s.obj_open(path, flags))?;
            (fd, session.generation())
        };
        Ok(self.insert(lease, path, flags, fd, generation))
    }

    /// Registers a descriptor that was opened by some other call, such as create.
    pub(crate) fn insert(
        &self,
        lease: ConnLease,
        path: &str,
        flags: OpenFlags,
        fd: RemoteFd,
        generation: u64,
    ) -> Arc<FileHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(FileHandle {
            id,
            path: path.to_string(),
            flags,
            lease,
            state: Mutex::new(FileState {
                remote_fd: Some(fd),
                last_pointer: None,
                generation,
                closed: false,
            }),
        });
        self.files.insert(id, Arc::clone(&handle));
        debug!(fh = id, path, ?flags, conn = handle.lease.id(), "handle opened");
        handle
    }

    pub fn get(&self, id: HandleId) -> Result<Arc<FileHandle>> {
        self.files
            .get(&id)
            .map(|h| Arc::clone(h.value()))
            .ok_or(GatewayError::BadHandle { fh: id })
    }

    /// Recovers a handle by closing and reopening its remote descriptor.
    pub fn reopen(&self, handle: &FileHandle) -> Result<()> {
        handle.lock().reopen()
    }

    /// Closes the remote descriptor and always removes the handle.
    pub fn close(&self, handle: &FileHandle) {
        handle.lock().close();
        self.files.remove(&handle.id);
        debug!(fh = handle.id, path = %handle.path, "handle closed");
    }

    pub fn close_id(&self, id: HandleId) -> Result<()> {
        let handle = self.get(id)?;
        self.close(&handle);
        Ok(())
    }

    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    pub fn file_ids(&self) -> Vec<HandleId> {
        let mut ids: Vec<HandleId> = self.files.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of open file handles per path.
    pub fn open_paths(&self) -> HashMap<String, usize> {
        let mut paths = HashMap::new();
        for entry in self.files.iter() {
            *paths.entry(entry.value().path.clone()).or_insert(0) += 1;
        }
        paths
    }

    pub fn open_dir(&self, path: &str) -> Result<Arc<DirHandle>> {
        let lease = self.pool.acquire(ConnClass::ShortOp)?;
        let (coll, generation) = {
            let mut session = lease.lock();
            let coll = session.call("coll_open", |s| s.coll_open(path))?;
            (coll, session.generation())
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dir = Arc::new(DirHandle {
            id,
            path: path.to_string(),
            lease,
            state: Mutex::new(DirState {
                coll: Some(coll),
                generation,
            }),
        });
        self.dirs.insert(id, Arc::clone(&dir));
        debug!(fh = id, path, "directory opened");
        Ok(dir)
    }

    pub fn get_dir(&self, id: HandleId) -> Result<Arc<DirHandle>> {
        self.dirs
            .get(&id)
            .map(|d| Arc::clone(d.value()))
            .ok_or(GatewayError::BadHandle { fh: id })
    }

    /// Returns the remaining members of the collection. After a reconnect the
    /// listing restarts from the first member.
    pub fn read_dir(&self, dir: &DirHandle) -> Result<Vec<CollEntry>> {
        let mut state = dir.state.lock();
        let mut session = dir.lease.lock();
        let path = dir.path.as_str();

        for attempt in 0..2 {
            if state.coll.is_none() || state.generation != session.generation() {
                let coll = session.call("coll_open", |s| s.coll_open(path))?;
                state.coll = Some(coll);
                state.generation = session.generation();
            }
            let Some(coll) = state.coll else {
                break;
            };

            let mut entries = Vec::new();
            let listed = loop {
                match session.call_once("coll_read", |s| s.coll_read(coll)) {
                    Ok(Some(entry)) => entries.push(entry),
                    Ok(None) => break Ok(entries),
                    Err(e) => break Err(e),
                }
            };
            match listed {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_transport() && attempt == 0 => {
                    warn!(fh = dir.id, path, error = %e, "listing lost transport, restarting");
                    state.coll = None;
                    session.reconnect()?;
                }
                Err(e) => return Err(exhausted("coll_read", e)),
            }
        }
        Err(GatewayError::RemoteUnavailable {
            reason: format!("listing {} failed after reconnect", path),
        })
    }

    pub fn close_dir(&self, dir: &DirHandle) {
        {
            let mut state = dir.state.lock();
            let mut session = dir.lease.lock();
            if let Some(coll) = state.coll.take() {
                if state.generation == session.generation() {
                    if let Err(e) = session.call_once("coll_close", |s| s.coll_close(coll)) {
                        warn!(fh = dir.id, path = %dir.path, error = %e, "collection close failed");
                    }
                }
            }
        }
        self.dirs.remove(&dir.id);
    }

    /// Closes every open handle. Used at shutdown.
    pub fn close_all(&self) -> usize {
        let files: Vec<Arc<FileHandle>> = self.files.iter().map(|e| Arc::clone(e.value())).collect();
        let dirs: Vec<Arc<DirHandle>> = self.dirs.iter().map(|e| Arc::clone(e.value())).collect();
        let count = files.len() + dirs.len();
        for handle in files {
            self.close(&handle);
        }
        for dir in dirs {
            self.close_dir(&dir);
        }
        if count > 0 {
            debug!("Closed {} handles at shutdown", count);
        }
        count
    }
}
