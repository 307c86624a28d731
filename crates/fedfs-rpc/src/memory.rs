//! In-memory federation store.
//!
//! [`MemoryStore`] implements the full remote call surface in process:
//! objects and collections live in a shared map, and each session keeps its
//! own descriptor table, so descriptors die with the session exactly as they
//! do against a real server. The store counts every call and can inject
//! faults (refused connects, transport errors, failing reads, slow reads),
//! which is what the gateway's tests drive.

use crate::error::{Result, RpcError};
use crate::session::{
    CallAbort, CollEntry, CollHandle, Connector, ObjKind, ObjStat, OpenFlags, RemoteFd,
    RemoteSession, ServerAddr,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Status returned for a descriptor unknown to the session.
pub const STATUS_BAD_DESCRIPTOR: i32 = -1_001;
/// Status returned when a call is made before login.
pub const STATUS_NOT_AUTHENTICATED: i32 = -1_002;
/// Status returned when creating an object that already exists.
pub const STATUS_ALREADY_EXISTS: i32 = -1_003;
/// Status returned when a data call targets a collection.
pub const STATUS_IS_COLLECTION: i32 = -1_004;
/// Status returned for an injected read failure.
pub const STATUS_READ_FAILED: i32 = -1_005;
/// Status returned when writing through a read-only descriptor.
pub const STATUS_NOT_WRITABLE: i32 = -1_006;

/// Call counters, as observed by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// Sessions established.
    pub connects: u64,
    /// Successful logins.
    pub logins: u64,
    /// Sessions torn down.
    pub disconnects: u64,
    /// Object opens.
    pub opens: u64,
    /// Object closes.
    pub closes: u64,
    /// Seeks.
    pub seeks: u64,
    /// Successful reads.
    pub reads: u64,
    /// Bytes returned by reads.
    pub bytes_read: u64,
    /// Successful writes.
    pub writes: u64,
    /// Bytes accepted by writes.
    pub bytes_written: u64,
    /// Object creations.
    pub creates: u64,
    /// Object removals.
    pub unlinks: u64,
    /// Renames.
    pub renames: u64,
    /// Truncations.
    pub truncates: u64,
    /// Attribute lookups.
    pub stats: u64,
    /// Collection opens.
    pub coll_opens: u64,
    /// Keep-alive calls.
    pub noops: u64,
}

#[derive(Debug, Clone)]
struct Object {
    data: Vec<u8>,
    mode: u32,
    ctime: SystemTime,
    mtime: SystemTime,
}

impl Object {
    fn new(data: Vec<u8>, mode: u32) -> Self {
        let now = SystemTime::now();
        Self {
            data,
            mode,
            ctime: now,
            mtime: now,
        }
    }
}

#[derive(Default)]
struct Namespace {
    objects: BTreeMap<String, Object>,
    collections: BTreeSet<String>,
    open_ordinals: HashMap<String, usize>,
}

impl Namespace {
    fn is_collection(&self, path: &str) -> bool {
        path == "/" || self.collections.contains(path)
    }

    fn add_parents(&mut self, path: &str) {
        let mut current = parent_of(path);
        while let Some(parent) = current {
            if parent != "/" {
                self.collections.insert(parent.to_string());
            }
            current = parent_of(parent);
        }
    }

    fn children(&self, path: &str) -> Vec<CollEntry> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let direct = |candidate: &str| {
            candidate
                .strip_prefix(&prefix)
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(str::to_string)
        };

        let mut entries: Vec<CollEntry> = self
            .collections
            .iter()
            .filter_map(|c| direct(c))
            .map(|name| CollEntry {
                name,
                kind: ObjKind::Collection,
            })
            .collect();
        entries.extend(self.objects.keys().filter_map(|o| direct(o)).map(|name| {
            CollEntry {
                name,
                kind: ObjKind::File,
            }
        }));
        entries
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

#[derive(Default)]
struct Faults {
    refuse_connects: usize,
    transport_errors: HashMap<&'static str, usize>,
    read_failures: Vec<(String, usize)>,
    slow_reads: usize,
    slow_read_delay: Duration,
    read_latency: Duration,
}

struct StoreInner {
    namespace: Mutex<Namespace>,
    faults: Mutex<Faults>,
    counts: Mutex<CallCounts>,
    next_session: AtomicU64,
    live_sessions: AtomicUsize,
}

/// A shared in-memory federation. Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store containing only the root collection.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                namespace: Mutex::new(Namespace::default()),
                faults: Mutex::new(Faults::default()),
                counts: Mutex::new(CallCounts::default()),
                next_session: AtomicU64::new(1),
                live_sessions: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns a connector producing sessions against this store.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
        }
    }

    /// Stores an object, creating missing parent collections.
    pub fn put(&self, path: &str, data: &[u8]) {
        let mut ns = self.inner.namespace.lock();
        ns.add_parents(path);
        ns.objects
            .insert(path.to_string(), Object::new(data.to_vec(), 0o644));
    }

    /// Returns a copy of an object's contents.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.inner
            .namespace
            .lock()
            .objects
            .get(path)
            .map(|o| o.data.clone())
    }

    /// Creates a collection and its missing parents.
    pub fn mkdir(&self, path: &str) {
        let mut ns = self.inner.namespace.lock();
        ns.add_parents(path);
        ns.collections.insert(path.to_string());
    }

    /// Whether an object or collection exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        let ns = self.inner.namespace.lock();
        ns.objects.contains_key(path) || ns.is_collection(path)
    }

    /// Snapshot of the call counters.
    pub fn counts(&self) -> CallCounts {
        self.inner.counts.lock().clone()
    }

    /// Number of sessions connected and not yet disconnected.
    pub fn live_sessions(&self) -> usize {
        self.inner.live_sessions.load(Ordering::SeqCst)
    }

    /// Makes the next `n` connection attempts fail.
    pub fn refuse_connects(&self, n: usize) {
        self.inner.faults.lock().refuse_connects = n;
    }

    /// Makes the next `n` calls of `op` break their session with a transport error.
    ///
    /// `op` is one of `open`, `close`, `seek`, `read`, `write`, `create`,
    /// `unlink`, `rename`, `truncate`, `stat`, `coll_open`, `coll_read`,
    /// `coll_close`, `noop`.
    pub fn inject_transport_errors(&self, op: &'static str, n: usize) {
        self.inner.faults.lock().transport_errors.insert(op, n);
    }

    /// Makes every read fail on descriptors of `path` whose open ordinal
    /// (0 for the first open of that path) is at least `ordinal`.
    pub fn fail_reads_from_open(&self, path: &str, ordinal: usize) {
        self.inner
            .faults
            .lock()
            .read_failures
            .push((path.to_string(), ordinal));
    }

    /// Adds a fixed delay to every read.
    pub fn set_read_latency(&self, delay: Duration) {
        self.inner.faults.lock().read_latency = delay;
    }

    /// Delays only the next `n` reads.
    pub fn slow_next_reads(&self, n: usize, delay: Duration) {
        let mut faults = self.inner.faults.lock();
        faults.slow_reads = n;
        faults.slow_read_delay = delay;
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        *self.inner.faults.lock() = Faults::default();
    }
}

/// Produces [`MemorySession`]s.
#[derive(Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
}

impl Connector for MemoryConnector {
    fn connect(&self, addr: &ServerAddr) -> Result<Box<dyn RemoteSession>> {
        let inner = &self.store.inner;
        {
            let mut faults = inner.faults.lock();
            if faults.refuse_connects > 0 {
                faults.refuse_connects -= 1;
                return Err(RpcError::Unreachable {
                    addr: addr.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
        }

        inner.counts.lock().connects += 1;
        inner.live_sessions.fetch_add(1, Ordering::SeqCst);
        let id = inner.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, %addr, "memory session connected");

        Ok(Box::new(MemorySession {
            id,
            store: Arc::clone(inner),
            broken: Arc::new(BrokenFlag::default()),
            logged_in: false,
            closed: false,
            next_fd: 3,
            fds: HashMap::new(),
            cursors: HashMap::new(),
        }))
    }
}

#[derive(Default)]
struct BrokenFlag(AtomicBool);

impl CallAbort for BrokenFlag {
    fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct OpenObject {
    path: String,
    flags: OpenFlags,
    pos: u64,
    ordinal: usize,
}

struct Cursor {
    entries: Vec<CollEntry>,
    next: usize,
}

/// One session against a [`MemoryStore`].
pub struct MemorySession {
    id: u64,
    store: Arc<StoreInner>,
    broken: Arc<BrokenFlag>,
    logged_in: bool,
    closed: bool,
    next_fd: i32,
    fds: HashMap<i32, OpenObject>,
    cursors: HashMap<i32, Cursor>,
}

impl MemorySession {
    fn begin(&mut self, op: &'static str) -> Result<()> {
        if self.closed || self.broken.0.load(Ordering::SeqCst) {
            return Err(RpcError::transport(op, "session transport closed"));
        }
        {
            let mut faults = self.store.faults.lock();
            if let Some(remaining) = faults.transport_errors.get_mut(op) {
                if *remaining > 0 {
                    *remaining -= 1;
                    drop(faults);
                    self.broken.abort();
                    return Err(RpcError::transport(op, "injected header corruption"));
                }
            }
        }
        if !self.logged_in {
            return Err(RpcError::Protocol {
                op,
                code: STATUS_NOT_AUTHENTICATED,
            });
        }
        Ok(())
    }

    fn check_alive(&self, op: &'static str) -> Result<()> {
        if self.broken.0.load(Ordering::SeqCst) {
            return Err(RpcError::transport(op, "transport closed during call"));
        }
        Ok(())
    }

    fn alloc_fd(&mut self) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }

    fn open_object(&mut self, path: &str, flags: OpenFlags) -> RemoteFd {
        let ordinal = {
            let mut ns = self.store.namespace.lock();
            let counter = ns.open_ordinals.entry(path.to_string()).or_insert(0);
            let ordinal = *counter;
            *counter += 1;
            ordinal
        };
        let fd = self.alloc_fd();
        self.fds.insert(
            fd,
            OpenObject {
                path: path.to_string(),
                flags,
                pos: 0,
                ordinal,
            },
        );
        RemoteFd(fd)
    }

    fn bad_fd(op: &'static str) -> RpcError {
        RpcError::Protocol {
            op,
            code: STATUS_BAD_DESCRIPTOR,
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.store.live_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl RemoteSession for MemorySession {
    fn login(&mut self) -> Result<()> {
        if self.closed || self.broken.0.load(Ordering::SeqCst) {
            return Err(RpcError::transport("login", "session transport closed"));
        }
        self.store.counts.lock().logins += 1;
        self.logged_in = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.fds.clear();
        self.cursors.clear();
        self.store.counts.lock().disconnects += 1;
        self.store.live_sessions.fetch_sub(1, Ordering::SeqCst);
        debug!(session = self.id, "memory session disconnected");
    }

    fn abort_handle(&self) -> Arc<dyn CallAbort> {
        self.broken.clone()
    }

    fn obj_open(&mut self, path: &str, flags: OpenFlags) -> Result<RemoteFd> {
        self.begin("open")?;
        self.store.counts.lock().opens += 1;
        {
            let ns = self.store.namespace.lock();
            if ns.is_collection(path) {
                return Err(RpcError::Protocol {
                    op: "open",
                    code: STATUS_IS_COLLECTION,
                });
            }
            if !ns.objects.contains_key(path) {
                return Err(RpcError::NotFound {
                    path: path.to_string(),
                });
            }
        }
        Ok(self.open_object(path, flags))
    }

    fn obj_close(&mut self, fd: RemoteFd) -> Result<()> {
        self.begin("close")?;
        self.store.counts.lock().closes += 1;
        self.fds
            .remove(&fd.0)
            .map(|_| ())
            .ok_or_else(|| Self::bad_fd("close"))
    }

    fn obj_seek(&mut self, fd: RemoteFd, offset: u64) -> Result<u64> {
        self.begin("seek")?;
        self.store.counts.lock().seeks += 1;
        let obj = self.fds.get_mut(&fd.0).ok_or_else(|| Self::bad_fd("seek"))?;
        obj.pos = offset;
        Ok(offset)
    }

    fn obj_read(&mut self, fd: RemoteFd, len: usize) -> Result<Vec<u8>> {
        self.begin("read")?;
        let (path, ordinal, pos, flags) = {
            let obj = self.fds.get(&fd.0).ok_or_else(|| Self::bad_fd("read"))?;
            (obj.path.clone(), obj.ordinal, obj.pos, obj.flags)
        };
        if !flags.is_readable() {
            return Err(RpcError::Protocol {
                op: "read",
                code: STATUS_BAD_DESCRIPTOR,
            });
        }

        let delay = {
            let mut faults = self.store.faults.lock();
            if faults
                .read_failures
                .iter()
                .any(|(p, from)| *p == path && ordinal >= *from)
            {
                return Err(RpcError::Protocol {
                    op: "read",
                    code: STATUS_READ_FAILED,
                });
            }
            let mut delay = faults.read_latency;
            if faults.slow_reads > 0 {
                faults.slow_reads -= 1;
                delay += faults.slow_read_delay;
            }
            delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
            self.check_alive("read")?;
        }

        let chunk = {
            let ns = self.store.namespace.lock();
            let object = ns.objects.get(&path).ok_or_else(|| RpcError::NotFound {
                path: path.clone(),
            })?;
            let start = (pos as usize).min(object.data.len());
            let end = start.saturating_add(len).min(object.data.len());
            object.data[start..end].to_vec()
        };

        if let Some(obj) = self.fds.get_mut(&fd.0) {
            obj.pos += chunk.len() as u64;
        }
        let mut counts = self.store.counts.lock();
        counts.reads += 1;
        counts.bytes_read += chunk.len() as u64;
        Ok(chunk)
    }

    fn obj_write(&mut self, fd: RemoteFd, data: &[u8]) -> Result<usize> {
        self.begin("write")?;
        let (path, pos, flags) = {
            let obj = self.fds.get(&fd.0).ok_or_else(|| Self::bad_fd("write"))?;
            (obj.path.clone(), obj.pos, obj.flags)
        };
        if !flags.is_writable() {
            return Err(RpcError::Protocol {
                op: "write",
                code: STATUS_NOT_WRITABLE,
            });
        }

        {
            let mut ns = self.store.namespace.lock();
            let object = ns
                .objects
                .get_mut(&path)
                .ok_or_else(|| RpcError::NotFound { path: path.clone() })?;
            let start = pos as usize;
            let end = start + data.len();
            if object.data.len() < end {
                object.data.resize(end, 0);
            }
            object.data[start..end].copy_from_slice(data);
            object.mtime = SystemTime::now();
        }

        if let Some(obj) = self.fds.get_mut(&fd.0) {
            obj.pos += data.len() as u64;
        }
        let mut counts = self.store.counts.lock();
        counts.writes += 1;
        counts.bytes_written += data.len() as u64;
        Ok(data.len())
    }

    fn obj_create(&mut self, path: &str, mode: u32) -> Result<RemoteFd> {
        self.begin("create")?;
        self.store.counts.lock().creates += 1;
        {
            let mut ns = self.store.namespace.lock();
            if ns.objects.contains_key(path) || ns.is_collection(path) {
                return Err(RpcError::Protocol {
                    op: "create",
                    code: STATUS_ALREADY_EXISTS,
                });
            }
            match parent_of(path) {
                Some(parent) if ns.is_collection(parent) => {}
                _ => {
                    return Err(RpcError::NotFound {
                        path: path.to_string(),
                    })
                }
            }
            ns.objects
                .insert(path.to_string(), Object::new(Vec::new(), mode));
        }
        Ok(self.open_object(path, OpenFlags::ReadWrite))
    }

    fn obj_unlink(&mut self, path: &str) -> Result<()> {
        self.begin("unlink")?;
        self.store.counts.lock().unlinks += 1;
        let mut ns = self.store.namespace.lock();
        ns.objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| RpcError::NotFound {
                path: path.to_string(),
            })
    }

    fn obj_rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.begin("rename")?;
        self.store.counts.lock().renames += 1;
        let mut ns = self.store.namespace.lock();
        if let Some(object) = ns.objects.remove(from) {
            ns.objects.insert(to.to_string(), object);
            return Ok(());
        }
        if ns.collections.remove(from) {
            let prefix = format!("{}/", from);
            let moved: Vec<String> = ns
                .objects
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            for old in moved {
                if let Some(object) = ns.objects.remove(&old) {
                    ns.objects
                        .insert(format!("{}/{}", to, &old[prefix.len()..]), object);
                }
            }
            ns.collections.insert(to.to_string());
            return Ok(());
        }
        Err(RpcError::NotFound {
            path: from.to_string(),
        })
    }

    fn obj_truncate(&mut self, path: &str, size: u64) -> Result<()> {
        self.begin("truncate")?;
        self.store.counts.lock().truncates += 1;
        let mut ns = self.store.namespace.lock();
        let object = ns
            .objects
            .get_mut(path)
            .ok_or_else(|| RpcError::NotFound {
                path: path.to_string(),
            })?;
        object.data.resize(size as usize, 0);
        object.mtime = SystemTime::now();
        Ok(())
    }

    fn obj_stat(&mut self, path: &str) -> Result<ObjStat> {
        self.begin("stat")?;
        self.store.counts.lock().stats += 1;
        let ns = self.store.namespace.lock();
        if let Some(object) = ns.objects.get(path) {
            return Ok(ObjStat {
                kind: ObjKind::File,
                size: object.data.len() as u64,
                mode: object.mode,
                ctime: object.ctime,
                mtime: object.mtime,
            });
        }
        if ns.is_collection(path) {
            let now = SystemTime::now();
            return Ok(ObjStat {
                kind: ObjKind::Collection,
                size: 0,
                mode: 0o755,
                ctime: now,
                mtime: now,
            });
        }
        Err(RpcError::NotFound {
            path: path.to_string(),
        })
    }

    fn coll_open(&mut self, path: &str) -> Result<CollHandle> {
        self.begin("coll_open")?;
        self.store.counts.lock().coll_opens += 1;
        let entries = {
            let ns = self.store.namespace.lock();
            if !ns.is_collection(path) {
                return Err(RpcError::NotFound {
                    path: path.to_string(),
                });
            }
            ns.children(path)
        };
        let fd = self.alloc_fd();
        self.cursors.insert(fd, Cursor { entries, next: 0 });
        Ok(CollHandle(fd))
    }

    fn coll_read(&mut self, handle: CollHandle) -> Result<Option<CollEntry>> {
        self.begin("coll_read")?;
        let cursor = self
            .cursors
            .get_mut(&handle.0)
            .ok_or_else(|| Self::bad_fd("coll_read"))?;
        let entry = cursor.entries.get(cursor.next).cloned();
        if entry.is_some() {
            cursor.next += 1;
        }
        Ok(entry)
    }

    fn coll_close(&mut self, handle: CollHandle) -> Result<()> {
        self.begin("coll_close")?;
        self.cursors
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| Self::bad_fd("coll_close"))
    }

    fn noop(&mut self) -> Result<()> {
        self.begin("noop")?;
        self.store.counts.lock().noops += 1;
        Ok(())
    }
}
