//! Sliding-window read-ahead.
//!
//! Every file opened for reading gets a [`PreloadSet`]: a small window of
//! background fetches for the blocks following the one last read. Each fetch
//! runs on its own thread with its own read-only handle, and warms that
//! handle's block cache. A foreground read joins only the fetch for the block
//! it needs and copies out of the fetch handle's cache. Handles of finished
//! fetches that slide out of the window are recycled for new fetches.
//!
//! A failed fetch never fails a read: the foreground falls back to a plain
//! buffered read of the whole request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use fedfs_rpc::{ObjStat, OpenFlags};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::block::BlockId;
use crate::buffered::BufferedFs;
use crate::error::Result;
use crate::registry::{FileHandle, HandleId};

#[derive(Debug, Clone)]
pub struct PreloadConfig {
    /// Number of blocks fetched ahead of the last read block.
    pub window: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self { window: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Init,
    Running,
    Completed,
    TaskFailed,
    CreationFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadStats {
    pub tasks_started: u64,
    pub hits: u64,
    pub misses: u64,
    pub fallbacks: u64,
    pub recycled: u64,
}

#[derive(Default)]
struct Counters {
    tasks_started: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    fallbacks: AtomicU64,
    recycled: AtomicU64,
}

struct TaskState {
    status: BlockStatus,
    handle: Option<Arc<FileHandle>>,
}

/// One background fetch of one block.
struct PreloadBlock {
    block: BlockId,
    state: Arc<Mutex<TaskState>>,
    task: Option<JoinHandle<()>>,
    fs: Arc<BufferedFs>,
}

impl PreloadBlock {
    fn status(&self) -> BlockStatus {
        self.state.lock().status
    }

    fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if task.join().is_err() {
                error!(block = self.block, "preload task panicked");
                self.state.lock().status = BlockStatus::TaskFailed;
            }
        }
    }

    /// Detaches the fetch handle of a joined, successful fetch.
    fn take_reusable(&mut self) -> Option<Arc<FileHandle>> {
        if self.task.is_some() {
            return None;
        }
        let mut state = self.state.lock();
        if state.status != BlockStatus::Completed {
            return None;
        }
        state.handle.take()
    }

    /// Bytes of the fetched block, or `None` if the fetch did not succeed.
    fn read(&mut self) -> Option<Vec<u8>> {
        self.join();
        let handle = {
            let state = self.state.lock();
            if state.status != BlockStatus::Completed {
                return None;
            }
            state.handle.clone()?
        };
        match self.fs.read_block(&handle, self.block) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(block = self.block, error = %e, "reading preloaded block failed");
                None
            }
        }
    }
}

impl Drop for PreloadBlock {
    fn drop(&mut self) {
        self.join();
        let handle = self.state.lock().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = self.fs.close(&handle) {
                warn!(fh = handle.id(), error = %e, "closing preload handle failed");
            }
        }
    }
}

/// Read-ahead state of one open file.
pub struct PreloadSet {
    path: String,
    blocks: Mutex<Vec<PreloadBlock>>,
}

impl PreloadSet {
    pub fn path(&self) -> &str {
        &self.path
    }
}

pub struct PreloadFs {
    fs: Arc<BufferedFs>,
    config: PreloadConfig,
    sets: DashMap<HandleId, Arc<PreloadSet>>,
    counters: Counters,
}

impl PreloadFs {
    pub fn new(fs: Arc<BufferedFs>, config: PreloadConfig) -> Self {
        debug!("Initializing preload engine: window={}", config.window);
        Self {
            fs,
            config,
            sets: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn buffered(&self) -> &Arc<BufferedFs> {
        &self.fs
    }

    pub fn config(&self) -> &PreloadConfig {
        &self.config
    }

    pub fn getattr(&self, path: &str) -> Result<ObjStat> {
        self.fs.getattr(path)
    }

    /// Opens through the buffered layer and, for readable handles, starts
    /// fetching the first `window` blocks.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<Arc<FileHandle>> {
        let handle = self.fs.open(path, flags)?;
        if flags.is_readable() {
            let set = Arc::new(PreloadSet {
                path: path.to_string(),
                blocks: Mutex::new(Vec::with_capacity(self.config.window + 1)),
            });
            {
                let mut blocks = set.blocks.lock();
                for block in 0..self.config.window as BlockId {
                    if let Some(task) = self.start(&set.path, block, None) {
                        blocks.push(task);
                    }
                }
            }
            self.sets.insert(handle.id(), set);
        }
        Ok(handle)
    }

    pub fn create(&self, path: &str, mode: u32) -> Result<Arc<FileHandle>> {
        self.fs.create(path, mode)
    }

    fn start(
        &self,
        path: &str,
        block: BlockId,
        recycled: Option<Arc<FileHandle>>,
    ) -> Option<PreloadBlock> {
        if recycled.is_some() {
            self.counters.recycled.fetch_add(1, Ordering::Relaxed);
        }
        let state = Arc::new(Mutex::new(TaskState {
            status: BlockStatus::Init,
            handle: recycled,
        }));
        let mut entry = PreloadBlock {
            block,
            state: Arc::clone(&state),
            task: None,
            fs: Arc::clone(&self.fs),
        };

        let fs = Arc::clone(&self.fs);
        let task_path = path.to_string();
        state.lock().status = BlockStatus::Running;
        let spawned = thread::Builder::new()
            .name("fedfs-preload".to_string())
            .spawn(move || run_task(&fs, &task_path, block, &state));

        match spawned {
            Ok(task) => {
                entry.task = Some(task);
                self.counters.tasks_started.fetch_add(1, Ordering::Relaxed);
                debug!(path, block, "preload started");
                Some(entry)
            }
            Err(e) => {
                error!(path, block, error = %e, "cannot spawn preload task");
                entry.state.lock().status = BlockStatus::CreationFailed;
                None
            }
        }
    }

    /// The preloaded bytes of `block`, maintaining the window around it.
    fn read_preloaded(&self, set: &PreloadSet, block: BlockId) -> Option<Vec<u8>> {
        let window = self.config.window;
        let mut blocks = set.blocks.lock();

        let mut has_target = false;
        let mut ahead = vec![false; window];
        for entry in blocks.iter() {
            if entry.block == block {
                has_target = true;
            } else if entry.block > block && entry.block <= block + window as BlockId {
                ahead[(entry.block - block - 1) as usize] = true;
            }
        }

        let (evicted, kept): (Vec<PreloadBlock>, Vec<PreloadBlock>) = std::mem::take(&mut *blocks)
            .into_iter()
            .partition(|e| e.block < block || e.block > block + window as BlockId);
        *blocks = kept;

        let mut recycle = Vec::new();
        for mut entry in evicted {
            debug!(path = %set.path, block = entry.block, current = block, "evicting preload");
            entry.join();
            if let Some(handle) = entry.take_reusable() {
                recycle.push(handle);
            }
        }

        if has_target {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            if let Some(task) = self.start(&set.path, block, recycle.pop()) {
                blocks.push(task);
            }
        }

        let data = blocks
            .iter_mut()
            .find(|e| e.block == block)
            .and_then(|e| e.read());

        for (slot, present) in ahead.iter().enumerate() {
            if !present {
                let next = block + slot as BlockId + 1;
                if let Some(task) = self.start(&set.path, next, recycle.pop()) {
                    blocks.push(task);
                }
            }
        }

        for handle in recycle {
            if let Err(e) = self.fs.close(&handle) {
                warn!(fh = handle.id(), error = %e, "closing unused preload handle failed");
            }
        }
        data
    }

    /// Serves a read from the window, falling back to a buffered read of the
    /// full request if any needed block was not preloaded successfully.
    pub fn read(&self, handle: &FileHandle, offset: u64, size: usize) -> Result<Vec<u8>> {
        let set = match self.sets.get(&handle.id()) {
            Some(set) => Arc::clone(set.value()),
            None => return self.fs.read(handle, offset, size),
        };

        let block_size = self.fs.geometry().block_size() as usize;
        let mut out = Vec::with_capacity(size.min(block_size));
        for span in self.fs.geometry().spans(offset, size) {
            let Some(block) = self.read_preloaded(&set, span.block) else {
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    fh = handle.id(),
                    path = handle.path(),
                    block = span.block,
                    "preload unavailable, reading directly"
                );
                return self.fs.read(handle, offset, size);
            };
            if block.is_empty() {
                break;
            }
            let take = span.len.min(block.len().saturating_sub(span.in_block));
            if take == 0 {
                break;
            }
            out.extend_from_slice(&block[span.in_block..span.in_block + take]);
            if block.len() < block_size || take < span.len {
                break;
            }
        }
        Ok(out)
    }

    pub fn write(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> Result<usize> {
        self.fs.write(handle, offset, data)
    }

    pub fn flush(&self, handle: &FileHandle) -> Result<()> {
        self.fs.flush(handle)
    }

    pub fn fsync(&self, handle: &FileHandle) -> Result<()> {
        self.fs.fsync(handle)
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        self.fs.truncate(path, size)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        self.fs.unlink(path)
    }

    /// Closes the handle, then joins and releases its read-ahead.
    pub fn close(&self, handle: &FileHandle) -> Result<()> {
        let closed = self.fs.close(handle);
        self.sets.remove(&handle.id());
        closed
    }

    /// Block ids and states currently in the window of a handle, sorted.
    pub fn window(&self, fh: HandleId) -> Vec<(BlockId, BlockStatus)> {
        let Some(set) = self.sets.get(&fh).map(|s| Arc::clone(s.value())) else {
            return Vec::new();
        };
        let blocks = set.blocks.lock();
        let mut window: Vec<(BlockId, BlockStatus)> =
            blocks.iter().map(|e| (e.block, e.status())).collect();
        window.sort_by_key(|(block, _)| *block);
        window
    }

    /// Waits for every running fetch of a handle.
    pub fn wait_idle(&self, fh: HandleId) {
        if let Some(set) = self.sets.get(&fh).map(|s| Arc::clone(s.value())) {
            for entry in set.blocks.lock().iter_mut() {
                entry.join();
            }
        }
    }

    pub fn stats(&self) -> PreloadStats {
        PreloadStats {
            tasks_started: self.counters.tasks_started.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            recycled: self.counters.recycled.load(Ordering::Relaxed),
        }
    }

    /// Joins every fetch and closes every fetch handle.
    pub fn shutdown(&self) {
        let ids: Vec<HandleId> = self.sets.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.sets.remove(&id);
        }
    }
}

fn run_task(fs: &BufferedFs, path: &str, block: BlockId, state: &Mutex<TaskState>) {
    let existing = state.lock().handle.clone();
    let handle = match existing {
        Some(handle) => handle,
        None => match fs.open(path, OpenFlags::ReadOnly) {
            Ok(handle) => {
                state.lock().handle = Some(Arc::clone(&handle));
                handle
            }
            Err(e) => {
                error!(path, block, error = %e, "preload open failed");
                state.lock().status = BlockStatus::TaskFailed;
                return;
            }
        },
    };

    let status = match fs.read_block(&handle, block) {
        Ok(data) => {
            debug!(path, block, len = data.len(), "preload completed");
            BlockStatus::Completed
        }
        Err(e) => {
            error!(path, block, error = %e, "preload fetch failed");
            BlockStatus::TaskFailed
        }
    };
    state.lock().status = status;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direct::DirectFs;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::registry::Registry;
    use fedfs_rpc::memory::MemoryStore;
    use fedfs_rpc::ServerAddr;

    const BS: usize = 8;

    fn preload(store: &MemoryStore, window: usize) -> PreloadFs {
        let pool = ConnectionPool::new(
            PoolConfig::default(),
            Arc::new(store.connector()),
            ServerAddr::new("localhost", 1247, "rods", "tempZone"),
            None,
        );
        let registry = Arc::new(Registry::new(Arc::new(pool)));
        let buffered = Arc::new(BufferedFs::new(DirectFs::new(registry), BS as u64));
        PreloadFs::new(buffered, PreloadConfig { window })
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_open_for_read_starts_window() {
        let store = MemoryStore::new();
        store.put("/z/f", &content(64));
        let fs = preload(&store, 3);
        let h = fs.open("/z/f", OpenFlags::ReadOnly).unwrap();
        fs.wait_idle(h.id());
        assert_eq!(
            fs.window(h.id()),
            vec![
                (0, BlockStatus::Completed),
                (1, BlockStatus::Completed),
                (2, BlockStatus::Completed),
            ]
        );
        assert_eq!(fs.stats().tasks_started, 3);
    }

    #[test]
    fn test_open_for_write_starts_nothing() {
        let store = MemoryStore::new();
        store.put("/z/f", &content(64));
        let fs = preload(&store, 3);
        let h = fs.open("/z/f", OpenFlags::WriteOnly).unwrap();
        assert!(fs.window(h.id()).is_empty());
        assert_eq!(fs.stats().tasks_started, 0);
    }

    #[test]
    fn test_read_block_zero_slides_window() {
        let store = MemoryStore::new();
        store.put("/z/f", &content(64));
        let fs = preload(&store, 3);
        let h = fs.open("/z/f", OpenFlags::ReadOnly).unwrap();
        assert_eq!(fs.read(&h, 0, BS).unwrap(), content(64)[..BS].to_vec());
        fs.wait_idle(h.id());
        let ids: Vec<BlockId> = fs.window(h.id()).into_iter().map(|(b, _)| b).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(fs.stats().hits, 1);
    }

    #[test]
    fn test_window_never_holds_blocks_behind() {
        let store = MemoryStore::new();
        store.put("/z/f", &content(80));
        let fs = preload(&store, 3);
        let h = fs.open("/z/f", OpenFlags::ReadOnly).unwrap();
        for block in 0..6u64 {
            fs.read(&h, block * BS as u64, BS).unwrap();
            let window = fs.window(h.id());
            assert!(window.len() <= 4);
            assert!(window.iter().all(|(b, _)| *b >= block && *b <= block + 3));
        }
    }

    #[test]
    fn test_backward_seek_evicts_far_blocks() {
        let store = MemoryStore::new();
        store.put("/z/f", &content(160));
        let fs = preload(&store, 2);
        let h = fs.open("/z/f", OpenFlags::ReadOnly).unwrap();
        fs.read(&h, 10 * BS as u64, BS).unwrap();
        fs.read(&h, 0, BS).unwrap();
        fs.wait_idle(h.id());
        let ids: Vec<BlockId> = fs.window(h.id()).into_iter().map(|(b, _)| b).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_sequential_reads_recycle_handles() {
        let store = MemoryStore::new();
        store.put("/z/f", &content(80));
        let fs = preload(&store, 2);
        let h = fs.open("/z/f", OpenFlags::ReadOnly).unwrap();
        fs.wait_idle(h.id());
        fs.read(&h, 0, BS).unwrap();
        fs.wait_idle(h.id());
        fs.read(&h, BS as u64, BS).unwrap();
        assert!(fs.stats().recycled >= 1);
    }

    #[test]
    fn test_read_spanning_blocks_matches_content() {
        let store = MemoryStore::new();
        let data = content(50);
        store.put("/z/f", &data);
        let fs = preload(&store, 3);
        let h = fs.open("/z/f", OpenFlags::ReadOnly).unwrap();
        assert_eq!(fs.read(&h, 5, 40).unwrap(), data[5..45].to_vec());
        assert_eq!(fs.read(&h, 45, 40).unwrap(), data[45..].to_vec());
        assert!(fs.read(&h, 50, 8).unwrap().is_empty());
    }

    #[test]
    fn test_failed_preload_falls_back() {
        let store = MemoryStore::new();
        let data = content(64);
        store.put("/z/f", &data);
        // The user handle is open #0; every preload handle fails its reads.
        store.fail_reads_from_open("/z/f", 1);
        let fs = preload(&store, 3);
        let h = fs.open("/z/f", OpenFlags::ReadOnly).unwrap();
        assert_eq!(fs.read(&h, 3, 20).unwrap(), data[3..23].to_vec());
        assert!(fs.stats().fallbacks >= 1);
    }

    #[test]
    fn test_preload_sees_unflushed_write() {
        let store = MemoryStore::new();
        store.put("/z/f", &content(32));
        let fs = preload(&store, 2);
        let h = fs.open("/z/f", OpenFlags::ReadWrite).unwrap();
        fs.write(&h, 2, b"hi").unwrap();
        assert_eq!(&fs.read(&h, 2, 2).unwrap(), b"hi");
    }

    #[test]
    fn test_close_releases_preload_handles() {
        let store = MemoryStore::new();
        store.put("/z/f", &content(64));
        let fs = preload(&store, 3);
        let h = fs.open("/z/f", OpenFlags::ReadOnly).unwrap();
        fs.read(&h, 0, BS).unwrap();
        fs.close(&h).unwrap();
        assert!(fs.window(h.id()).is_empty());
        assert_eq!(fs.buffered().registry().open_files(), 0);
    }

    #[test]
    fn test_shutdown_joins_everything() {
        let store = MemoryStore::new();
        store.put("/z/f", &content(64));
        let fs = preload(&store, 3);
        let h = fs.open("/z/f", OpenFlags::ReadOnly).unwrap();
        fs.shutdown();
        assert!(fs.window(h.id()).is_empty());
        assert_eq!(fs.buffered().registry().open_files(), 1);
    }
}
