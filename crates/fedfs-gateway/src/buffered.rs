//! Block-level read cache and per-path write deltas.
//!
//! Each handle caches at most one block it has read. Each path carries at most
//! one write delta: unflushed bytes confined to a single block. A write that
//! touches or overlaps the delta grows it; any other write pushes the old
//! delta to the remote and replaces it. Reads overlay the path's delta on the
//! fetched block, so writes are visible before they are flushed.
//!
//! Both maps sit behind one process-wide lock. It is never held across a
//! remote call.

use std::collections::HashMap;
use std::sync::Arc;

use fedfs_rpc::{ObjStat, OpenFlags};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::block::{BlockGeometry, BlockId};
use crate::direct::DirectFs;
use crate::error::{GatewayError, Result};
use crate::registry::{FileHandle, HandleId, Registry};

/// A contiguous run of bytes at a file offset.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Extent {
    offset: u64,
    data: Vec<u8>,
}

impl Extent {
    fn new(offset: u64, data: &[u8]) -> Self {
        Self {
            offset,
            data: data.to_vec(),
        }
    }

    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// Copies `data` at `offset`, growing as needed. `offset` may precede the
    /// extent, in which case the buffer is rebuilt over the union.
    fn merge(&mut self, offset: u64, data: &[u8]) {
        if offset >= self.offset {
            let start = (offset - self.offset) as usize;
            let end = start + data.len();
            if self.data.len() < end {
                self.data.resize(end, 0);
            }
            self.data[start..end].copy_from_slice(data);
        } else {
            let end = self.end().max(offset + data.len() as u64);
            let mut union = vec![0u8; (end - offset) as usize];
            let old_at = (self.offset - offset) as usize;
            union[old_at..old_at + self.data.len()].copy_from_slice(&self.data);
            union[..data.len()].copy_from_slice(data);
            self.offset = offset;
            self.data = union;
        }
    }

    /// Drops everything at or past `size`. Returns false if nothing is left.
    fn clip(&mut self, size: u64) -> bool {
        if self.offset >= size {
            return false;
        }
        let keep = (size - self.offset) as usize;
        self.data.truncate(keep);
        true
    }
}

struct CachedBlock {
    path: String,
    block: Extent,
}

#[derive(Default)]
struct CacheState {
    deltas: HashMap<String, Extent>,
    blocks: HashMap<HandleId, CachedBlock>,
}

impl CacheState {
    /// Overlays a delta onto every cached block of `path` in the same block.
    fn apply_delta(&mut self, geometry: &BlockGeometry, path: &str, delta: &Extent) {
        for cached in self.blocks.values_mut() {
            if cached.path == path && geometry.same_block(cached.block.offset, delta.offset) {
                cached.block.merge(delta.offset, &delta.data);
            }
        }
    }
}

/// Pending delta of a path, for observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaInfo {
    pub offset: u64,
    pub len: usize,
}

pub struct BufferedFs {
    direct: DirectFs,
    geometry: BlockGeometry,
    cache: Mutex<CacheState>,
}

impl BufferedFs {
    pub fn new(direct: DirectFs, block_size: u64) -> Self {
        let geometry = BlockGeometry::new(block_size);
        debug!("Initializing buffered cache: block_size={}", geometry.block_size());
        Self {
            direct,
            geometry,
            cache: Mutex::new(CacheState::default()),
        }
    }

    pub fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    pub fn direct(&self) -> &DirectFs {
        &self.direct
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.direct.registry()
    }

    /// Remote attributes, with the size inflated to cover a pending delta.
    pub fn getattr(&self, path: &str) -> Result<ObjStat> {
        let mut stat = self.direct.getattr(path)?;
        if let Some(delta) = self.cache.lock().deltas.get(path) {
            stat.size = stat.size.max(delta.end());
        }
        Ok(stat)
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<Arc<FileHandle>> {
        self.direct.open(path, flags)
    }

    pub fn create(&self, path: &str, mode: u32) -> Result<Arc<FileHandle>> {
        self.direct.create(path, mode)
    }

    /// Returns the bytes of one block as this handle sees them: the cached or
    /// fetched remote block with the path's pending delta laid over it. The
    /// result is shorter than a block only at end of file.
    pub fn read_block(&self, handle: &FileHandle, block: BlockId) -> Result<Vec<u8>> {
        let start = self.geometry.block_start(block);

        let hit = {
            let mut cache = self.cache.lock();
            match cache.blocks.get(&handle.id()) {
                Some(cached) if cached.block.offset == start => Some(cached.block.data.clone()),
                Some(_) => {
                    cache.blocks.remove(&handle.id());
                    None
                }
                None => None,
            }
        };

        let mut data = match hit {
            Some(data) => data,
            None => {
                let fetched = self
                    .direct
                    .read(handle, start, self.geometry.block_size() as usize)
                    .map_err(|e| {
                        error!(fh = handle.id(), path = handle.path(), block, error = %e, "block fetch failed");
                        e
                    })?;
                debug!(fh = handle.id(), block, len = fetched.len(), "block fetched");
                self.cache.lock().blocks.insert(
                    handle.id(),
                    CachedBlock {
                        path: handle.path().to_string(),
                        block: Extent {
                            offset: start,
                            data: fetched.clone(),
                        },
                    },
                );
                fetched
            }
        };

        let cache = self.cache.lock();
        if let Some(delta) = cache.deltas.get(handle.path()) {
            if self.geometry.block_id(delta.offset) == block {
                let at = (delta.offset - start) as usize;
                let end = at + delta.data.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[at..end].copy_from_slice(&delta.data);
            }
        }
        Ok(data)
    }

    /// Reads block by block, stopping at the first short block.
    pub fn read(&self, handle: &FileHandle, offset: u64, size: usize) -> Result<Vec<u8>> {
        let block_size = self.geometry.block_size() as usize;
        let mut out = Vec::with_capacity(size.min(block_size));

        for span in self.geometry.spans(offset, size) {
            let block = self.read_block(handle, span.block)?;
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

    /// Buffers one write confined to a single block.
    pub fn write_block(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> Result<()> {
        let displaced = {
            let mut guard = self.cache.lock();
            let cache = &mut *guard;
            let end = offset + data.len() as u64;
            match cache.deltas.get_mut(handle.path()) {
                Some(delta)
                    if self.geometry.same_block(delta.offset, offset)
                        && delta.end() >= offset
                        && delta.offset <= end =>
                {
                    delta.merge(offset, data);
                    None
                }
                Some(delta) => {
                    let old = std::mem::replace(delta, Extent::new(offset, data));
                    cache.apply_delta(&self.geometry, handle.path(), &old);
                    Some(old)
                }
                None => {
                    cache
                        .deltas
                        .insert(handle.path().to_string(), Extent::new(offset, data));
                    None
                }
            }
        };

        if let Some(old) = displaced {
            debug!(
                fh = handle.id(),
                path = handle.path(),
                offset = old.offset,
                len = old.data.len(),
                "pushing displaced delta"
            );
            self.push(handle, &old)?;
        }
        Ok(())
    }

    pub fn write(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> Result<usize> {
        if !handle.flags().is_writable() {
            return Err(GatewayError::InvalidArgument {
                msg: format!("handle {} is not open for writing", handle.id()),
            });
        }
        for span in self.geometry.spans(offset, data.len()) {
            let chunk = &data[span.buf_offset..span.buf_offset + span.len];
            self.write_block(handle, offset + span.buf_offset as u64, chunk)?;
        }
        Ok(data.len())
    }

    fn push(&self, handle: &FileHandle, delta: &Extent) -> Result<()> {
        self.direct
            .write(handle, delta.offset, &delta.data)
            .map(|_| ())
            .map_err(|e| {
                error!(
                    fh = handle.id(),
                    path = handle.path(),
                    offset = delta.offset,
                    error = %e,
                    "delta write failed"
                );
                e
            })
    }

    /// Writes the path's pending delta to the remote and drops it.
    pub fn flush_delta(&self, handle: &FileHandle) -> Result<()> {
        if !handle.flags().is_writable() {
            return Ok(());
        }
        let pending = {
            let mut guard = self.cache.lock();
            let cache = &mut *guard;
            let delta = cache.deltas.remove(handle.path());
            if let Some(delta) = &delta {
                cache.apply_delta(&self.geometry, handle.path(), delta);
            }
            delta
        };
        match pending {
            Some(delta) => self.push(handle, &delta),
            None => Ok(()),
        }
    }

    /// Pushes the delta, then commits with a remote flush.
    pub fn flush(&self, handle: &FileHandle) -> Result<()> {
        self.flush_delta(handle)?;
        self.direct.flush(handle)
    }

    /// Pushes the delta without reopening the descriptor.
    pub fn fsync(&self, handle: &FileHandle) -> Result<()> {
        self.flush_delta(handle)
    }

    /// Flushes if writable, drops the handle's cached block and closes it. The
    /// handle is closed even when the flush fails.
    pub fn close(&self, handle: &FileHandle) -> Result<()> {
        let flushed = self.flush_delta(handle);
        self.cache.lock().blocks.remove(&handle.id());
        self.direct.close(handle);
        flushed
    }

    /// Clips pending state past `size`, then truncates the remote object.
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        {
            let mut cache = self.cache.lock();
            let keep_delta = match cache.deltas.get_mut(path) {
                Some(delta) => delta.clip(size),
                None => true,
            };
            if !keep_delta {
                cache.deltas.remove(path);
            }
            cache
                .blocks
                .retain(|_, cached| cached.path != path || cached.block.clip(size));
        }
        self.direct.truncate(path, size)
    }

    /// Discards pending state for `path`, then removes the remote object.
    pub fn unlink(&self, path: &str) -> Result<()> {
        {
            let mut cache = self.cache.lock();
            cache.deltas.remove(path);
            cache.blocks.retain(|_, cached| cached.path != path);
        }
        self.direct.unlink(path)
    }

    pub fn pending_delta(&self, path: &str) -> Option<DeltaInfo> {
        self.cache.lock().deltas.get(path).map(|d| DeltaInfo {
            offset: d.offset,
            len: d.data.len(),
        })
    }

    /// Start offset of the block cached for a handle.
    pub fn cached_block_offset(&self, fh: HandleId) -> Option<u64> {
        self.cache.lock().blocks.get(&fh).map(|c| c.block.offset)
    }

    /// Closes every open file through the cache, flushing pending deltas.
    pub fn close_all(&self) -> usize {
        let registry = Arc::clone(self.registry());
        let ids = registry.file_ids();
        let mut closed = 0;
        for id in ids {
            if let Ok(handle) = registry.get(id) {
                if let Err(e) = self.close(&handle) {
                    error!(fh = id, path = handle.path(), error = %e, "flush at shutdown failed");
                }
                closed += 1;
            }
        }
        closed
    }
}
