//! Block geometry.

pub type BlockId = u64;

/// Fixed-size partitioning of a file's byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    block_size: u64,
}

/// The part of a request that falls into one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub block: BlockId,
    /// Offset of the span within its block.
    pub in_block: usize,
    pub len: usize,
    /// Offset of the span within the caller's buffer.
    pub buf_offset: usize,
}

impl BlockGeometry {
    /// `block_size` must be non-zero; zero is treated as one byte.
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_id(&self, offset: u64) -> BlockId {
        offset / self.block_size
    }

    pub fn block_start(&self, block: BlockId) -> u64 {
        block * self.block_size
    }

    pub fn in_block_offset(&self, offset: u64) -> usize {
        (offset % self.block_size) as usize
    }

    pub fn same_block(&self, a: u64, b: u64) -> bool {
        self.block_id(a) == self.block_id(b)
    }

    /// Splits `offset..offset + len` at block boundaries. Spans are produced
    /// lazily, so a request far larger than the file costs nothing up front.
    pub fn spans(&self, offset: u64, len: usize) -> Spans {
        Spans {
            geometry: *self,
            offset,
            len,
            done: 0,
        }
    }
}

/// Iterator over the per-block pieces of a request.
#[derive(Debug, Clone)]
pub struct Spans {
    geometry: BlockGeometry,
    offset: u64,
    len: usize,
    done: usize,
}

impl Iterator for Spans {
    type Item = BlockSpan;

    fn next(&mut self) -> Option<BlockSpan> {
        if self.done >= self.len {
            return None;
        }
        let cur = self.offset.saturating_add(self.done as u64);
        let in_block = self.geometry.in_block_offset(cur);
        let avail = (self.geometry.block_size as usize) - in_block;
        let take = avail.min(self.len - self.done);
        let span = BlockSpan {
            block: self.geometry.block_id(cur),
            in_block,
            len: take,
            buf_offset: self.done,
        };
        self.done += take;
        Some(span)
    }
}
