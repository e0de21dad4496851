//! Per-transaction bump arena.
//!
//! Allocations are handed out as [`MemHandle`]s that stay valid until the
//! next [`TransMem::reset`] (every transaction attempt resets). When the bump
//! buffer is exhausted the allocation is promoted to its own heap chunk, so a
//! large transaction never fails for arena reasons; on reset the buffer grows
//! toward the high-water mark, capped at `max_bytes`.

use sbt_error::{Result, SbtError};
use tracing::debug;

const ALIGN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Bump { offset: usize, len: usize },
    Heap { index: usize },
}

/// Reference to arena memory, valid for one transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemHandle {
    epoch: u32,
    region: Region,
}

impl MemHandle {
    #[must_use]
    pub const fn is_promoted(&self) -> bool {
        matches!(self.region, Region::Heap { .. })
    }
}

#[derive(Debug)]
pub struct TransMem {
    buf: Vec<u8>,
    top: usize,
    heap: Vec<Vec<u8>>,
    heap_bytes: usize,
    high_water: usize,
    max_bytes: usize,
    epoch: u32,
}

impl TransMem {
    #[must_use]
    pub fn new(initial_bytes: usize, max_bytes: usize) -> Self {
        Self {
            buf: vec![0; initial_bytes],
            top: 0,
            heap: Vec::new(),
            heap_bytes: 0,
            high_water: 0,
            max_bytes,
            epoch: 0,
        }
    }

    /// Zeroed allocation of `size` bytes.
    pub fn alloc(&mut self, size: usize) -> Result<MemHandle> {
        let rounded = size
            .checked_next_multiple_of(ALIGN)
            .ok_or(SbtError::NoMemory { bytes: size })?;
        if rounded <= self.buf.len() - self.top {
            let offset = self.top;
            self.top += rounded;
            self.buf[offset..offset + size].fill(0);
            return Ok(MemHandle {
                epoch: self.epoch,
                region: Region::Bump { offset, len: size },
            });
        }
        self.promote(size)
    }

    pub fn alloc_copy(&mut self, bytes: &[u8]) -> Result<MemHandle> {
        let handle = self.alloc(bytes.len())?;
        self.get_mut(handle).copy_from_slice(bytes);
        Ok(handle)
    }

    fn promote(&mut self, size: usize) -> Result<MemHandle> {
        let mut chunk = Vec::new();
        chunk
            .try_reserve_exact(size)
            .map_err(|_| SbtError::NoMemory { bytes: size })?;
        chunk.resize(size, 0);
        self.heap_bytes += size;
        debug!(
            target: "sbt::btree::mem",
            size,
            heap_bytes = self.heap_bytes,
            arena_bytes = self.buf.len(),
            "trans_mem_promote"
        );
        self.heap.push(chunk);
        Ok(MemHandle {
            epoch: self.epoch,
            region: Region::Heap {
                index: self.heap.len() - 1,
            },
        })
    }

    fn check(&self, handle: MemHandle) {
        assert_eq!(
            handle.epoch, self.epoch,
            "transaction memory handle used after reset"
        );
    }

    #[must_use]
    pub fn get(&self, handle: MemHandle) -> &[u8] {
        self.check(handle);
        match handle.region {
            Region::Bump { offset, len } => &self.buf[offset..offset + len],
            Region::Heap { index } => &self.heap[index],
        }
    }

    pub fn get_mut(&mut self, handle: MemHandle) -> &mut [u8] {
        self.check(handle);
        match handle.region {
            Region::Bump { offset, len } => &mut self.buf[offset..offset + len],
            Region::Heap { index } => &mut self.heap[index],
        }
    }

    /// Invalidate every handle and regrow the buffer if the last attempt
    /// spilled to the heap.
    pub fn reset(&mut self) {
        self.high_water = self.high_water.max(self.top + self.heap_bytes);
        if self.heap_bytes > 0 && self.buf.len() < self.max_bytes {
            let want = self
                .high_water
                .checked_next_power_of_two()
                .unwrap_or(self.max_bytes)
                .min(self.max_bytes)
                .max(self.buf.len());
            let extra = want - self.buf.len();
            // Growth is best effort; promotion still covers the next attempt.
            if self.buf.try_reserve_exact(extra).is_ok() {
                self.buf.resize(want, 0);
            }
        }
        self.top = 0;
        self.heap.clear();
        self.heap_bytes = 0;
        self.epoch = self.epoch.wrapping_add(1);
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes handed out this attempt, bump padding included.
    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.top + self.heap_bytes
    }

    #[must_use]
    pub fn heap_bytes(&self) -> usize {
        self.heap_bytes
    }
}
