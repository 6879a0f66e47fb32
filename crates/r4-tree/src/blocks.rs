//! Unformatted block store backing extent items.

use parking_lot::Mutex;
use r4_error::{R4Error, Result};
use r4_types::BlockNumber;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Blocks are handed out in increasing order, so consecutive allocations
/// are contiguous on "disk".
///
/// `fail_after(n)` lets the next `n` allocations succeed and fails every
/// later one with [`R4Error::NoSpace`].
#[derive(Debug)]
pub struct MemBlockStore {
    block_size: usize,
    next: AtomicU64,
    blocks: Mutex<HashMap<BlockNumber, Vec<u8>>>,
    remaining_allocs: Mutex<Option<u64>>,
}

impl MemBlockStore {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            next: AtomicU64::new(1),
            blocks: Mutex::new(HashMap::new()),
            remaining_allocs: Mutex::new(None),
        }
    }

    pub fn fail_after(&self, allocations: u64) {
        *self.remaining_allocs.lock() = Some(allocations);
    }

    pub fn clear_failure(&self) {
        *self.remaining_allocs.lock() = None;
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocate a block holding `data`, zero-padded to the block size.
    pub fn allocate(&self, data: &[u8]) -> Result<BlockNumber> {
        if data.len() > self.block_size {
            return Err(R4Error::InvariantViolation(format!(
                "{} bytes do not fit a {}-byte block",
                data.len(),
                self.block_size
            )));
        }
        if let Some(left) = self.remaining_allocs.lock().as_mut() {
            if *left == 0 {
                return Err(R4Error::NoSpace);
            }
            *left -= 1;
        }
        let block = BlockNumber(self.next.fetch_add(1, Ordering::Relaxed));
        let mut buf = data.to_vec();
        buf.resize(self.block_size, 0);
        self.blocks.lock().insert(block, buf);
        Ok(block)
    }

    pub fn read(&self, block: BlockNumber, dst: &mut [u8]) -> Result<()> {
        let blocks = self.blocks.lock();
        let data = blocks
            .get(&block)
            .ok_or_else(|| R4Error::NotFound(format!("block {block}")))?;
        let len = dst.len().min(data.len());
        dst[..len].copy_from_slice(&data[..len]);
        Ok(())
    }

    pub fn write(&self, block: BlockNumber, src: &[u8]) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let data = blocks
            .get_mut(&block)
            .ok_or_else(|| R4Error::NotFound(format!("block {block}")))?;
        let len = src.len().min(data.len());
        data[..len].copy_from_slice(&src[..len]);
        Ok(())
    }

    pub fn free(&self, block: BlockNumber) {
        self.blocks.lock().remove(&block);
    }

    #[must_use]
    pub fn allocated(&self) -> usize {
        self.blocks.lock().len()
    }
}
