//! Extent items: a run of contiguous unformatted blocks holding file body.
//!
//! One unit is one block. The item key carries the file offset of the
//! first block, always block-aligned.

use crate::{Coord, CutOutcome, ItemKind, LookupBias, LookupResult};
use r4_error::{R4Error, Result};
use r4_types::{BlockNumber, Key};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentItem {
    key: Key,
    start: BlockNumber,
    width: u64,
    block_size: u64,
}

impl ExtentItem {
    #[must_use]
    pub fn new(key: Key, start: BlockNumber, width: u64, block_size: u64) -> Self {
        Self {
            key,
            start,
            width,
            block_size,
        }
    }

    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    #[must_use]
    pub fn start_block(&self) -> BlockNumber {
        self.start
    }

    #[must_use]
    pub fn width(&self) -> u64 {
        self.width
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.width * self.block_size
    }

    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.key.offset()
    }

    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.key.offset() + self.byte_len()
    }

    pub fn lookup(&self, key: &Key, bias: LookupBias) -> Result<(LookupResult, Coord)> {
        crate::lookup_units(
            &self.key,
            ItemKind::Extent,
            self.byte_len(),
            self.block_size,
            key,
            bias,
        )
    }

    /// Block holding file byte `offset`, if the item covers it.
    #[must_use]
    pub fn block_at(&self, offset: u64) -> Option<BlockNumber> {
        if offset < self.start_offset() || offset >= self.end_offset() {
            return None;
        }
        Some(BlockNumber(
            self.start.0 + (offset - self.start_offset()) / self.block_size,
        ))
    }

    /// Whether `next` continues this extent both in the file and on disk.
    #[must_use]
    pub fn mergeable(&self, next: &Self) -> bool {
        self.key.same_object(&next.key)
            && self.block_size == next.block_size
            && self.end_offset() == next.start_offset()
            && self.start.0 + self.width == next.start.0
    }

    /// Absorb `next`, which must be mergeable.
    pub fn merge(&mut self, next: &Self) -> Result<()> {
        if !self.mergeable(next) {
            return Err(R4Error::InvariantViolation(format!(
                "extent {} cannot absorb {}",
                self.key, next.key
            )));
        }
        self.width += next.width;
        Ok(())
    }

    #[must_use]
    pub fn unit_key(&self, unit_pos: u64) -> Key {
        self.key
            .with_offset(self.start_offset() + unit_pos * self.block_size)
    }

    #[must_use]
    pub fn append_key(&self) -> Key {
        self.key.with_offset(self.end_offset())
    }

    /// Remove blocks `from..=to`, head or tail only.
    pub fn cut_units(&mut self, from: u64, to: u64) -> Result<CutOutcome> {
        if from > to || to >= self.width || (from != 0 && to != self.width - 1) {
            return Err(R4Error::InvariantViolation(format!(
                "cut of blocks {from}..={to} from extent {} of width {}",
                self.key, self.width
            )));
        }
        let smallest_removed = self.unit_key(from);
        let removed = to - from + 1;
        if from == 0 {
            self.start = BlockNumber(self.start.0 + removed);
            self.key
                .set_offset(self.start_offset() + removed * self.block_size);
        }
        self.width -= removed;
        Ok(CutOutcome {
            removed,
            smallest_removed,
            new_item_key: (self.width > 0).then_some(self.key),
        })
    }
}
