//! Stat-data item: per-object attributes kept in the tree.

use r4_types::Key;
use serde::{Deserialize, Serialize};

/// Persistent per-object flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct SdFlags(u32);

impl SdFlags {
    /// The body is mid-conversion: some bytes are in tails, some in extents.
    pub const PART_MIXED: Self = Self(1);

    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatData {
    key: Key,
    pub size: u64,
    pub flags: SdFlags,
}

impl StatData {
    #[must_use]
    pub fn new(key: Key, size: u64) -> Self {
        Self {
            key,
            size,
            flags: SdFlags::empty(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    #[must_use]
    pub fn is_mixed(&self) -> bool {
        self.flags.contains(SdFlags::PART_MIXED)
    }
}
