#![forbid(unsafe_code)]
//! Item types stored in the r4 tree.
//!
//! A regular file's body lives either in tail items (bytes stored inline
//! in formatted nodes) or in extent items (runs of unformatted blocks).
//! Every object also owns one stat-data item. Items are addressed by
//! [`Key`]; positions inside an item are units (bytes for tails, blocks
//! for extents).

pub mod extent;
pub mod flow;
pub mod readback;
pub mod stat_data;
pub mod tail;

pub use extent::ExtentItem;
pub use flow::{Flow, FlowDest, UserBuffer, UserVec};
pub use readback::{ItemWalker, ReadbackOutcome, readpage_tail};
pub use stat_data::{SdFlags, StatData};
pub use tail::TailItem;

use r4_error::{R4Error, Result};
use r4_types::Key;
use serde::{Deserialize, Serialize};

// ── Coordinates ─────────────────────────────────────────────────────────────

/// Item plugin identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    StatData,
    /// Formatting (tail) item.
    Tail,
    /// Extent pointer item.
    Extent,
}

impl ItemKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::StatData => "stat-data",
            Self::Tail => "tail",
            Self::Extent => "extent",
        }
    }
}

/// Search bias for lookups that may land between units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupBias {
    #[default]
    Exact,
    /// Accept the greatest unit whose key does not exceed the target.
    MaxNotMoreThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    Found,
    NotFound,
}

/// Where a coordinate points relative to its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Between {
    AtUnit,
    AfterUnit,
}

/// Position inside an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coord {
    pub item_key: Key,
    pub kind: ItemKind,
    pub unit_pos: u64,
    pub between: Between,
}

impl Coord {
    #[must_use]
    pub fn at_unit(item_key: Key, kind: ItemKind, unit_pos: u64) -> Self {
        Self {
            item_key,
            kind,
            unit_pos,
            between: Between::AtUnit,
        }
    }

    #[must_use]
    pub fn is_after_item(&self) -> bool {
        self.between == Between::AfterUnit
    }
}

/// Direction of a unit shift between neighbouring items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftDirection {
    /// Head units of the source move to the end of its left neighbour.
    Left,
    /// Tail units of the source move to the start of its right neighbour.
    Right,
}

/// Result of removing units from the head or tail of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutOutcome {
    /// Number of units removed.
    pub removed: u64,
    /// Key of the first removed unit.
    pub smallest_removed: Key,
    /// Key of the item after the cut, `None` when nothing is left.
    pub new_item_key: Option<Key>,
}

/// Called by kill operations before units disappear, so that whoever
/// mirrors the bytes (page cache, journal) can drop them.
pub trait KillHook {
    /// Units `from..=to` of the `kind` item at `item_key` are about to die.
    fn before_kill(&mut self, item_key: &Key, kind: ItemKind, from: u64, to: u64) -> Result<()>;
}

/// Kill hook that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKillHook;

impl KillHook for NoKillHook {
    fn before_kill(&mut self, _item_key: &Key, _kind: ItemKind, _from: u64, _to: u64) -> Result<()> {
        Ok(())
    }
}

// ── Items ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    StatData(StatData),
    Tail(TailItem),
    Extent(ExtentItem),
}

impl Item {
    #[must_use]
    pub fn key(&self) -> &Key {
        match self {
            Self::StatData(sd) => sd.key(),
            Self::Tail(tail) => tail.key(),
            Self::Extent(extent) => extent.key(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::StatData(_) => ItemKind::StatData,
            Self::Tail(_) => ItemKind::Tail,
            Self::Extent(_) => ItemKind::Extent,
        }
    }

    /// Bytes of file body the item covers; zero for stat-data.
    #[must_use]
    pub fn body_len(&self) -> u64 {
        match self {
            Self::StatData(_) => 0,
            Self::Tail(tail) => tail.len() as u64,
            Self::Extent(extent) => extent.byte_len(),
        }
    }

    /// File offset one past the last body byte the item covers.
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.key().offset() + self.body_len()
    }

    /// Whether the body byte at `offset` lies inside this item.
    #[must_use]
    pub fn covers(&self, offset: u64) -> bool {
        self.body_len() > 0 && offset >= self.key().offset() && offset < self.end_offset()
    }

    #[must_use]
    pub fn as_tail(&self) -> Option<&TailItem> {
        match self {
            Self::Tail(tail) => Some(tail),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_extent(&self) -> Option<&ExtentItem> {
        match self {
            Self::Extent(extent) => Some(extent),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_stat_data(&self) -> Option<&StatData> {
        match self {
            Self::StatData(sd) => Some(sd),
            _ => None,
        }
    }

    /// Whether `next` can be merged onto the end of this item.
    #[must_use]
    pub fn mergeable(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Tail(a), Self::Tail(b)) => a.mergeable(b),
            (Self::Extent(a), Self::Extent(b)) => a.mergeable(b),
            _ => false,
        }
    }

    /// Locate `key` inside a body item.
    pub fn lookup(&self, key: &Key, bias: LookupBias) -> Result<(LookupResult, Coord)> {
        match self {
            Self::Tail(tail) => tail.lookup(key, bias),
            Self::Extent(extent) => extent.lookup(key, bias),
            Self::StatData(sd) => Err(R4Error::InvariantViolation(format!(
                "unit lookup in stat-data item {}",
                sd.key()
            ))),
        }
    }
}

/// Shared lookup over an item spanning `[start, start + len)` bytes with
/// `unit_size` bytes per unit.
///
/// Any offset outside the item, before or past it, lands after the last
/// unit. A key of another object is a caller bug.
pub(crate) fn lookup_units(
    item_key: &Key,
    kind: ItemKind,
    len: u64,
    unit_size: u64,
    key: &Key,
    bias: LookupBias,
) -> Result<(LookupResult, Coord)> {
    if !item_key.same_object(key) {
        return Err(R4Error::InvariantViolation(format!(
            "lookup of {key} in {} item {item_key}",
            kind.name()
        )));
    }
    let start = item_key.offset();
    if let Some(rel) = key.offset().checked_sub(start).filter(|rel| *rel < len) {
        return Ok((
            LookupResult::Found,
            Coord::at_unit(*item_key, kind, rel / unit_size),
        ));
    }
    let last = len.saturating_sub(1) / unit_size;
    let coord = Coord {
        item_key: *item_key,
        kind,
        unit_pos: last,
        between: Between::AfterUnit,
    };
    // Only keys past the end count as the last unit for append lookups.
    let result = match bias {
        LookupBias::MaxNotMoreThan if key.offset() >= start => LookupResult::Found,
        LookupBias::MaxNotMoreThan | LookupBias::Exact => LookupResult::NotFound,
    };
    Ok((result, coord))
}
