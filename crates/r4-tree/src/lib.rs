#![forbid(unsafe_code)]
//! In-memory r4 tree.
//!
//! [`MemTree`] keeps items in key order and offers the item-level entry
//! points file code needs: lookup with bias, insert, ranged cut, and
//! single-item flow write/read for tails. Extent items point into a
//! [`MemBlockStore`]. Balancing is not modelled: every item lives in one
//! logical leaf, and the reported height is a configured constant used
//! only for reservation estimates.

pub mod blocks;
pub mod space;
pub mod throttle;

pub use blocks::MemBlockStore;
pub use space::{MemSpace, SpaceReserver, Txn};
pub use throttle::{CountingThrottle, WriteThrottle};

use parking_lot::{Mutex, RwLock};
use r4_error::{R4Error, Result};
use r4_item::{
    Coord, ExtentItem, Flow, FlowDest, Item, ItemKind, ItemWalker, KillHook, LookupBias, LookupResult,
    StatData, TailItem,
};
use r4_types::{BlockNumber, Key, KeyFormat};
use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::{debug, trace};

/// Height reported when none is configured.
pub const DEFAULT_TREE_HEIGHT: u32 = 4;

#[derive(Debug)]
pub struct MemTree {
    format: KeyFormat,
    max_tail_item: usize,
    height: u32,
    items: RwLock<BTreeMap<Key, Item>>,
    blocks: MemBlockStore,
    remaining_tail_writes: Mutex<Option<u64>>,
}

impl MemTree {
    /// Tree whose unformatted blocks are `block_size` bytes and whose flow
    /// writes create tail items of at most `max_tail_item` bytes.
    pub fn new(format: KeyFormat, block_size: usize, max_tail_item: usize) -> Result<Self> {
        if block_size == 0 || max_tail_item == 0 {
            return Err(R4Error::Format(format!(
                "block size {block_size} and tail item limit {max_tail_item} must be non-zero"
            )));
        }
        Ok(Self {
            format,
            max_tail_item,
            height: DEFAULT_TREE_HEIGHT,
            items: RwLock::new(BTreeMap::new()),
            blocks: MemBlockStore::new(block_size),
            remaining_tail_writes: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn with_height(mut self, height: u32) -> Self {
        self.height = height;
        self
    }

    #[must_use]
    pub fn format(&self) -> KeyFormat {
        self.format
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.blocks.block_size()
    }

    #[must_use]
    pub fn max_tail_item(&self) -> usize {
        self.max_tail_item
    }

    #[must_use]
    pub fn blocks(&self) -> &MemBlockStore {
        &self.blocks
    }

    /// Let the next `calls` tail writes through and fail later ones with
    /// [`R4Error::NoSpace`].
    pub fn fail_tail_writes_after(&self, calls: u64) {
        *self.remaining_tail_writes.lock() = Some(calls);
    }

    pub fn clear_failure(&self) {
        *self.remaining_tail_writes.lock() = None;
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// Find the body item of `key`'s object that holds `key`.
    ///
    /// With [`LookupBias::MaxNotMoreThan`] the last item below `key` is
    /// returned even when `key` lies past its end; the coordinate is then
    /// after its last unit.
    pub fn find_item(&self, key: &Key, bias: LookupBias) -> Result<Option<(Item, Coord)>> {
        let items = self.items.read();
        let Some((_, item)) = items.range(..=*key).next_back() else {
            return Ok(None);
        };
        if !item.key().same_object(key) {
            return Ok(None);
        }
        let (result, coord) = item.lookup(key, bias)?;
        Ok(match result {
            LookupResult::Found => Some((item.clone(), coord)),
            LookupResult::NotFound => None,
        })
    }

    /// Item stored under exactly `key`.
    #[must_use]
    pub fn item(&self, key: &Key) -> Option<Item> {
        self.items.read().get(key).cloned()
    }

    /// All body items of `key`'s object in offset order.
    #[must_use]
    pub fn body_items(&self, key: &Key) -> Vec<Item> {
        let first = key.with_offset(0);
        self.items
            .read()
            .range(first..)
            .take_while(|(k, _)| k.same_object(&first))
            .map(|(_, item)| item.clone())
            .collect()
    }

    /// Lowest-offset body item of `key`'s object.
    #[must_use]
    pub fn first_body_item(&self, key: &Key) -> Option<Item> {
        let first = key.with_offset(0);
        self.items
            .read()
            .range(first..)
            .next()
            .filter(|(k, _)| k.same_object(&first))
            .map(|(_, item)| item.clone())
    }

    /// End of the run of `kind` items that starts at body offset 0 of
    /// `key`'s object. 0 when the first item is missing or of another kind.
    #[must_use]
    pub fn prefix_end(&self, key: &Key, kind: ItemKind) -> u64 {
        let first = key.with_offset(0);
        let mut end = 0_u64;
        for (k, item) in self.items.read().range(first..) {
            if !k.same_object(&first) || item.kind() != kind || k.offset() > end {
                break;
            }
            end = end.max(item.end_offset());
        }
        end
    }

    /// Start of the first body item of `key`'s object beginning after
    /// `key`.
    #[must_use]
    pub fn next_item_offset(&self, key: &Key) -> Option<u64> {
        self.items
            .read()
            .range((Bound::Excluded(*key), Bound::Unbounded))
            .next()
            .filter(|(k, _)| k.same_object(key))
            .map(|(k, _)| k.offset())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    // ── Structural changes ──────────────────────────────────────────────────

    /// Insert a new item. Body items must not overlap their neighbours.
    pub fn insert_item(&self, item: Item) -> Result<()> {
        let mut items = self.items.write();
        Self::insert_locked(&mut items, item)
    }

    fn insert_locked(items: &mut BTreeMap<Key, Item>, item: Item) -> Result<()> {
        let key = *item.key();
        if items.contains_key(&key) {
            return Err(R4Error::InvariantViolation(format!("item {key} already exists")));
        }
        if item.body_len() > 0 {
            let overlaps_prev = items
                .range(..key)
                .next_back()
                .is_some_and(|(k, prev)| k.same_object(&key) && prev.end_offset() > key.offset());
            let overlaps_next = items
                .range((Bound::Excluded(key), Bound::Unbounded))
                .next()
                .is_some_and(|(k, _)| k.same_object(&key) && k.offset() < item.end_offset());
            if overlaps_prev || overlaps_next {
                return Err(R4Error::InvariantViolation(format!(
                    "{} item {key} overlaps a neighbour",
                    item.kind().name()
                )));
            }
        }
        trace!(target: "r4::tree", key = %key, kind = item.kind().name(), "insert_item");
        items.insert(key, item);
        Ok(())
    }

    pub fn remove_item(&self, key: &Key) -> Result<Item> {
        self.items
            .write()
            .remove(key)
            .ok_or_else(|| R4Error::NotFound(format!("item {key}")))
    }

    /// Stat-data item stored under `key`.
    pub fn stat_data(&self, key: &Key) -> Result<StatData> {
        match self.items.read().get(key) {
            Some(Item::StatData(sd)) => Ok(sd.clone()),
            Some(other) => Err(R4Error::Corruption {
                object: key.objectid().0,
                detail: format!("{} item where stat-data expected", other.kind().name()),
            }),
            None => Err(R4Error::NotFound(format!("stat-data {key}"))),
        }
    }

    /// Insert or replace a stat-data item.
    pub fn update_stat_data(&self, sd: StatData) {
        trace!(target: "r4::tree", key = %sd.key(), size = sd.size, flags = sd.flags.bits(), "update_sd");
        self.items.write().insert(*sd.key(), Item::StatData(sd));
    }

    /// Remove body bytes `from..=to` of one object.
    ///
    /// Tail items lose exactly the covered bytes; extent items lose every
    /// block whose first byte lies in the range. Items emptied by the cut
    /// disappear. `hook` sees each piece before it goes. Returns the number
    /// of body bytes removed.
    pub fn cut_range(&self, from: &Key, to: &Key, hook: &mut dyn KillHook) -> Result<u64> {
        if !from.same_object(to) || from.offset() > to.offset() {
            return Err(R4Error::InvariantViolation(format!("bad cut range {from}..={to}")));
        }
        let (a, b) = (from.offset(), to.offset());
        let mut items = self.items.write();
        let victims: Vec<Key> = items
            .range(..=*to)
            .rev()
            .take_while(|(k, _)| k.same_object(from))
            .filter(|(_, item)| item.body_len() > 0 && item.end_offset() > a)
            .map(|(k, _)| *k)
            .collect();

        let mut removed = 0_u64;
        for key in victims {
            let Some(item) = items.remove(&key) else {
                continue;
            };
            let start = key.offset();
            let first = a.max(start) - start;
            let last = b.min(item.end_offset() - 1) - start;
            let remainder = match item {
                Item::Tail(mut tail) => {
                    match tail.kill_units(first, last, hook) {
                        Ok(out) => removed += out.removed,
                        Err(err) => {
                            items.insert(key, Item::Tail(tail));
                            return Err(err);
                        }
                    }
                    (!tail.is_empty()).then_some(Item::Tail(tail))
                }
                Item::Extent(mut extent) => {
                    let bs = extent.block_size();
                    let first_unit = first.div_ceil(bs);
                    let last_unit = last / bs;
                    if first_unit > last_unit {
                        items.insert(key, Item::Extent(extent));
                        continue;
                    }
                    if let Err(err) = hook.before_kill(&key, ItemKind::Extent, first_unit, last_unit) {
                        items.insert(key, Item::Extent(extent));
                        return Err(err);
                    }
                    let base = extent.start_block().0;
                    let out = match extent.cut_units(first_unit, last_unit) {
                        Ok(out) => out,
                        Err(err) => {
                            items.insert(key, Item::Extent(extent));
                            return Err(err);
                        }
                    };
                    for unit in first_unit..=last_unit {
                        self.blocks.free(BlockNumber(base + unit));
                    }
                    removed += out.removed * bs;
                    (extent.width() > 0).then_some(Item::Extent(extent))
                }
                Item::StatData(sd) => Some(Item::StatData(sd)),
            };
            if let Some(rest) = remainder {
                items.insert(*rest.key(), rest);
            }
        }
        debug!(target: "r4::tree", from = a, to = b, removed, "cut_range");
        Ok(removed)
    }

    // ── Flows ───────────────────────────────────────────────────────────────

    /// Write flow bytes `flow_off..flow_off + len` at `key` as tail bytes.
    ///
    /// Touches at most one item: overwrites the tail holding `key`, appends
    /// to the tail ending at `key`, or inserts a new tail. Returns the bytes
    /// written, which may be fewer than `len`; callers loop.
    pub fn write_tail(&self, key: &Key, flow: &Flow<'_>, flow_off: usize, len: usize) -> Result<usize> {
        if len == 0 {
            return Ok(0);
        }
        if let Some(left) = self.remaining_tail_writes.lock().as_mut() {
            if *left == 0 {
                trace!(target: "r4::tree", key = %key, "write_tail_injected_failure");
                return Err(R4Error::NoSpace);
            }
            *left -= 1;
        }
        let off = key.offset();
        let mut items = self.items.write();
        let prev_key = items
            .range(..=*key)
            .next_back()
            .filter(|(k, _)| k.same_object(key))
            .map(|(k, _)| *k);
        let room = items
            .range((Bound::Excluded(*key), Bound::Unbounded))
            .next()
            .filter(|(k, _)| k.same_object(key))
            .map_or(u64::MAX, |(k, _)| k.offset() - off);
        let room = usize::try_from(room).unwrap_or(usize::MAX);

        if let Some(prev_key) = prev_key {
            let Some(prev) = items.get_mut(&prev_key) else {
                return Err(R4Error::InvariantViolation(format!("item {prev_key} vanished")));
            };
            if prev.covers(off) {
                let kind = prev.kind();
                let Item::Tail(tail) = prev else {
                    return Err(R4Error::InvariantViolation(format!(
                        "tail write at {off} lands in {} item {prev_key}",
                        kind.name()
                    )));
                };
                // `covers` bounds the position by the item length.
                let pos = (off - tail.start_offset()) as usize;
                let n = len.min(tail.len() - pos);
                tail.overwrite(pos, flow, flow_off, n)?;
                trace!(target: "r4::tree", off, n, "tail_overwrite");
                return Ok(n);
            }
            if let Item::Tail(tail) = prev {
                if tail.end_offset() == off && tail.len() < self.max_tail_item {
                    let n = len.min(self.max_tail_item - tail.len()).min(room);
                    let at = tail.len();
                    tail.paste(at, flow, flow_off, n)?;
                    trace!(target: "r4::tree", off, n, "tail_append");
                    return Ok(n);
                }
            }
        }

        let n = len.min(self.max_tail_item).min(room);
        let body = flow.to_vec(flow_off, n)?;
        Self::insert_locked(&mut items, Item::Tail(TailItem::new(*key, body)))?;
        Ok(n)
    }

    /// Read body bytes at `key` from the one item holding them into `dest`
    /// at `dest_off`. Returns 0 when no item holds `key`.
    pub fn read_body(&self, key: &Key, dest: &mut FlowDest<'_>, dest_off: usize) -> Result<usize> {
        let Some((item, coord)) = self.find_item(key, LookupBias::Exact)? else {
            return Ok(0);
        };
        match &item {
            Item::Tail(tail) => {
                // Found coordinates are inside the item.
                tail.read(coord.unit_pos as usize, dest, dest_off)
            }
            Item::Extent(extent) => {
                let Some(block) = extent.block_at(key.offset()) else {
                    return Ok(0);
                };
                let bs = extent.block_size();
                let in_block = ((key.offset() - extent.start_offset()) % bs) as usize;
                let mut buf = vec![0_u8; self.block_size()];
                self.blocks.read(block, &mut buf)?;
                let n = (buf.len() - in_block).min(dest.len().saturating_sub(dest_off));
                dest.put(dest_off, &buf[in_block..in_block + n])?;
                Ok(n)
            }
            Item::StatData(_) => Ok(0),
        }
    }

    // ── Extents ─────────────────────────────────────────────────────────────

    /// Map the block-aligned region at `key` to a new block holding `data`.
    ///
    /// Extends the preceding extent when the new block continues it.
    pub fn create_extent(&self, key: &Key, data: &[u8]) -> Result<BlockNumber> {
        let bs = self.block_size() as u64;
        if key.offset() % bs != 0 {
            return Err(R4Error::InvariantViolation(format!(
                "extent at unaligned offset {}",
                key.offset()
            )));
        }
        let block = self.blocks.allocate(data)?;
        let new = ExtentItem::new(*key, block, 1, bs);
        let mut items = self.items.write();
        let prev_key = items
            .range(..*key)
            .next_back()
            .filter(|(k, item)| k.same_object(key) && item.as_extent().is_some_and(|e| e.mergeable(&new)))
            .map(|(k, _)| *k);
        let result = match prev_key.and_then(|k| items.get_mut(&k)) {
            Some(Item::Extent(prev)) => prev.merge(&new),
            _ => Self::insert_locked(&mut items, Item::Extent(new)),
        };
        if let Err(err) = result {
            self.blocks.free(block);
            return Err(err);
        }
        trace!(target: "r4::tree", key = %key, block = block.0, "create_extent");
        Ok(block)
    }

    /// Fill `buf` with the block mapped at `key`. Returns false for holes.
    pub fn read_extent_block(&self, key: &Key, buf: &mut [u8]) -> Result<bool> {
        let block = match self.find_item(key, LookupBias::Exact)? {
            Some((Item::Extent(extent), _)) => extent.block_at(key.offset()),
            Some((other, _)) => {
                return Err(R4Error::Corruption {
                    object: key.objectid().0,
                    detail: format!("{} item where extent expected at {}", other.kind().name(), key.offset()),
                });
            }
            None => None,
        };
        match block {
            Some(block) => {
                self.blocks.read(block, buf)?;
                Ok(true)
            }
            None => {
                buf.fill(0);
                Ok(false)
            }
        }
    }

    /// Store `data` in the block mapped at `key`, mapping one if needed.
    pub fn write_extent_block(&self, key: &Key, data: &[u8]) -> Result<BlockNumber> {
        if let Some((Item::Extent(extent), _)) = self.find_item(key, LookupBias::Exact)? {
            if let Some(block) = extent.block_at(key.offset()) {
                self.blocks.write(block, data)?;
                return Ok(block);
            }
        }
        self.create_extent(key, data)
    }
}

impl ItemWalker for MemTree {
    fn item_at(&self, key: &Key) -> Result<Option<Item>> {
        Ok(self.find_item(key, LookupBias::Exact)?.map(|(item, _)| item))
    }

    fn next_item(&self, item_key: &Key) -> Result<Option<Item>> {
        Ok(self
            .items
            .read()
            .range((Bound::Excluded(*item_key), Bound::Unbounded))
            .next()
            .map(|(_, item)| item.clone()))
    }
}
