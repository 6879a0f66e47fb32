//! Tail items: file body bytes stored inline in the tree.
//!
//! One unit is one byte. A tail item's key carries the file offset of its
//! first byte. Units may only be added or removed at either end of an
//! item; interior edits are contract violations.

use crate::flow::{Flow, FlowDest};
use crate::{Coord, CutOutcome, ItemKind, KillHook, LookupBias, LookupResult, ShiftDirection};
use r4_error::{R4Error, Result};
use r4_types::Key;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailItem {
    key: Key,
    body: Vec<u8>,
}

impl TailItem {
    #[must_use]
    pub fn new(key: Key, body: Vec<u8>) -> Self {
        Self { key, body }
    }

    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.key.offset()
    }

    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.key.offset() + self.body.len() as u64
    }

    /// Locate the byte addressed by `key`.
    ///
    /// Inside the item the result is `Found` at the byte. Past the end the
    /// coordinate is after the last unit; that counts as `Found` only under
    /// [`LookupBias::MaxNotMoreThan`].
    pub fn lookup(&self, key: &Key, bias: LookupBias) -> Result<(LookupResult, Coord)> {
        crate::lookup_units(&self.key, ItemKind::Tail, self.body.len() as u64, 1, key, bias)
    }

    /// Whether `next` continues this item: same object, adjacent bytes.
    #[must_use]
    pub fn mergeable(&self, next: &Self) -> bool {
        self.key.same_object(&next.key) && self.end_offset() == next.start_offset()
    }

    /// Key of the byte at `unit_pos`.
    #[must_use]
    pub fn unit_key(&self, unit_pos: u64) -> Key {
        self.key.with_offset(self.start_offset() + unit_pos)
    }

    /// Key of the byte just past the item.
    #[must_use]
    pub fn append_key(&self) -> Key {
        self.key.with_offset(self.end_offset())
    }

    /// Key of the last byte inside the item.
    #[must_use]
    pub fn max_key_inside(&self) -> Key {
        self.key
            .with_offset(self.end_offset().saturating_sub(1).max(self.start_offset()))
    }

    /// Insert `count` flow bytes starting at `src_off` at unit position `pos`.
    ///
    /// `pos == 0` prepends and moves the item key back by `count`;
    /// `pos == len` appends. The flow is copied before the item is touched,
    /// so a fault leaves the item unchanged.
    pub fn paste(&mut self, pos: usize, src: &Flow<'_>, src_off: usize, count: usize) -> Result<()> {
        if pos != 0 && pos != self.body.len() {
            return Err(R4Error::InvariantViolation(format!(
                "paste at unit {pos} inside tail item {} of {} bytes",
                self.key,
                self.body.len()
            )));
        }
        let bytes = src.to_vec(src_off, count)?;
        if pos == 0 && !self.body.is_empty() {
            let start = self
                .start_offset()
                .checked_sub(count as u64)
                .ok_or_else(|| {
                    R4Error::InvariantViolation(format!(
                        "prepend of {count} bytes before offset {}",
                        self.start_offset()
                    ))
                })?;
            let mut body = bytes;
            body.extend_from_slice(&self.body);
            self.body = body;
            self.key.set_offset(start);
        } else {
            self.body.extend_from_slice(&bytes);
        }
        trace!(target: "r4::item", key = %self.key, pos, count, "tail_paste");
        Ok(())
    }

    /// Units that fit into `free_space` bytes of a neighbour, at most `want`.
    #[must_use]
    pub fn can_shift(&self, free_space: usize, want: usize) -> usize {
        want.min(free_space).min(self.body.len())
    }

    /// Copy `count` units starting at `from` into `target`.
    ///
    /// Left shifts take the head of `self` and require `from == 0`; right
    /// shifts take the tail and require `from + count == len`. Right shifts
    /// set the target key to this item's offset plus `from`. The source is
    /// left untouched; callers cut it afterwards.
    pub fn copy_units(
        &self,
        target: &mut Self,
        from: usize,
        count: usize,
        direction: ShiftDirection,
    ) -> Result<()> {
        let end = from
            .checked_add(count)
            .filter(|end| *end <= self.body.len())
            .ok_or_else(|| {
                R4Error::InvariantViolation(format!(
                    "copy of units {from}+{count} from tail of {} bytes",
                    self.body.len()
                ))
            })?;
        let units = &self.body[from..end];
        match direction {
            ShiftDirection::Left => {
                if from != 0 {
                    return Err(R4Error::InvariantViolation(format!(
                        "left shift must start at unit 0, got {from}"
                    )));
                }
                if !target.is_empty() && !target.mergeable(self) {
                    return Err(R4Error::InvariantViolation(format!(
                        "left shift target {} does not precede {}",
                        target.key, self.key
                    )));
                }
                if target.is_empty() {
                    target.key = self.key;
                }
                target.body.extend_from_slice(units);
            }
            ShiftDirection::Right => {
                if end != self.body.len() {
                    return Err(R4Error::InvariantViolation(format!(
                        "right shift must end at the last unit, got {from}+{count} of {}",
                        self.body.len()
                    )));
                }
                if !target.is_empty() && !self.mergeable(target) {
                    return Err(R4Error::InvariantViolation(format!(
                        "right shift target {} does not follow {}",
                        target.key, self.key
                    )));
                }
                let mut body = units.to_vec();
                body.extend_from_slice(&target.body);
                target.body = body;
                target.key = self.key.with_offset(self.start_offset() + from as u64);
            }
        }
        Ok(())
    }

    /// Move `count` units into a neighbour: copy, then cut from `self`.
    pub fn shift_into(&mut self, target: &mut Self, count: usize, direction: ShiftDirection) -> Result<usize> {
        let count = count.min(self.body.len());
        if count == 0 {
            return Ok(0);
        }
        let from = match direction {
            ShiftDirection::Left => 0,
            ShiftDirection::Right => self.body.len() - count,
        };
        self.copy_units(target, from, count, direction)?;
        self.cut_units(from as u64, (from + count - 1) as u64)?;
        Ok(count)
    }

    /// Remove units `from..=to`. Only a head or a tail may go.
    pub fn cut_units(&mut self, from: u64, to: u64) -> Result<CutOutcome> {
        let len = self.body.len() as u64;
        if from > to || to >= len {
            return Err(R4Error::InvariantViolation(format!(
                "cut of units {from}..={to} from tail of {len} bytes"
            )));
        }
        if from != 0 && to != len - 1 {
            return Err(R4Error::InvariantViolation(format!(
                "cut of interior units {from}..={to} from tail {}",
                self.key
            )));
        }
        let smallest_removed = self.unit_key(from);
        let removed = to - from + 1;
        // `from` and `to` are bounded by the body length.
        let (from_idx, to_idx) = (from as usize, to as usize);
        if from == 0 {
            self.body.drain(..=to_idx);
            self.key.set_offset(self.start_offset() + removed);
        } else {
            self.body.truncate(from_idx);
        }
        trace!(target: "r4::item", key = %self.key, from, to, "tail_cut");
        Ok(CutOutcome {
            removed,
            smallest_removed,
            new_item_key: (!self.body.is_empty()).then_some(self.key),
        })
    }

    /// Like [`Self::cut_units`], but lets `hook` see the units first.
    pub fn kill_units(&mut self, from: u64, to: u64, hook: &mut dyn KillHook) -> Result<CutOutcome> {
        hook.before_kill(&self.key, ItemKind::Tail, from, to)?;
        self.cut_units(from, to)
    }

    /// Copy bytes from `unit_pos` into `dest` starting at `dest_off`.
    ///
    /// Copies as much as fits in both the item and the destination and
    /// returns the count. A user-memory fault fails the whole read.
    pub fn read(&self, unit_pos: usize, dest: &mut FlowDest<'_>, dest_off: usize) -> Result<usize> {
        if unit_pos > self.body.len() {
            return Err(R4Error::InvariantViolation(format!(
                "read at unit {unit_pos} of tail with {} bytes",
                self.body.len()
            )));
        }
        let room = dest.len().saturating_sub(dest_off);
        let count = room.min(self.body.len() - unit_pos);
        dest.put(dest_off, &self.body[unit_pos..unit_pos + count])?;
        Ok(count)
    }

    /// Replace `count` bytes at `unit_pos` with flow bytes at `src_off`.
    pub fn overwrite(&mut self, unit_pos: usize, src: &Flow<'_>, src_off: usize, count: usize) -> Result<()> {
        let end = unit_pos
            .checked_add(count)
            .filter(|end| *end <= self.body.len())
            .ok_or_else(|| {
                R4Error::InvariantViolation(format!(
                    "overwrite of {unit_pos}+{count} past tail end {}",
                    self.body.len()
                ))
            })?;
        src.copy_out(src_off, &mut self.body[unit_pos..end])
    }
}
