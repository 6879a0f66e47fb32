//! Read, write, truncate and page readback.

use crate::{Container, UnixFile, estimate};
use r4_error::{R4Error, Result};
use r4_item::{Flow, FlowDest, Item, ItemKind, KillHook, LookupBias, ReadbackOutcome, readpage_tail};
use r4_page::{Page, PageCache};
use r4_tree::Txn;
use r4_types::{Key, ObjectId};
use std::sync::Arc;
use tracing::{debug, trace};

/// Drops cached pages covering killed units.
struct CacheKillHook<'a> {
    cache: &'a PageCache,
    object: ObjectId,
    page_size: u64,
    killed: u64,
}

impl KillHook for CacheKillHook<'_> {
    fn before_kill(&mut self, item_key: &Key, kind: ItemKind, from: u64, to: u64) -> Result<()> {
        let unit = match kind {
            ItemKind::Extent => self.page_size,
            ItemKind::Tail | ItemKind::StatData => 1,
        };
        let first = item_key.offset() + from * unit;
        let end = item_key.offset() + (to + 1) * unit;
        self.cache
            .invalidate_range(self.object, first / self.page_size, end.div_ceil(self.page_size));
        self.killed += end - first;
        Ok(())
    }
}

impl UnixFile {
    /// Write `flow` at `offset`. Returns the bytes written; a fault after
    /// some progress ends the write short.
    pub fn write(&self, txn: &Txn, offset: u64, flow: &Flow<'_>) -> Result<usize> {
        let len = flow.len();
        if len == 0 {
            return Ok(0);
        }
        offset
            .checked_add(len as u64)
            .ok_or_else(|| R4Error::InvariantViolation(format!("write of {len} bytes at {offset} overflows")))?;

        let mut guard = self.get_exclusive_careful(txn);
        self.complete_interrupted(&mut guard)?;
        let mut state = self.find_file_state()?;
        let new_size = self.size().max(offset + len as u64);
        let want_tails = self.config().have_tail(new_size);
        if state == Container::Tails && !want_tails {
            self.tail2extent(&mut guard)?;
            state = Container::Extents;
        }
        let use_tails = match state {
            Container::Tails => true,
            Container::Extents => false,
            Container::Empty | Container::Unknown => want_tails,
        };

        let written = if use_tails {
            self.write_tails(txn, offset, flow)?
        } else {
            self.write_extents(txn, offset, flow)?
        };
        if written > 0 && state == Container::Empty {
            self.set_container(if use_tails { Container::Tails } else { Container::Extents });
        }
        let reached = offset + written as u64;
        if reached > self.size() {
            self.set_size(reached)?;
        }
        trace!(target: "r4::file", object = self.object().0, offset, written, tails = use_tails, "write");
        Ok(written)
    }

    fn write_tails(&self, txn: &Txn, offset: u64, flow: &Flow<'_>) -> Result<usize> {
        let size = self.size();
        let hole = offset.saturating_sub(size);
        let height = self.env().tree.height();
        self.env().space.reserve(
            txn,
            estimate::flow_insert(height, hole + flow.len() as u64, self.config().max_tail_item),
            true,
        )?;
        if hole > 0 {
            let hole_len = usize::try_from(hole)
                .map_err(|_| R4Error::InvariantViolation(format!("hole of {hole} bytes")))?;
            self.write_tail_flow(size, &Flow::Hole(hole_len))?;
        }
        let written = self.write_tail_flow(offset, flow)?;
        let ps = self.config().page_size as u64;
        let end = offset + written as u64;
        self.env()
            .cache
            .invalidate_range(self.object(), size.min(offset) / ps, end.div_ceil(ps));
        Ok(written)
    }

    /// Loop single-item tail writes until the flow is in.
    fn write_tail_flow(&self, offset: u64, flow: &Flow<'_>) -> Result<usize> {
        let len = flow.len();
        let mut done = 0_usize;
        while done < len {
            let key = self.body_key(offset + done as u64);
            match self.env().tree.write_tail(&key, flow, done, len - done) {
                Ok(0) => {
                    return Err(R4Error::io(format!("no progress writing tails at {}", key.offset())));
                }
                Ok(n) => done += n,
                Err(err) if done > 0 && matches!(err, R4Error::Fault(_)) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(done)
    }

    fn write_extents(&self, txn: &Txn, offset: u64, flow: &Flow<'_>) -> Result<usize> {
        let ps = self.config().page_size as u64;
        let end = offset + flow.len() as u64;
        let (first, last) = (offset / ps, (end - 1) / ps);
        let height = self.env().tree.height();
        self.env()
            .space
            .reserve(txn, estimate::extent_write(height, last - first + 1), true)?;

        let mut done = 0_usize;
        for index in first..=last {
            let page = self.read_extent_page(index)?;
            let page_start = index * ps;
            // Both bounds lie inside the page.
            #[expect(clippy::cast_possible_truncation)]
            let (from, to) = (
                (offset.max(page_start) - page_start) as usize,
                (end.min(page_start + ps) - page_start) as usize,
            );
            let mut data = page.lock();
            if let Err(err) = flow.copy_out(done, &mut data[from..to]) {
                if done > 0 && matches!(err, R4Error::Fault(_)) {
                    break;
                }
                return Err(err);
            }
            self.env().tree.write_extent_block(&self.body_key(page_start), &data)?;
            done += to - from;
        }
        Ok(done)
    }

    /// Page `index` through the page cache, filled from its extent block.
    pub(crate) fn read_extent_page(&self, index: u64) -> Result<Arc<Page>> {
        let key = self.body_key(index * self.config().page_size as u64);
        let tree = &self.env().tree;
        self.env()
            .cache
            .read_mapping_page(self.object(), index, |page, buf| {
                tree.read_extent_block(&key, buf)?;
                page.set_uptodate();
                Ok(())
            })
    }

    /// Read up to `dest.len()` bytes at `offset`. Stops at end of file.
    pub fn read(&self, txn: &Txn, offset: u64, dest: &mut FlowDest<'_>) -> Result<usize> {
        let _guard = self.access().get_nonexclusive(txn);
        let size = self.size();
        if offset >= size || dest.is_empty() {
            return Ok(0);
        }
        #[expect(clippy::cast_possible_truncation)] // bounded by dest.len()
        let len = (size - offset).min(dest.len() as u64) as usize;
        let mut buf = vec![0_u8; len];
        if self.container() == Container::Extents && !self.in_conversion() {
            self.read_extents(offset, &mut buf)?;
        } else {
            self.read_items(offset, &mut buf)?;
        }
        dest.put(0, &buf)?;
        Ok(len)
    }

    fn read_extents(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let ps = self.config().page_size as u64;
        let mut pos = 0_usize;
        while pos < buf.len() {
            let at = offset + pos as u64;
            let page = self.read_extent_page(at / ps)?;
            #[expect(clippy::cast_possible_truncation)] // remainder of a page size
            let in_page = (at % ps) as usize;
            let data = page.lock();
            let n = (data.len() - in_page).min(buf.len() - pos);
            buf[pos..pos + n].copy_from_slice(&data[in_page..in_page + n]);
            pos += n;
        }
        Ok(())
    }

    /// Item-by-item read; works whatever mix of items backs the body.
    fn read_items(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        let mut pos = 0_usize;
        while pos < len {
            let key = self.body_key(offset + pos as u64);
            let n = self
                .env()
                .tree
                .read_body(&key, &mut FlowDest::Kernel(&mut buf[..]), pos)?;
            if n > 0 {
                pos += n;
                continue;
            }
            // Unmapped: zeros up to the next item.
            let next = self.env().tree.next_item_offset(&key).unwrap_or(u64::MAX);
            #[expect(clippy::cast_possible_truncation)] // bounded by len
            let gap = (next - key.offset()).min((len - pos) as u64) as usize;
            pos += gap;
        }
        Ok(())
    }

    /// Bring page `index` up to date in the page cache.
    pub fn readpage(&self, txn: &Txn, index: u64) -> Result<Arc<Page>> {
        let _guard = self.access().get_nonexclusive(txn);
        let key = self.body_key(index * self.config().page_size as u64);
        if let Some((Item::Extent(_), _)) = self.env().tree.find_item(&key, LookupBias::Exact)? {
            return self.read_extent_page(index);
        }
        let page = self.env().cache.find_or_create(self.object(), index);
        if let ReadbackOutcome::Filled { bytes } = readpage_tail(self.env().tree.as_ref(), &key, &page)? {
            trace!(target: "r4::file", object = self.object().0, index, bytes, "readpage_tail");
        }
        if !page.is_uptodate() {
            return Err(R4Error::io(format!("page {index} of object {} not uptodate", self.object())));
        }
        Ok(page)
    }

    /// Change the file size. Growing appends a hole; shrinking kills
    /// everything past `new_size`.
    pub fn truncate(&self, txn: &Txn, new_size: u64) -> Result<()> {
        let mut guard = self.get_exclusive_careful(txn);
        self.complete_interrupted(&mut guard)?;
        let old_size = self.size();
        if new_size > old_size {
            let mut state = self.find_file_state()?;
            let want_tails = self.config().have_tail(new_size);
            if state == Container::Tails && !want_tails {
                self.tail2extent(&mut guard)?;
                state = Container::Extents;
            }
            if state == Container::Tails || (state == Container::Empty && want_tails) {
                let height = self.env().tree.height();
                let hole = new_size - old_size;
                self.env().space.reserve(
                    txn,
                    estimate::flow_insert(height, hole, self.config().max_tail_item),
                    true,
                )?;
                let hole_len = usize::try_from(hole)
                    .map_err(|_| R4Error::InvariantViolation(format!("hole of {hole} bytes")))?;
                self.write_tail_flow(old_size, &Flow::Hole(hole_len))?;
                self.set_container(Container::Tails);
            }
        } else if new_size < old_size {
            self.shrink(txn, new_size)?;
        }
        if new_size != old_size {
            self.set_size(new_size)?;
        }
        debug!(target: "r4::file", object = self.object().0, old_size, new_size, "truncate");
        Ok(())
    }

    fn shrink(&self, txn: &Txn, new_size: u64) -> Result<()> {
        let ps = self.config().page_size as u64;
        let height = self.env().tree.height();
        self.env().space.reserve(txn, estimate::truncate(height), true)?;
        let mut hook = CacheKillHook {
            cache: &self.env().cache,
            object: self.object(),
            page_size: ps,
            killed: 0,
        };
        self.env()
            .tree
            .cut_range(&self.body_key(new_size), &self.body_key(u64::MAX), &mut hook)?;

        // Zero what is left of a partially truncated block.
        let in_block = new_size % ps;
        if in_block != 0 {
            let block_key = self.body_key(new_size - in_block);
            if let Some((Item::Extent(_), _)) = self.env().tree.find_item(&block_key, LookupBias::Exact)? {
                let mut buf = vec![0_u8; self.config().page_size];
                self.env().tree.read_extent_block(&block_key, &mut buf)?;
                #[expect(clippy::cast_possible_truncation)] // remainder of a page size
                buf[in_block as usize..].fill(0);
                self.env().tree.write_extent_block(&block_key, &buf)?;
            }
        }
        self.env()
            .cache
            .invalidate_range(self.object(), new_size / ps, u64::MAX);
        if new_size == 0 {
            self.set_container(Container::Empty);
        }
        trace!(target: "r4::file", object = self.object().0, new_size, killed = hook.killed, "shrink");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Container, FileConfig, FileEnv, FormattingPolicy, UnixFile};
    use r4_error::R4Error;
    use r4_item::{Flow, FlowDest, Item, UserVec};
    use r4_tree::Txn;
    use r4_types::{KeyFormat, ObjectId};

    fn file(formatting: FormattingPolicy) -> UnixFile {
        let config = FileConfig {
            formatting,
            ..FileConfig::with_page_size(16)
        };
        let env = FileEnv::in_memory(&config, KeyFormat::Large).unwrap();
        UnixFile::create(env, config, 1, 0, ObjectId(50)).unwrap()
    }

    fn read_all(f: &UnixFile) -> Vec<u8> {
        let txn = Txn::new();
        let mut buf = vec![0_u8; usize::try_from(f.size()).unwrap()];
        let n = f.read(&txn, 0, &mut FlowDest::Kernel(&mut buf)).unwrap();
        assert_eq!(n, buf.len());
        buf
    }

    #[test]
    fn small_file_stays_in_tails() {
        let f = file(FormattingPolicy::SmallFile);
        let txn = Txn::new();
        assert_eq!(f.write(&txn, 0, &Flow::Kernel(b"hello world")).unwrap(), 11);
        assert_eq!(f.container(), Container::Tails);
        assert_eq!(read_all(&f), b"hello world");
    }

    #[test]
    fn growing_past_policy_converts_to_extents() {
        let f = file(FormattingPolicy::SmallFile);
        let txn = Txn::new();
        let data: Vec<u8> = (0..100_u8).collect();
        f.write(&txn, 0, &Flow::Kernel(&data[..40])).unwrap();
        assert_eq!(f.container(), Container::Tails);
        f.write(&txn, 40, &Flow::Kernel(&data[40..])).unwrap();
        assert_eq!(f.container(), Container::Extents);
        assert!(!f.is_mixed().unwrap());
        assert!(f.items().iter().all(|item| matches!(item, Item::Extent(_))));
        assert_eq!(read_all(&f), data);
    }

    #[test]
    fn tail_write_past_end_fills_hole() {
        let f = file(FormattingPolicy::AlwaysTails);
        let txn = Txn::new();
        f.write(&txn, 4, &Flow::Kernel(b"xy")).unwrap();
        assert_eq!(read_all(&f), b"\0\0\0\0xy");
    }

    #[test]
    fn extent_write_leaves_unmapped_holes() {
        let f = file(FormattingPolicy::NeverTails);
        let txn = Txn::new();
        f.write(&txn, 40, &Flow::Kernel(b"end")).unwrap();
        assert_eq!(f.container(), Container::Extents);
        assert_eq!(f.items().len(), 1);
        let mut want = vec![0_u8; 40];
        want.extend_from_slice(b"end");
        assert_eq!(read_all(&f), want);
    }

    #[test]
    fn user_fault_before_progress_fails() {
        let f = file(FormattingPolicy::AlwaysTails);
        let txn = Txn::new();
        let user = UserVec::new(b"abcd".to_vec()).with_fault_at(0);
        assert!(matches!(f.write(&txn, 0, &Flow::User(&user)), Err(R4Error::Fault(_))));
        assert_eq!(f.size(), 0);
    }

    #[test]
    fn read_into_user_memory() {
        let f = file(FormattingPolicy::AlwaysTails);
        let txn = Txn::new();
        f.write(&txn, 0, &Flow::Kernel(b"abcdef")).unwrap();
        let mut user = UserVec::zeroed(4);
        assert_eq!(f.read(&txn, 2, &mut FlowDest::User(&mut user)).unwrap(), 4);
        assert_eq!(user.as_slice(), b"cdef");
        assert_eq!(f.read(&txn, 6, &mut FlowDest::User(&mut user)).unwrap(), 0);
    }

    #[test]
    fn shrink_and_grow_tails() {
        let f = file(FormattingPolicy::AlwaysTails);
        let txn = Txn::new();
        f.write(&txn, 0, &Flow::Kernel(b"0123456789abcdefXYZ")).unwrap();
        f.truncate(&txn, 5).unwrap();
        assert_eq!(read_all(&f), b"01234");
        f.truncate(&txn, 8).unwrap();
        assert_eq!(read_all(&f), b"01234\0\0\0");
        f.truncate(&txn, 0).unwrap();
        assert_eq!(f.container(), Container::Empty);
        assert!(f.items().is_empty());
    }

    #[test]
    fn shrink_extents_zeroes_partial_block() {
        let f = file(FormattingPolicy::NeverTails);
        let txn = Txn::new();
        f.write(&txn, 0, &Flow::Kernel(&[b'z'; 40])).unwrap();
        f.truncate(&txn, 20).unwrap();
        assert_eq!(f.env().tree.blocks().allocated(), 2);
        f.truncate(&txn, 24).unwrap();
        let mut want = vec![b'z'; 20];
        want.extend_from_slice(&[0; 4]);
        assert_eq!(read_all(&f), want);
    }

    #[test]
    fn expanding_truncate_converts_when_policy_demands() {
        let f = file(FormattingPolicy::SmallFile);
        let txn = Txn::new();
        f.write(&txn, 0, &Flow::Kernel(b"abc")).unwrap();
        f.truncate(&txn, 100).unwrap();
        assert_eq!(f.container(), Container::Extents);
        let data = read_all(&f);
        assert_eq!(&data[..3], b"abc");
        assert!(data[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn readpage_fills_from_tails_and_extents() {
        let f = file(FormattingPolicy::AlwaysTails);
        let txn = Txn::new();
        f.write(&txn, 0, &Flow::Kernel(b"0123456789abcdefXYZ")).unwrap();
        let page = f.readpage(&txn, 1).unwrap();
        assert_eq!(&page.snapshot()[..4], b"XYZ\0");

        let g = file(FormattingPolicy::NeverTails);
        g.write(&txn, 0, &Flow::Kernel(&[7; 20])).unwrap();
        let page = g.readpage(&txn, 1).unwrap();
        assert_eq!(&page.snapshot()[..5], &[7, 7, 7, 7, 0]);
    }
}
