//! Tail/extent conversion.
//!
//! Both directions copy the body in bounded batches, each batch under its
//! own space reservation, and drop the file latch between batches so
//! commits and readers can make progress. Before the first item is
//! touched the persisted `PART_MIXED` flag is set; a later call finds it
//! and resumes where the run of converted items starting at offset 0
//! ends. Holes are converted like data, so that run has no gaps.
//! The in-memory `in_conv` flag is cleared on every exit path.

use crate::{Container, UnixFile, estimate};
use r4_access::ExclusiveGuard;
use r4_error::{R4Error, Result};
use r4_item::{Flow, FlowDest, Item, ItemKind, LookupBias, NoKillHook};
use r4_page::Page;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// What one conversion call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionReport {
    /// Batches run, each followed by a latch drop.
    pub iterations: u32,
    /// Tail-to-extent replace steps.
    pub replaces: u32,
    pub pages: u32,
    /// Body bytes moved by this call.
    pub bytes: u64,
    /// Lengths of the tail runs written, one per page (extent to tail).
    pub segments: Vec<u64>,
    /// Body ranges cut from the old representation.
    pub cut_ranges: Vec<Range<u64>>,
    /// Offset the call resumed from, when a previous one was interrupted.
    pub resumed_from: Option<u64>,
}

impl UnixFile {
    /// Move the whole body from tail items into extents.
    ///
    /// The caller holds exclusive access through `guard`.
    pub fn tail2extent(&self, guard: &mut ExclusiveGuard<'_>) -> Result<ConversionReport> {
        debug_assert!(self.access().held_exclusively_by_me());
        if self.in_conversion() {
            return Err(R4Error::InvariantViolation(format!(
                "object {}: conversion already running",
                self.object()
            )));
        }
        if self.find_file_state()? == Container::Extents && !self.is_mixed()? {
            return Err(R4Error::InvariantViolation(format!(
                "object {}: already built of extents",
                self.object()
            )));
        }

        self.set_in_conv(true);
        let mut report = ConversionReport::default();
        let result = self.tail2extent_steps(guard, &mut report);
        self.set_in_conv(false);

        let outcome = match result {
            Ok(()) => {
                self.complete_conversion(guard, Container::Extents)?;
                debug!(
                    target: "r4::conv",
                    object = self.object().0,
                    iterations = report.iterations,
                    replaces = report.replaces,
                    bytes = report.bytes,
                    resumed_from = ?report.resumed_from,
                    "tail2extent_done"
                );
                Ok(report)
            }
            Err(err) => {
                warn!(target: "r4::conv", object = self.object().0, error = %err, "tail2extent_stopped");
                Err(err)
            }
        };
        debug_assert!(!self.in_conversion());
        outcome
    }

    fn tail2extent_steps(&self, guard: &mut ExclusiveGuard<'_>, report: &mut ConversionReport) -> Result<()> {
        let ps = self.config().page_size as u64;
        let batch = self.config().tail2extent_pages;
        let height = self.env().tree.height();
        let object = self.object();

        let size = self.size();
        let mut offset = 0_u64;
        let mut mixed = self.is_mixed()?;
        if mixed {
            offset = self.env().tree.prefix_end(&self.body_key(0), ItemKind::Extent);
            if offset >= size {
                debug!(target: "r4::conv", object = object.0, offset, "tail2extent_nothing_left");
                report.resumed_from = Some(offset);
                return Ok(());
            }
            if offset % ps != 0 {
                return Err(R4Error::Corruption {
                    object: object.0,
                    detail: format!("converted extents end at unaligned offset {offset}"),
                });
            }
            report.resumed_from = Some(offset);
        }
        self.env().cache.invalidate_range(object, offset / ps, u64::MAX);

        loop {
            self.env()
                .space
                .reserve(guard.txn(), estimate::tail2extent(height, batch), true)?;
            if !mixed {
                self.set_mixed(true)?;
                mixed = true;
            }

            let mut pages = Vec::with_capacity(batch);
            let mut span = 0_u64;
            let mut tail_bytes = 0_u64;
            for _ in 0..batch {
                let at = offset + span;
                if at >= size {
                    break;
                }
                let page = self.env().cache.alloc_page(at / ps);
                let (filled, from_tails) = self.fill_page_from_tails(&page, at, size)?;
                span += filled;
                tail_bytes += from_tails;
                pages.push(page);
            }
            if !pages.is_empty() {
                self.replace(offset, span, tail_bytes, &pages, report)?;
                offset += span;
            }
            let eof = offset >= size;
            report.iterations += 1;
            trace!(target: "r4::conv", object = object.0, offset, eof, "tail2extent_iteration");

            guard.cycle(|| self.env().throttle.throttle_write(object));
            if eof {
                return Ok(());
            }
        }
    }

    /// Copy the body bytes of `page` starting at `start` from tail items.
    /// Stops at the page end or at `size`; gaps between tails read as
    /// zeros. Returns the bytes covered and how many of them came from
    /// tails.
    fn fill_page_from_tails(&self, page: &Page, start: u64, size: u64) -> Result<(u64, u64)> {
        let mut data = page.lock();
        #[expect(clippy::cast_possible_truncation)] // bounded by the page length
        let limit = (size - start).min(data.len() as u64) as usize;
        data.fill(0);
        let mut pos = 0_usize;
        let mut from_tails = 0_u64;
        while pos < limit {
            let key = self.body_key(start + pos as u64);
            let Some((item, coord)) = self.env().tree.find_item(&key, LookupBias::Exact)? else {
                let next = self.env().tree.next_item_offset(&key).unwrap_or(u64::MAX);
                #[expect(clippy::cast_possible_truncation)] // bounded by limit
                let gap = (next - key.offset()).min((limit - pos) as u64) as usize;
                pos += gap;
                continue;
            };
            let Item::Tail(tail) = &item else {
                return Err(R4Error::Corruption {
                    object: self.object().0,
                    detail: format!("{} item inside tail body at {}", item.kind().name(), key.offset()),
                });
            };
            #[expect(clippy::cast_possible_truncation)] // unit positions of found tails fit the item
            let unit = coord.unit_pos as usize;
            let n = tail.read(unit, &mut FlowDest::Kernel(&mut data[..limit]), pos)?;
            if n == 0 {
                return Err(R4Error::io(format!(
                    "object {}: empty tail read at {}",
                    self.object(),
                    key.offset()
                )));
            }
            pos += n;
            from_tails += n as u64;
        }
        Ok((limit as u64, from_tails))
    }

    /// Swap the tails holding `count` bytes at `offset` for extents built
    /// from `pages`.
    fn replace(
        &self,
        offset: u64,
        count: u64,
        tail_bytes: u64,
        pages: &[Arc<Page>],
        report: &mut ConversionReport,
    ) -> Result<()> {
        let object = self.object();
        let from = self.body_key(offset);
        let to = self.body_key(offset + count - 1);
        let removed = self.env().tree.cut_range(&from, &to, &mut NoKillHook)?;
        report.cut_ranges.push(offset..offset + count);
        if removed != tail_bytes {
            error!(
                target: "r4::conv",
                object = object.0,
                offset,
                tail_bytes,
                removed,
                "cut tail bytes differ from copied bytes, run fsck"
            );
            return Err(R4Error::NeedsFsck(format!(
                "object {object}: cut {removed} tail bytes at {offset}, copied {tail_bytes}"
            )));
        }
        for page in pages {
            if let Err(err) = self.map_page(page) {
                error!(
                    target: "r4::conv",
                    object = object.0,
                    page = page.index(),
                    error = %err,
                    "tail removed but extent not created, run fsck"
                );
                return Err(R4Error::NeedsFsck(format!(
                    "object {object}: page {} lost its tails: {err}",
                    page.index()
                )));
            }
        }
        report.replaces += 1;
        report.pages += u32::try_from(pages.len()).unwrap_or(u32::MAX);
        report.bytes += count;
        debug!(target: "r4::conv", object = object.0, offset, count, pages = pages.len(), "replace");
        Ok(())
    }

    /// Put a freshly filled page into the cache and map it to a new block.
    fn map_page(&self, page: &Arc<Page>) -> Result<()> {
        let object = self.object();
        let key = self.body_key(page.file_offset(self.config().page_size));
        self.env().cache.remove(object, page.index());
        self.env().cache.add_to_cache(object, Arc::clone(page))?;
        page.set_uptodate();
        self.env().tree.create_extent(&key, &page.snapshot())?;
        Ok(())
    }

    /// Move the whole body from extents into tail items.
    ///
    /// The caller holds exclusive access through `guard`.
    pub fn extent2tail(&self, guard: &mut ExclusiveGuard<'_>) -> Result<ConversionReport> {
        debug_assert!(self.access().held_exclusively_by_me());
        if self.in_conversion() {
            return Err(R4Error::InvariantViolation(format!(
                "object {}: conversion already running",
                self.object()
            )));
        }
        if self.find_file_state()? == Container::Tails && !self.is_mixed()? {
            return Err(R4Error::InvariantViolation(format!(
                "object {}: already built of tails",
                self.object()
            )));
        }

        self.set_in_conv(true);
        let mut report = ConversionReport::default();
        let result = self.extent2tail_steps(guard, &mut report);
        self.set_in_conv(false);

        let outcome = match result {
            Ok(()) => {
                self.complete_conversion(guard, Container::Tails)?;
                debug!(
                    target: "r4::conv",
                    object = self.object().0,
                    iterations = report.iterations,
                    bytes = report.bytes,
                    resumed_from = ?report.resumed_from,
                    "extent2tail_done"
                );
                Ok(report)
            }
            Err(err) => {
                warn!(target: "r4::conv", object = self.object().0, error = %err, "extent2tail_stopped");
                Err(err)
            }
        };
        debug_assert!(!self.in_conversion());
        outcome
    }

    fn extent2tail_steps(&self, guard: &mut ExclusiveGuard<'_>, report: &mut ConversionReport) -> Result<()> {
        let ps = self.config().page_size as u64;
        let batch = self.config().extent2tail_pages as u64;
        let height = self.env().tree.height();
        let object = self.object();
        let size = self.size();
        let num_pages = size.div_ceil(ps);

        let mut first = 0_u64;
        let mut mixed = self.is_mixed()?;
        if mixed {
            let converted = self.env().tree.prefix_end(&self.body_key(0), ItemKind::Tail);
            if converted < size && converted % ps != 0 {
                return Err(R4Error::Corruption {
                    object: object.0,
                    detail: format!("converted tails end at unaligned offset {converted}"),
                });
            }
            first = converted.div_ceil(ps);
            report.resumed_from = Some(converted);
            if first >= num_pages {
                debug!(target: "r4::conv", object = object.0, converted, "extent2tail_nothing_left");
            }
        }

        for index in first..num_pages {
            self.env()
                .space
                .reserve(guard.txn(), estimate::extent2tail(height, self.config()), true)?;
            if !mixed {
                self.set_mixed(true)?;
                mixed = true;
            }

            let page = self.read_extent_page(index)?;
            let start = index * ps;
            let count = (size - start).min(ps);
            self.env()
                .tree
                .cut_range(&self.body_key(start), &self.body_key(start + count - 1), &mut NoKillHook)?;
            report.cut_ranges.push(start..start + count);

            self.write_page_as_tails(&page, start, count)?;
            report.segments.push(count);
            report.bytes += count;
            report.pages += 1;

            page.wait_on_writeback();
            self.env().cache.remove(object, index);
            trace!(target: "r4::conv", object = object.0, index, count, "extent2tail_page");

            if (index + 1 - first) % batch == 0 || index + 1 == num_pages {
                report.iterations += 1;
                guard.cycle(|| self.env().throttle.throttle_write(object));
            }
        }
        Ok(())
    }

    /// Write the first `count` bytes of `page` as tails at `start`. The
    /// extent behind them is already gone, so any failure needs fsck.
    fn write_page_as_tails(&self, page: &Page, start: u64, count: u64) -> Result<()> {
        let data = page.snapshot();
        #[expect(clippy::cast_possible_truncation)] // count <= page size
        let count = count as usize;
        let flow = Flow::Kernel(&data[..count]);
        let mut written = 0_usize;
        while written < count {
            let key = self.body_key(start + written as u64);
            match self.env().tree.write_tail(&key, &flow, written, count - written) {
                Ok(n) if n > 0 => written += n,
                Ok(_) => {
                    error!(target: "r4::conv", object = self.object().0, start, written, "short tail write after extent cut, run fsck");
                    return Err(R4Error::NeedsFsck(format!(
                        "object {}: no progress writing tails at {}",
                        self.object(),
                        key.offset()
                    )));
                }
                Err(err) => {
                    error!(target: "r4::conv", object = self.object().0, start, written, error = %err, "extent removed but tails not written, run fsck");
                    return Err(R4Error::NeedsFsck(format!(
                        "object {}: page at {start} lost its extent: {err}",
                        self.object()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Record a finished conversion. Failing to reserve space for clearing
    /// the mixed flag leaves it set; the next resume scan clears it.
    fn complete_conversion(&self, guard: &ExclusiveGuard<'_>, container: Container) -> Result<()> {
        self.set_container(container);
        let height = self.env().tree.height();
        match self.env().space.reserve(guard.txn(), estimate::sd_update(height), true) {
            Ok(()) => self.set_mixed(false),
            Err(err) => {
                warn!(
                    target: "r4::conv",
                    object = self.object().0,
                    error = %err,
                    "no space to clear the mixed flag, leaving it set"
                );
                Ok(())
            }
        }
    }
}
