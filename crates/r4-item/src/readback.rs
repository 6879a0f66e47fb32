//! Filling a page from tail items.

use crate::Item;
use r4_error::Result;
use r4_page::Page;
use r4_types::Key;
use tracing::trace;

/// Tree navigation used by page readback.
///
/// Implementations take their own tree locks; callers must not hold a
/// page lock across these calls.
pub trait ItemWalker {
    /// The body item holding the byte addressed by `key`, if any.
    fn item_at(&self, key: &Key) -> Result<Option<Item>>;

    /// The item immediately after the one keyed `item_key`, of any object.
    fn next_item(&self, item_key: &Key) -> Result<Option<Item>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadbackOutcome {
    /// The page was filled; `bytes` of it came from items, the rest is zero.
    Filled { bytes: usize },
    /// Another thread brought the page up to date while the lock was
    /// dropped; nothing more was done.
    Raced,
}

/// Fill `page`, whose first byte is addressed by `key`, from the tail
/// items of `key`'s object.
///
/// Walks forward item by item until the page is full, the object has no
/// more tail items, or an item of another object shows up. Anything not
/// covered reads as zero. The page lock is released around every step to
/// the next item.
pub fn readpage_tail<W: ItemWalker + ?Sized>(walker: &W, key: &Key, page: &Page) -> Result<ReadbackOutcome> {
    let mut guard = page.lock();
    if page.is_uptodate() {
        return Ok(ReadbackOutcome::Raced);
    }
    guard.fill(0);
    let start = key.offset();
    let end = start + guard.len() as u64;
    let mut filled = 0_usize;

    let mut current = walker.item_at(key)?;
    while let Some(Item::Tail(tail)) = current.as_ref() {
        if !tail.key().same_object(key) || tail.start_offset() >= end {
            break;
        }
        let from = start.max(tail.start_offset());
        let to = end.min(tail.end_offset());
        if from < to {
            // Both ranges are bounded by the page length.
            let src = (from - tail.start_offset()) as usize;
            let dst = (from - start) as usize;
            let len = (to - from) as usize;
            guard[dst..dst + len].copy_from_slice(&tail.body()[src..src + len]);
            filled = filled.max(dst + len);
        }
        if to == end {
            break;
        }
        let item_key = *tail.key();
        drop(guard);
        current = walker.next_item(&item_key)?;
        guard = page.lock();
        if page.is_uptodate() {
            trace!(target: "r4::item", page = page.index(), "readpage_tail_raced");
            return Ok(ReadbackOutcome::Raced);
        }
    }
    page.set_uptodate();
    trace!(target: "r4::item", page = page.index(), filled, "readpage_tail");
    Ok(ReadbackOutcome::Filled { bytes: filled })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExtentItem, TailItem};
    use r4_types::{BlockNumber, ObjectId};
    use std::cell::Cell;
    use std::sync::Arc;

    fn key(oid: u64, offset: u64) -> Key {
        Key::body(5, 0, ObjectId(oid), offset)
    }

    struct VecWalker {
        items: Vec<Item>,
        steps: Cell<usize>,
        on_step: Option<Arc<Page>>,
    }

    impl VecWalker {
        fn new(items: Vec<Item>) -> Self {
            Self {
                items,
                steps: Cell::new(0),
                on_step: None,
            }
        }
    }

    impl ItemWalker for VecWalker {
        fn item_at(&self, key: &Key) -> Result<Option<Item>> {
            Ok(self
                .items
                .iter()
                .find(|item| item.key().same_object(key) && item.covers(key.offset()))
                .cloned())
        }

        fn next_item(&self, item_key: &Key) -> Result<Option<Item>> {
            self.steps.set(self.steps.get() + 1);
            if let Some(page) = &self.on_step {
                page.set_uptodate();
            }
            let pos = self.items.iter().position(|item| item.key() == item_key);
            Ok(pos.and_then(|pos| self.items.get(pos + 1)).cloned())
        }
    }

    fn tail(oid: u64, offset: u64, body: &[u8]) -> Item {
        Item::Tail(TailItem::new(key(oid, offset), body.to_vec()))
    }

    #[test]
    fn page_spans_several_items() {
        let walker = VecWalker::new(vec![
            tail(1, 0, b"0123"),
            tail(1, 4, b"4567"),
            tail(1, 8, b"89abcdefXYZ"),
        ]);
        let page = Page::new(0, 16);
        let out = readpage_tail(&walker, &key(1, 0), &page).unwrap();
        assert_eq!(out, ReadbackOutcome::Filled { bytes: 16 });
        assert_eq!(page.snapshot(), b"0123456789abcdef");
        assert!(page.is_uptodate());
        assert_eq!(walker.steps.get(), 2);
    }

    #[test]
    fn eof_zero_fills() {
        let walker = VecWalker::new(vec![tail(1, 16, b"abc")]);
        let page = Page::new(1, 16);
        let out = readpage_tail(&walker, &key(1, 16), &page).unwrap();
        assert_eq!(out, ReadbackOutcome::Filled { bytes: 3 });
        let mut want = b"abc".to_vec();
        want.resize(16, 0);
        assert_eq!(page.snapshot(), want);
    }

    #[test]
    fn other_object_ends_the_walk() {
        let walker = VecWalker::new(vec![tail(1, 0, b"ab"), tail(2, 2, b"zz")]);
        let page = Page::new(0, 8);
        readpage_tail(&walker, &key(1, 0), &page).unwrap();
        assert_eq!(page.snapshot(), b"ab\0\0\0\0\0\0");
    }

    #[test]
    fn extent_ends_the_walk() {
        let walker = VecWalker::new(vec![
            tail(1, 0, b"ab"),
            Item::Extent(ExtentItem::new(key(1, 2), BlockNumber(1), 1, 8)),
        ]);
        let page = Page::new(0, 8);
        let out = readpage_tail(&walker, &key(1, 0), &page).unwrap();
        assert_eq!(out, ReadbackOutcome::Filled { bytes: 2 });
    }

    #[test]
    fn uptodate_page_is_left_alone() {
        let walker = VecWalker::new(vec![tail(1, 0, b"ab")]);
        let page = Page::new(0, 4);
        page.set_uptodate();
        assert_eq!(
            readpage_tail(&walker, &key(1, 0), &page).unwrap(),
            ReadbackOutcome::Raced
        );
        assert_eq!(page.snapshot(), vec![0; 4]);
    }

    #[test]
    fn race_while_unlocked_aborts() {
        let page = Arc::new(Page::new(0, 8));
        let mut walker = VecWalker::new(vec![tail(1, 0, b"ab"), tail(1, 2, b"cd")]);
        walker.on_step = Some(Arc::clone(&page));
        assert_eq!(
            readpage_tail(&walker, &key(1, 0), &page).unwrap(),
            ReadbackOutcome::Raced
        );
    }
}
