#![forbid(unsafe_code)]
//! Page cache.
//!
//! Fixed-size pages keyed by `(object, page index)`. A page's byte buffer
//! sits behind a mutex that doubles as the page lock; state bits
//! (up to date, dirty, under writeback) are atomics readable without it.

use parking_lot::{Condvar, Mutex, MutexGuard};
use r4_error::{R4Error, Result};
use r4_types::ObjectId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// Held page lock: exclusive access to the page bytes.
pub type PageGuard<'a> = MutexGuard<'a, Vec<u8>>;

#[derive(Debug)]
pub struct Page {
    index: u64,
    data: Mutex<Vec<u8>>,
    uptodate: AtomicBool,
    dirty: AtomicBool,
    writeback: Mutex<bool>,
    writeback_done: Condvar,
}

impl Page {
    #[must_use]
    pub fn new(index: u64, size: usize) -> Self {
        Self {
            index,
            data: Mutex::new(vec![0_u8; size]),
            uptodate: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            writeback: Mutex::new(false),
            writeback_done: Condvar::new(),
        }
    }

    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Byte offset of the page's first byte within the file.
    #[must_use]
    pub fn file_offset(&self, page_size: usize) -> u64 {
        self.index * page_size as u64
    }

    /// Take the page lock.
    pub fn lock(&self) -> PageGuard<'_> {
        self.data.lock()
    }

    /// Copy of the page bytes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.uptodate.load(Ordering::Acquire)
    }

    pub fn set_uptodate(&self) {
        self.uptodate.store(true, Ordering::Release);
    }

    pub fn clear_uptodate(&self) {
        self.uptodate.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_writeback(&self) -> bool {
        *self.writeback.lock()
    }

    pub fn set_writeback(&self) {
        *self.writeback.lock() = true;
    }

    pub fn end_writeback(&self) {
        let mut wb = self.writeback.lock();
        *wb = false;
        drop(wb);
        self.writeback_done.notify_all();
    }

    /// Block until no writeback is in flight on this page.
    pub fn wait_on_writeback(&self) {
        let mut wb = self.writeback.lock();
        while *wb {
            self.writeback_done.wait(&mut wb);
        }
    }
}

/// Page cache shared by every file of a volume.
#[derive(Debug)]
pub struct PageCache {
    page_size: usize,
    pages: Mutex<BTreeMap<(ObjectId, u64), Arc<Page>>>,
}

impl PageCache {
    pub fn new(page_size: usize) -> Result<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(R4Error::Format(format!(
                "invalid page_size={page_size} (must be power of two)"
            )));
        }
        Ok(Self {
            page_size,
            pages: Mutex::new(BTreeMap::new()),
        })
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// A fresh zeroed page that is not yet in the cache.
    #[must_use]
    pub fn alloc_page(&self, index: u64) -> Arc<Page> {
        Arc::new(Page::new(index, self.page_size))
    }

    /// Insert a page allocated by [`PageCache::alloc_page`].
    pub fn add_to_cache(&self, object: ObjectId, page: Arc<Page>) -> Result<()> {
        let mut pages = self.pages.lock();
        let slot = (object, page.index());
        if pages.contains_key(&slot) {
            return Err(R4Error::Busy(format!(
                "page {} of object {object} already cached",
                page.index()
            )));
        }
        pages.insert(slot, page);
        Ok(())
    }

    #[must_use]
    pub fn find(&self, object: ObjectId, index: u64) -> Option<Arc<Page>> {
        self.pages.lock().get(&(object, index)).cloned()
    }

    pub fn find_or_create(&self, object: ObjectId, index: u64) -> Arc<Page> {
        let mut pages = self.pages.lock();
        Arc::clone(
            pages
                .entry((object, index))
                .or_insert_with(|| Arc::new(Page::new(index, self.page_size))),
        )
    }

    /// Drop one page from the cache.
    pub fn remove(&self, object: ObjectId, index: u64) -> Option<Arc<Page>> {
        self.pages.lock().remove(&(object, index))
    }

    /// Drop pages `first..end` of `object`. Returns how many were cached.
    pub fn invalidate_range(&self, object: ObjectId, first: u64, end: u64) -> usize {
        let mut pages = self.pages.lock();
        let doomed: Vec<_> = pages
            .range((object, first)..(object, end))
            .map(|(slot, _)| *slot)
            .collect();
        for slot in &doomed {
            pages.remove(slot);
        }
        drop(pages);
        trace!(object = object.0, first, end, dropped = doomed.len(), "invalidate_range");
        doomed.len()
    }

    /// Cached page indices of `object` that are dirty.
    #[must_use]
    pub fn dirty_pages(&self, object: ObjectId) -> Vec<u64> {
        self.pages
            .lock()
            .range((object, 0)..=(object, u64::MAX))
            .filter(|(_, page)| page.is_dirty())
            .map(|((_, index), _)| *index)
            .collect()
    }

    /// Cached page, filled by `filler` when it is not up to date.
    ///
    /// `filler` runs with the page lock held and must mark the page up to
    /// date on success; a page that is still not up to date afterwards is
    /// an I/O error.
    pub fn read_mapping_page<F>(&self, object: ObjectId, index: u64, filler: F) -> Result<Arc<Page>>
    where
        F: FnOnce(&Page, &mut [u8]) -> Result<()>,
    {
        let page = self.find_or_create(object, index);
        if page.is_uptodate() {
            return Ok(page);
        }
        {
            let mut guard = page.lock();
            if !page.is_uptodate() {
                filler(page.as_ref(), guard.as_mut_slice())?;
            }
        }
        if !page.is_uptodate() {
            return Err(R4Error::io(format!(
                "page {index} of object {object} not uptodate after read"
            )));
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn rejects_bad_page_size() {
        assert!(PageCache::new(0).is_err());
        assert!(PageCache::new(24).is_err());
        assert!(PageCache::new(16).is_ok());
    }

    #[test]
    fn add_then_find() {
        let cache = PageCache::new(16).unwrap();
        let page = cache.alloc_page(3);
        page.lock()[0] = 9;
        cache.add_to_cache(ObjectId(1), Arc::clone(&page)).unwrap();
        let found = cache.find(ObjectId(1), 3).unwrap();
        assert_eq!(found.snapshot()[0], 9);
        assert!(cache.find(ObjectId(2), 3).is_none());
        assert!(matches!(
            cache.add_to_cache(ObjectId(1), cache.alloc_page(3)),
            Err(R4Error::Busy(_))
        ));
    }

    #[test]
    fn invalidate_range_is_per_object() {
        let cache = PageCache::new(16).unwrap();
        for index in 0..4 {
            cache.find_or_create(ObjectId(1), index);
            cache.find_or_create(ObjectId(2), index);
        }
        assert_eq!(cache.invalidate_range(ObjectId(1), 1, 3), 2);
        assert!(cache.find(ObjectId(1), 0).is_some());
        assert!(cache.find(ObjectId(1), 1).is_none());
        assert!(cache.find(ObjectId(1), 3).is_some());
        assert!(cache.find(ObjectId(2), 1).is_some());
    }

    #[test]
    fn read_mapping_page_requires_uptodate() {
        let cache = PageCache::new(16).unwrap();
        let err = cache
            .read_mapping_page(ObjectId(1), 0, |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, R4Error::Io(_)));

        let page = cache
            .read_mapping_page(ObjectId(1), 0, |page, bytes| {
                bytes.fill(b'x');
                page.set_uptodate();
                Ok(())
            })
            .unwrap();
        assert_eq!(page.snapshot(), vec![b'x'; 16]);
        // Second read does not call the filler.
        let again = cache
            .read_mapping_page(ObjectId(1), 0, |_, _| Err(R4Error::io("unexpected")))
            .unwrap();
        assert!(again.is_uptodate());
    }

    #[test]
    fn dirty_pages_lists_only_dirty() {
        let cache = PageCache::new(16).unwrap();
        cache.find_or_create(ObjectId(1), 0).mark_dirty();
        cache.find_or_create(ObjectId(1), 1);
        cache.find_or_create(ObjectId(1), 2).mark_dirty();
        assert_eq!(cache.dirty_pages(ObjectId(1)), vec![0, 2]);
    }

    #[test]
    fn wait_on_writeback_blocks_until_end() {
        let page = Arc::new(Page::new(0, 16));
        page.set_writeback();
        let waiter = {
            let page = Arc::clone(&page);
            thread::spawn(move || {
                page.wait_on_writeback();
                page.is_writeback()
            })
        };
        page.end_writeback();
        assert!(!waiter.join().unwrap());
    }
}
