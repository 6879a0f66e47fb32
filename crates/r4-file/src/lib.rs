#![forbid(unsafe_code)]
//! Unix regular files over the r4 tree.
//!
//! A file body is stored either in tail items (small files, packed into
//! tree nodes) or in extent items (runs of unformatted blocks). The
//! formatting policy decides which one a file of a given size should
//! use, and the conversion engine moves a body between the two.
//!
//! # State
//!
//! - `container`: in-memory summary of how the body is stored; `Unknown`
//!   until first discovered from the tree.
//! - `in_conv`: in-memory, set while a conversion is running, including
//!   the windows in which the converter has dropped the latch.
//! - `PART_MIXED`: persisted in stat-data; a conversion started and has
//!   not finished. Reopening the file completes it.

pub mod config;
pub mod conversion;
pub mod estimate;
mod io;

pub use config::{FileConfig, FormattingPolicy};
pub use conversion::ConversionReport;

use r4_access::{AccessController, ExclusiveGuard};
use r4_error::{R4Error, Result};
use r4_item::{Item, ItemKind, LookupBias, SdFlags, StatData};
use r4_page::PageCache;
use r4_tree::{CountingThrottle, MemSpace, MemTree, SpaceReserver, Txn, WriteThrottle};
use r4_types::{Key, KeyFormat, KeyType, ObjectId};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::thread;
use tracing::{debug, warn};

/// How a file body is currently stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Container {
    Unknown = 0,
    Empty = 1,
    Tails = 2,
    Extents = 3,
}

impl Container {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Empty,
            2 => Self::Tails,
            3 => Self::Extents,
            _ => Self::Unknown,
        }
    }
}

/// Collaborators shared by the files of one tree.
#[derive(Clone)]
pub struct FileEnv {
    pub tree: Arc<MemTree>,
    pub cache: Arc<PageCache>,
    pub space: Arc<dyn SpaceReserver>,
    pub throttle: Arc<dyn WriteThrottle>,
}

impl fmt::Debug for FileEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEnv")
            .field("tree_items", &self.tree.len())
            .field("page_size", &self.cache.page_size())
            .finish_non_exhaustive()
    }
}

impl FileEnv {
    /// Fresh in-memory tree, page cache, unlimited space and a counting
    /// throttle, all sized from `config`.
    pub fn in_memory(config: &FileConfig, format: KeyFormat) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tree: Arc::new(MemTree::new(format, config.page_size, config.max_tail_item)?),
            cache: Arc::new(PageCache::new(config.page_size)?),
            space: Arc::new(MemSpace::unlimited()),
            throttle: Arc::new(CountingThrottle::default()),
        })
    }

    /// Same tree, fresh page cache: what a remount sees.
    pub fn remount(&self) -> Result<Self> {
        Ok(Self {
            cache: Arc::new(PageCache::new(self.cache.page_size())?),
            ..self.clone()
        })
    }
}

#[derive(Debug)]
pub struct UnixFile {
    env: FileEnv,
    config: FileConfig,
    sd_key: Key,
    access: AccessController,
    container: AtomicU8,
    in_conv: AtomicBool,
    size: AtomicU64,
    openers: AtomicU32,
}

impl UnixFile {
    /// Create an empty file: insert its stat-data.
    pub fn create(
        env: FileEnv,
        config: FileConfig,
        locality: u64,
        ordering: u64,
        objectid: ObjectId,
    ) -> Result<Self> {
        let sd_key = r4_key::build_sd_key(env.tree.format(), locality, ordering, objectid);
        if env.tree.item(&sd_key).is_some() {
            return Err(R4Error::Busy(format!("object {objectid} already exists")));
        }
        let file = Self::new(env, config, sd_key, 0, Container::Empty)?;
        file.env.tree.update_stat_data(StatData::new(sd_key, 0));
        debug!(target: "r4::file", object = objectid.0, "create");
        Ok(file)
    }

    /// Instantiate an existing file from its stat-data.
    pub fn load(env: FileEnv, config: FileConfig, sd_key: Key) -> Result<Self> {
        let sd = env.tree.stat_data(&sd_key)?;
        Self::new(env, config, sd_key, sd.size, Container::Unknown)
    }

    fn new(env: FileEnv, config: FileConfig, sd_key: Key, size: u64, container: Container) -> Result<Self> {
        config.validate()?;
        if env.tree.block_size() != config.page_size || env.cache.page_size() != config.page_size {
            return Err(R4Error::Format(format!(
                "page size {} differs from block size {} or cache page size {}",
                config.page_size,
                env.tree.block_size(),
                env.cache.page_size()
            )));
        }
        Ok(Self {
            env,
            config,
            sd_key,
            access: AccessController::new(),
            container: AtomicU8::new(container as u8),
            in_conv: AtomicBool::new(false),
            size: AtomicU64::new(size),
            openers: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub fn object(&self) -> ObjectId {
        self.sd_key.objectid()
    }

    #[must_use]
    pub fn sd_key(&self) -> &Key {
        &self.sd_key
    }

    #[must_use]
    pub fn config(&self) -> &FileConfig {
        &self.config
    }

    #[must_use]
    pub fn env(&self) -> &FileEnv {
        &self.env
    }

    #[must_use]
    pub fn access(&self) -> &AccessController {
        &self.access
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn container(&self) -> Container {
        Container::from_raw(self.container.load(Ordering::Acquire))
    }

    /// A conversion is running, possibly with the latch dropped.
    #[must_use]
    pub fn in_conversion(&self) -> bool {
        self.in_conv.load(Ordering::Acquire)
    }

    /// The persisted mixed flag.
    pub fn is_mixed(&self) -> Result<bool> {
        Ok(self.env.tree.stat_data(&self.sd_key)?.is_mixed())
    }

    /// Key of body byte `offset`.
    #[must_use]
    pub fn body_key(&self, offset: u64) -> Key {
        self.sd_key.with_type(KeyType::Body).with_offset(offset)
    }

    /// Body items of this file in offset order.
    #[must_use]
    pub fn items(&self) -> Vec<Item> {
        self.env.tree.body_items(&self.body_key(0))
    }

    pub(crate) fn set_container(&self, container: Container) {
        self.container.store(container as u8, Ordering::Release);
    }

    pub(crate) fn set_in_conv(&self, on: bool) {
        self.in_conv.store(on, Ordering::Release);
    }

    pub(crate) fn update_sd(&self, change: impl FnOnce(&mut StatData)) -> Result<()> {
        let mut sd = self.env.tree.stat_data(&self.sd_key)?;
        change(&mut sd);
        self.env.tree.update_stat_data(sd);
        Ok(())
    }

    pub(crate) fn set_mixed(&self, on: bool) -> Result<()> {
        self.update_sd(|sd| {
            if on {
                sd.flags.insert(SdFlags::PART_MIXED);
            } else {
                sd.flags.remove(SdFlags::PART_MIXED);
            }
        })
    }

    pub(crate) fn set_size(&self, size: u64) -> Result<()> {
        self.size.store(size, Ordering::Release);
        self.update_sd(|sd| sd.size = size)
    }

    /// Learn the container from the tree if it is not known yet.
    pub fn find_file_state(&self) -> Result<Container> {
        let current = self.container();
        if current != Container::Unknown {
            return Ok(current);
        }
        let state = match self.env.tree.first_body_item(&self.body_key(0)) {
            None => Container::Empty,
            Some(Item::Tail(_)) => Container::Tails,
            Some(Item::Extent(_)) => Container::Extents,
            Some(Item::StatData(_)) => {
                return Err(R4Error::Corruption {
                    object: self.object().0,
                    detail: "stat-data among body items".to_owned(),
                });
            }
        };
        self.set_container(state);
        Ok(state)
    }

    /// Kind of the item holding body byte 0.
    pub fn find_first_item(&self) -> Result<ItemKind> {
        match self.env.tree.find_item(&self.body_key(0), LookupBias::Exact)? {
            Some((item, coord)) if !coord.is_after_item() => match item.kind() {
                kind @ (ItemKind::Tail | ItemKind::Extent) => Ok(kind),
                ItemKind::StatData => Err(R4Error::io(format!(
                    "object {}: stat-data at body offset 0",
                    self.object()
                ))),
            },
            _ => Err(R4Error::io(format!(
                "object {}: no body item at offset 0",
                self.object()
            ))),
        }
    }

    /// Exclusive access, waiting out a conversion that has the latch
    /// dropped between iterations.
    pub fn get_exclusive_careful<'a>(&'a self, txn: &'a Txn) -> ExclusiveGuard<'a> {
        loop {
            let guard = self.access.get_exclusive(txn);
            if !self.in_conversion() {
                return guard;
            }
            drop(guard);
            thread::yield_now();
        }
    }

    /// Finish a conversion a crash or an earlier error left behind.
    pub(crate) fn complete_interrupted(&self, guard: &mut ExclusiveGuard<'_>) -> Result<Option<ConversionReport>> {
        if !self.is_mixed()? {
            return Ok(None);
        }
        let report = match self.find_first_item()? {
            ItemKind::Extent => self.tail2extent(guard)?,
            ItemKind::Tail => self.extent2tail(guard)?,
            ItemKind::StatData => {
                return Err(R4Error::io(format!("object {}: bad first item", self.object())));
            }
        };
        debug_assert!(!self.in_conversion());
        Ok(Some(report))
    }

    /// Open the file. Completes a conversion left unfinished.
    pub fn open(&self, txn: &Txn) -> Result<Option<ConversionReport>> {
        self.openers.fetch_add(1, Ordering::AcqRel);
        let result = self.open_inner(txn);
        if result.is_err() {
            self.openers.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    fn open_inner(&self, txn: &Txn) -> Result<Option<ConversionReport>> {
        if !self.is_mixed()? {
            return Ok(None);
        }
        let mut guard = self.get_exclusive_careful(txn);
        // Another opener may have completed it while we waited.
        self.complete_interrupted(&mut guard)
    }

    /// Drop one open reference. The last one converts an extent file that
    /// qualifies for tails back to tails.
    pub fn release(&self, txn: &Txn) -> Result<Option<ConversionReport>> {
        let previous = self
            .openers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| R4Error::InvariantViolation(format!("release of unopened object {}", self.object())))?;
        if previous != 1 {
            return Ok(None);
        }
        let mut guard = self.get_exclusive_careful(txn);
        if self.find_file_state()? != Container::Extents || !self.config.have_tail(self.size()) {
            return Ok(None);
        }
        match self.extent2tail(&mut guard) {
            Ok(report) => Ok(Some(report)),
            Err(err) => {
                warn!(target: "r4::file", object = self.object().0, error = %err, "conversion on release failed");
                Err(err)
            }
        }
    }

    /// Open references.
    #[must_use]
    pub fn openers(&self) -> u32 {
        self.openers.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r4_item::Flow;

    fn file(config: FileConfig) -> UnixFile {
        let env = FileEnv::in_memory(&config, KeyFormat::Large).unwrap();
        UnixFile::create(env, config, 10, 0, ObjectId(200)).unwrap()
    }

    #[test]
    fn create_writes_stat_data() {
        let f = file(FileConfig::with_page_size(16));
        assert_eq!(f.container(), Container::Empty);
        assert!(!f.is_mixed().unwrap());
        assert_eq!(f.env().tree.stat_data(f.sd_key()).unwrap().size, 0);
        let again = UnixFile::create(f.env().clone(), f.config().clone(), 10, 0, ObjectId(200));
        assert!(matches!(again, Err(R4Error::Busy(_))));
    }

    #[test]
    fn mismatched_geometry_is_refused() {
        let env = FileEnv::in_memory(&FileConfig::with_page_size(16), KeyFormat::Large).unwrap();
        let result = UnixFile::create(env, FileConfig::with_page_size(32), 10, 0, ObjectId(1));
        assert!(matches!(result, Err(R4Error::Format(_))));
    }

    #[test]
    fn state_discovery_after_load() {
        let f = file(FileConfig::with_page_size(16));
        let txn = Txn::new();
        f.write(&txn, 0, &Flow::Kernel(b"hello")).unwrap();
        let loaded = UnixFile::load(f.env().remount().unwrap(), f.config().clone(), *f.sd_key()).unwrap();
        assert_eq!(loaded.container(), Container::Unknown);
        assert_eq!(loaded.size(), 5);
        assert_eq!(loaded.find_file_state().unwrap(), Container::Tails);
        assert_eq!(loaded.find_first_item().unwrap(), ItemKind::Tail);
    }

    #[test]
    fn empty_file_has_no_first_item() {
        let f = file(FileConfig::with_page_size(16));
        assert_eq!(f.find_file_state().unwrap(), Container::Empty);
        assert!(matches!(f.find_first_item(), Err(R4Error::Io(_))));
    }

    #[test]
    fn release_without_open_is_rejected() {
        let f = file(FileConfig::with_page_size(16));
        let txn = Txn::new();
        assert!(matches!(f.release(&txn), Err(R4Error::InvariantViolation(_))));
        assert_eq!(f.open(&txn).unwrap(), None);
        assert_eq!(f.openers(), 1);
        assert_eq!(f.release(&txn).unwrap(), None);
        assert_eq!(f.openers(), 0);
    }
}
