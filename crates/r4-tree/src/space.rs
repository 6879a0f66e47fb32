//! Transactions and disk-space reservation.

use parking_lot::Mutex;
use r4_error::{R4Error, Result};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// The caller's open transaction handle.
///
/// One per thread of control. Restarting commits whatever the handle has
/// accumulated and drops its space grants.
#[derive(Debug, Default)]
pub struct Txn {
    restarts: Cell<u64>,
    grabbed: Cell<u64>,
}

impl Txn {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the current transaction and open a fresh one.
    pub fn restart(&self) {
        self.restarts.set(self.restarts.get() + 1);
        self.grabbed.set(0);
        trace!(target: "r4::txn", restarts = self.restarts.get(), "txn_restart");
    }

    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.restarts.get()
    }

    /// Blocks granted to this transaction since it was last restarted.
    #[must_use]
    pub fn grabbed(&self) -> u64 {
        self.grabbed.get()
    }

    fn grab(&self, blocks: u64) {
        self.grabbed.set(self.grabbed.get() + blocks);
    }
}

/// Grants disk space ahead of tree modification.
pub trait SpaceReserver: Send + Sync {
    /// Reserve `blocks` for `txn`. `can_commit` allows the reserver to
    /// force a commit to free space before giving up.
    fn reserve(&self, txn: &Txn, blocks: u64, can_commit: bool) -> Result<()>;
}

/// Space reserver over a fixed pool of free blocks.
///
/// `fail_after(n)` lets the next `n` reservations succeed and fails every
/// later one with [`R4Error::NoSpace`].
#[derive(Debug)]
pub struct MemSpace {
    free: AtomicU64,
    granted: AtomicU64,
    remaining_grants: Mutex<Option<u64>>,
}

impl MemSpace {
    #[must_use]
    pub fn new(free_blocks: u64) -> Self {
        Self {
            free: AtomicU64::new(free_blocks),
            granted: AtomicU64::new(0),
            remaining_grants: Mutex::new(None),
        }
    }

    /// Effectively unbounded space.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    pub fn fail_after(&self, grants: u64) {
        *self.remaining_grants.lock() = Some(grants);
    }

    pub fn clear_failure(&self) {
        *self.remaining_grants.lock() = None;
    }

    pub fn set_free(&self, blocks: u64) {
        self.free.store(blocks, Ordering::Relaxed);
    }

    /// Reservations granted so far.
    #[must_use]
    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }
}

impl SpaceReserver for MemSpace {
    fn reserve(&self, txn: &Txn, blocks: u64, can_commit: bool) -> Result<()> {
        {
            let mut remaining = self.remaining_grants.lock();
            if let Some(left) = remaining.as_mut() {
                if *left == 0 {
                    trace!(target: "r4::space", blocks, "reserve_injected_enospc");
                    return Err(R4Error::NoSpace);
                }
                *left -= 1;
            }
        }
        if blocks > self.free.load(Ordering::Relaxed) {
            trace!(target: "r4::space", blocks, can_commit, "reserve_enospc");
            return Err(R4Error::NoSpace);
        }
        self.granted.fetch_add(1, Ordering::Relaxed);
        txn.grab(blocks);
        trace!(target: "r4::space", blocks, can_commit, "reserve");
        Ok(())
    }
}
