#![forbid(unsafe_code)]
//! Exclusive/non-exclusive access to a file.
//!
//! Every change to the shape of a file body (tail/extent conversion,
//! append, truncate) runs under exclusive access; reads run under
//! non-exclusive access. Waiting writers hold back new readers.
//!
//! # Transactions
//!
//! A caller must not wait for the latch while its transaction is open:
//! the holder may need that transaction to commit before it can finish.
//! Acquisition therefore restarts the caller's [`Txn`] first, and every
//! release restarts it again so that a long holder does not pin a commit.

use parking_lot::{Condvar, Mutex};
use r4_tree::Txn;
use std::thread::{self, ThreadId};
use tracing::trace;

#[derive(Debug, Default)]
struct LatchState {
    exclusive: bool,
    readers: u32,
    writers_waiting: u32,
    owner: Option<ThreadId>,
    last_reader: Option<ThreadId>,
}

/// Per-file access latch.
#[derive(Debug, Default)]
pub struct AccessController {
    state: Mutex<LatchState>,
    changed: Condvar,
}

impl AccessController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no reader or writer holds the latch, then hold it
    /// exclusively. Released when the guard drops.
    pub fn get_exclusive<'a>(&'a self, txn: &'a Txn) -> ExclusiveGuard<'a> {
        self.get_exclusive_access(txn);
        ExclusiveGuard { latch: self, txn }
    }

    /// Block until no writer holds or waits for the latch, then hold a
    /// reader slot.
    pub fn get_nonexclusive<'a>(&'a self, txn: &'a Txn) -> NonExclusiveGuard<'a> {
        self.get_nonexclusive_access(txn);
        NonExclusiveGuard { latch: self, txn }
    }

    /// Take a reader slot only if no writer is in the way.
    pub fn try_get_nonexclusive<'a>(&'a self, txn: &'a Txn) -> Option<NonExclusiveGuard<'a>> {
        self.try_get_nonexclusive_access()
            .then_some(NonExclusiveGuard { latch: self, txn })
    }

    /// Raw acquisition; pair with [`Self::drop_exclusive_access`].
    pub fn get_exclusive_access(&self, txn: &Txn) {
        txn.restart();
        let me = thread::current().id();
        let mut state = self.state.lock();
        debug_assert_ne!(
            state.owner,
            Some(me),
            "exclusive access taken twice by one thread"
        );
        state.writers_waiting += 1;
        while state.exclusive || state.readers > 0 {
            self.changed.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.exclusive = true;
        state.owner = Some(me);
        trace!(target: "r4::access", "get_exclusive");
    }

    pub fn drop_exclusive_access(&self, txn: &Txn) {
        {
            let mut state = self.state.lock();
            debug_assert!(state.exclusive, "exclusive access dropped but not held");
            debug_assert_eq!(state.readers, 0);
            state.exclusive = false;
            state.owner = None;
        }
        self.changed.notify_all();
        trace!(target: "r4::access", "drop_exclusive");
        txn.restart();
    }

    /// Raw acquisition; pair with [`Self::drop_nonexclusive_access`].
    pub fn get_nonexclusive_access(&self, txn: &Txn) {
        txn.restart();
        let mut state = self.state.lock();
        while state.exclusive || state.writers_waiting > 0 {
            self.changed.wait(&mut state);
        }
        Self::add_reader(&mut state);
    }

    pub fn try_get_nonexclusive_access(&self) -> bool {
        let mut state = self.state.lock();
        if state.exclusive || state.writers_waiting > 0 {
            return false;
        }
        Self::add_reader(&mut state);
        true
    }

    fn add_reader(state: &mut LatchState) {
        debug_assert!(state.readers < u32::MAX, "reader count overflow");
        debug_assert!(!state.exclusive);
        state.readers += 1;
        state.last_reader = Some(thread::current().id());
        trace!(target: "r4::access", readers = state.readers, "get_nonexclusive");
    }

    pub fn drop_nonexclusive_access(&self, txn: &Txn) {
        let wake = {
            let mut state = self.state.lock();
            debug_assert!(state.readers > 0, "reader count underflow");
            state.readers = state.readers.saturating_sub(1);
            trace!(target: "r4::access", readers = state.readers, "drop_nonexclusive");
            state.readers == 0
        };
        if wake {
            self.changed.notify_all();
        }
        txn.restart();
    }

    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.state.lock().exclusive
    }

    #[must_use]
    pub fn readers(&self) -> u32 {
        self.state.lock().readers
    }

    /// Whether the calling thread holds exclusive access.
    #[must_use]
    pub fn held_exclusively_by_me(&self) -> bool {
        let state = self.state.lock();
        state.exclusive && state.owner == Some(thread::current().id())
    }

    /// Thread that most recently took a reader slot.
    #[must_use]
    pub fn last_reader(&self) -> Option<ThreadId> {
        self.state.lock().last_reader
    }
}

/// Held exclusive access.
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    latch: &'a AccessController,
    txn: &'a Txn,
}

impl ExclusiveGuard<'_> {
    /// Let go of the latch, run `between` (typically write throttling),
    /// and take the latch back. Other threads' readers and commits get to
    /// run in the gap.
    pub fn cycle(&mut self, between: impl FnOnce()) {
        self.latch.drop_exclusive_access(self.txn);
        between();
        self.latch.get_exclusive_access(self.txn);
    }

    #[must_use]
    pub fn txn(&self) -> &Txn {
        self.txn
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.latch.drop_exclusive_access(self.txn);
    }
}

/// Held reader slot.
#[derive(Debug)]
pub struct NonExclusiveGuard<'a> {
    latch: &'a AccessController,
    txn: &'a Txn,
}

impl NonExclusiveGuard<'_> {
    #[must_use]
    pub fn txn(&self) -> &Txn {
        self.txn
    }
}

impl Drop for NonExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.latch.drop_nonexclusive_access(self.txn);
    }
}
