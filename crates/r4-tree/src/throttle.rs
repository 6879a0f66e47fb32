//! Dirty-memory backpressure between conversion steps.

use r4_types::ObjectId;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait WriteThrottle: Send + Sync {
    /// Block until writeback has caught up enough for `object` to dirty
    /// more memory.
    fn throttle_write(&self, object: ObjectId);
}

/// Throttle that never waits and counts how often it was asked.
#[derive(Debug, Default)]
pub struct CountingThrottle {
    calls: AtomicU64,
}

impl CountingThrottle {
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl WriteThrottle for CountingThrottle {
    fn throttle_write(&self, _object: ObjectId) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}
