//! Watermark of the highest store key applied to the local document.

use crate::storage::UpdateEntry;

/// Monotonic: once a key is covered it stays covered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SyncCursor(u64);

impl SyncCursor {
    pub fn new() -> Self {
        Self(0)
    }

    /// Highest applied key. Zero means nothing applied yet.
    pub fn position(&self) -> u64 {
        self.0
    }

    /// Move forward to `key`. Returns whether the cursor moved.
    pub fn advance(&mut self, key: u64) -> bool {
        if key > self.0 {
            self.0 = key;
            true
        } else {
            false
        }
    }

    /// Advance past every entry just read from the store.
    pub fn observe(&mut self, entries: &[UpdateEntry]) -> bool {
        entries
            .iter()
            .map(|e| e.key)
            .max()
            .is_some_and(|key| self.advance(key))
    }

    /// Whether `key` (and everything below it) has been applied.
    pub fn covers(&self, key: u64) -> bool {
        key <= self.0
    }
}
