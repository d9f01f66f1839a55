//! When to collapse the update log.

/// Entry count above which a flush triggers compaction.
pub const PREFERRED_TRIM_SIZE: u64 = 500;

/// Pure compaction decision over the live entry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    pub trim_size: u64,
}

/// Range a compaction should collapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Highest key merged; the merged fragment is stored here
    pub upto: u64,
    /// Entry count at decision time
    pub entries: u64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            trim_size: PREFERRED_TRIM_SIZE,
        }
    }
}

impl CompactionPolicy {
    pub fn new(trim_size: u64) -> Self {
        Self { trim_size }
    }

    /// Strictly greater: a log sitting exactly at the threshold is left alone.
    pub fn should_compact(&self, dbsize: u64) -> bool {
        dbsize > self.trim_size
    }

    /// Plan a compaction covering everything up to `cursor`.
    ///
    /// Nothing below key 1 exists, so a zero cursor never plans.
    pub fn plan(&self, dbsize: u64, cursor: u64) -> Option<CompactionPlan> {
        if !self.should_compact(dbsize) || cursor == 0 {
            return None;
        }
        Some(CompactionPlan {
            upto: cursor,
            entries: dbsize,
        })
    }
}
