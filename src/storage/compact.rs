//! Compaction statistics

use std::time::Duration;

use serde::Serialize;

/// Outcome of one online compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactStats {
    /// Wall time spent, including waits for live transactions to end
    pub duration: Duration,
    /// Whether the engine reclaimed anything
    pub compacted: bool,
    /// Compaction attempts made
    pub attempts: u32,
    /// Backing file size before the pass (`None` for in-memory stores)
    pub bytes_before: Option<u64>,
    /// Backing file size after the pass (`None` for in-memory stores)
    pub bytes_after: Option<u64>,
    /// Deadlocks the store has retried since it was opened
    pub deadlocks: u64,
}

impl CompactStats {
    /// Bytes given back to the filesystem.
    pub fn bytes_reclaimed(&self) -> u64 {
        match (self.bytes_before, self.bytes_after) {
            (Some(before), Some(after)) => before.saturating_sub(after),
            _ => 0,
        }
    }
}
