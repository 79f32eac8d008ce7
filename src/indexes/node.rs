//! Skip-list nodes
//!
//! ```text
//! level count (1) | (prev (opt uuid), next (opt uuid), distance (4)) * count
//! ```
//!
//! A node with zero levels is the tombstone: the key left the index at
//! that version.

use uuid::Uuid;

use crate::storage::{RecordReader, RecordWriter, StoreError, StoreResult};

/// Most levels a node may carry.
pub const MAX_LEVELS: usize = 32;

/// Neighbors of a node at one level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkipLevel {
    pub prev: Option<Uuid>,
    pub next: Option<Uuid>,
    /// Entries skipped by following `next` at this level
    pub distance: u32,
}

impl SkipLevel {
    pub fn new(prev: Option<Uuid>, next: Option<Uuid>, distance: u32) -> Self {
        Self {
            prev,
            next,
            distance,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SkipNode {
    pub levels: Vec<SkipLevel>,
}

impl SkipNode {
    pub fn new(levels: Vec<SkipLevel>) -> Self {
        Self { levels }
    }

    /// The tombstone node.
    pub fn removed() -> Self {
        Self::default()
    }

    pub fn is_removed(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Bottom-level successor.
    pub fn next(&self) -> Option<Uuid> {
        self.levels.first().and_then(|level| level.next)
    }

    /// Bottom-level predecessor.
    pub fn prev(&self) -> Option<Uuid> {
        self.levels.first().and_then(|level| level.prev)
    }

    pub(crate) fn encode(&self) -> StoreResult<Vec<u8>> {
        if self.levels.len() > MAX_LEVELS {
            return Err(StoreError::InvalidArgument(format!(
                "skip-list node has {} levels, at most {} allowed",
                self.levels.len(),
                MAX_LEVELS
            )));
        }
        let mut w = RecordWriter::with_capacity(1 + self.levels.len() * 38);
        w.put_u8(self.levels.len() as u8);
        for level in &self.levels {
            w.put_opt_uuid(level.prev.as_ref())
                .put_opt_uuid(level.next.as_ref())
                .put_u32(level.distance);
        }
        Ok(w.finish())
    }

    pub(crate) fn decode(container: &'static str, key: &[u8], data: &[u8]) -> StoreResult<Self> {
        let mut r = RecordReader::new(container, key, data);
        let count = r.get_u8()? as usize;
        let mut levels = Vec::with_capacity(count);
        for _ in 0..count {
            levels.push(SkipLevel {
                prev: r.get_opt_uuid()?,
                next: r.get_opt_uuid()?,
                distance: r.get_u32()?,
            });
        }
        r.finish()?;
        Ok(Self { levels })
    }
}
