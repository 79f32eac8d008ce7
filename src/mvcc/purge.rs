//! Revision purging below a watermark
//!
//! A revision R(version = V) of one entity is reclaimable iff:
//! 1. V < watermark
//! 2. A newer revision of the same entity also lies below the watermark
//!
//! The newest revision below the watermark is the authoritative snapshot
//! for every read at or above the watermark, so it is always retained,
//! tombstones included. Revisions at or above the watermark are live.
//!
//! Keys are walked in ascending byte order. Because versions are stored
//! complemented, each entity's revisions arrive newest first.

use serde::Serialize;

use super::Version;

/// Lifecycle state of one revision with respect to a watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionState {
    /// At or above the watermark; untouchable
    Live,
    /// Newest revision below the watermark; answers reads at the watermark
    Retained,
    /// Superseded below the watermark; may be removed
    Reclaimable,
}

/// Streaming purge planner over one table's keys.
#[derive(Debug)]
pub struct PurgePlanner {
    watermark: Version,
    entity: Option<Vec<u8>>,
    retained: bool,
    scanned: u64,
    reclaimable: u64,
}

impl PurgePlanner {
    pub fn new(watermark: Version) -> Self {
        Self {
            watermark,
            entity: None,
            retained: false,
            scanned: 0,
            reclaimable: 0,
        }
    }

    pub fn watermark(&self) -> Version {
        self.watermark
    }

    /// Classifies the next revision. `entity` is the key prefix naming the
    /// entity the revision belongs to.
    pub fn observe(&mut self, entity: &[u8], version: Version) -> RevisionState {
        self.scanned += 1;
        if self.entity.as_deref() != Some(entity) {
            self.entity = Some(entity.to_vec());
            self.retained = false;
        }

        if version >= self.watermark {
            return RevisionState::Live;
        }
        if !self.retained {
            self.retained = true;
            return RevisionState::Retained;
        }
        self.reclaimable += 1;
        RevisionState::Reclaimable
    }

    /// Revisions observed so far.
    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    /// Revisions classified reclaimable so far.
    pub fn reclaimable(&self) -> u64 {
        self.reclaimable
    }
}

/// Counts reported by a purge or undo pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeCounts {
    pub scanned: u64,
    pub removed: u64,
}

impl PurgeCounts {
    pub fn merge(&mut self, other: PurgeCounts) {
        self.scanned += other.scanned;
        self.removed += other.removed;
    }
}
