//! Conflict point injection
//!
//! Each store owns a `ConflictPoints` injector. Arming a point makes the
//! next `n` engine accesses at that site fail with
//! `StoreError::Deadlock`, exactly as a lock-manager deadlock would. This
//! drives the retry and propagation paths deterministically in tests.
//!
//! # Usage
//!
//! ```ignore
//! store.conflict_points().arm(points::TABLE_READ, 2);
//! // the next two table opens under a read scope report a deadlock
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::storage::{StoreError, StoreResult};

/// All defined conflict point names
pub mod points {
    /// Opening a table for a point lookup or scan
    pub const TABLE_READ: &str = "table_read";
    /// Opening a table inside a write transaction
    pub const TABLE_WRITE: &str = "table_write";
    /// Committing a container-owned write transaction
    pub const COMMIT: &str = "commit";

    /// Get all conflict point names
    pub fn all() -> &'static [&'static str] {
        &[TABLE_READ, TABLE_WRITE, COMMIT]
    }
}

/// Per-store deadlock injector.
#[derive(Debug, Default)]
pub struct ConflictPoints {
    armed: AtomicBool,
    remaining: Mutex<HashMap<&'static str, u32>>,
}

impl ConflictPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` accesses at `site` report a deadlock.
    pub fn arm(&self, site: &'static str, times: u32) {
        if let Ok(mut remaining) = self.remaining.lock() {
            *remaining.entry(site).or_insert(0) += times;
            self.armed.store(true, Ordering::Release);
        }
    }

    /// Disarms every point.
    pub fn clear(&self) {
        if let Ok(mut remaining) = self.remaining.lock() {
            remaining.clear();
            self.armed.store(false, Ordering::Release);
        }
    }

    /// Returns how many injected deadlocks are still pending at `site`.
    pub fn pending(&self, site: &str) -> u32 {
        self.remaining
            .lock()
            .map(|r| r.get(site).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Fails with a deadlock if `site` is armed. Free when nothing is armed.
    #[inline]
    pub(crate) fn check(&self, site: &'static str) -> StoreResult<()> {
        if !self.armed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut remaining = self.remaining.lock()?;
        match remaining.get_mut(site) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if remaining.values().all(|c| *c == 0) {
                    self.armed.store(false, Ordering::Release);
                }
                Err(StoreError::Deadlock { site })
            }
            _ => Ok(()),
        }
    }
}
