//! Base container
//!
//! A container is one named engine table plus the open/closed state and
//! typed access every versioned container builds on. Reads and writes go
//! through the store's transaction rules: they join the caller's
//! transaction when one is passed and otherwise run in their own
//! micro-transaction, retried on deadlock.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use redb::TableDefinition;
use tracing::debug;

use super::compact::CompactStats;
use super::cursor::{Cursor, Direction, Lookup};
use super::engine::{Entry, RawDefinition, Scope, Store, StoreOptions, Transaction};
use super::errors::{StoreError, StoreResult};
use crate::mvcc::{PurgeCounts, PurgePlanner, RevisionState, Version};

/// Default bounded retries for compaction while transactions are live.
pub const DEFAULT_COMPACTION_ATTEMPTS: u32 = 16;

pub struct Container {
    store: Arc<Store>,
    name: &'static str,
    table: RawDefinition,
    open: AtomicBool,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Container {
    /// Opens the table `name`, creating it when `options.create` is set.
    pub fn open(
        store: Arc<Store>,
        name: &'static str,
        txn: Option<&Transaction<'_>>,
        options: StoreOptions,
    ) -> StoreResult<Self> {
        let table = TableDefinition::new(name);
        if options.create {
            store.create_table(txn, name, table)?;
        } else {
            store.require_table(txn, name, table)?;
        }
        debug!(container = name, "container opened");
        Ok(Self {
            store,
            name,
            table,
            open: AtomicBool::new(true),
        })
    }

    /// Marks the container closed. Later calls fail with `ContainerClosed`.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(container = self.name, "container closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub(crate) fn table(&self) -> RawDefinition {
        self.table
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StoreError::ContainerClosed(self.name))
        }
    }

    /// Runs a read under `txn` or a retried snapshot.
    pub(crate) fn read<T>(
        &self,
        txn: Option<&Transaction<'_>>,
        f: impl FnMut(&Scope<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.check_open()?;
        self.store.read(txn, self.name, f)
    }

    /// Runs a write under `txn` or a retried micro-transaction.
    pub(crate) fn write<T>(
        &self,
        txn: Option<&Transaction<'_>>,
        f: impl FnMut(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.check_open()?;
        self.store.write(txn, self.name, f)
    }

    pub fn get(&self, txn: Option<&Transaction<'_>>, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.read(txn, |scope| scope.get(self.table, key))
    }

    pub fn put(&self, txn: Option<&Transaction<'_>>, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.write(txn, |t| self.insert(t, key, value))
    }

    /// Physically removes `key`. Returns whether it existed.
    pub fn delete(&self, txn: Option<&Transaction<'_>>, key: &[u8]) -> StoreResult<bool> {
        self.write(txn, |t| self.remove(t, key))
    }

    /// First entry at or after `from` that still starts with `prefix`.
    pub fn seek(
        &self,
        txn: Option<&Transaction<'_>>,
        from: &[u8],
        prefix: &[u8],
    ) -> StoreResult<Option<Entry>> {
        self.read(txn, |scope| scope.seek(self.table, from, prefix))
    }

    pub(crate) fn insert(&self, txn: &Transaction<'_>, key: &[u8], value: &[u8]) -> StoreResult<()> {
        txn.table(self.table)?.insert(key, value)?;
        Ok(())
    }

    pub(crate) fn remove(&self, txn: &Transaction<'_>, key: &[u8]) -> StoreResult<bool> {
        Ok(txn.table(self.table)?.remove(key)?.is_some())
    }

    /// Cursor over every key starting with `prefix`.
    pub fn cursor<'t>(
        &'t self,
        txn: Option<&'t Transaction<'t>>,
        prefix: Vec<u8>,
        direction: Direction,
    ) -> StoreResult<Cursor<'t>> {
        self.check_open()?;
        Cursor::new(&self.store, self.name, self.table, txn, prefix, direction)
    }

    /// Reusable point-lookup handle.
    pub fn lookup<'t>(&'t self, txn: Option<&'t Transaction<'t>>) -> StoreResult<Lookup<'t>> {
        self.check_open()?;
        Lookup::new(&self.store, self.name, txn)
    }

    /// Collects every key whose revision `select` picks.
    pub(crate) fn collect_keys(
        &self,
        txn: Option<&Transaction<'_>>,
        mut select: impl FnMut(&[u8], &[u8]) -> StoreResult<bool>,
    ) -> StoreResult<(u64, Vec<Vec<u8>>)> {
        let mut cursor = self.cursor(txn, Vec::new(), Direction::Forward)?;
        let mut scanned = 0;
        let mut keys = Vec::new();
        while let Some((key, value)) = cursor.next_entry()? {
            scanned += 1;
            if select(&key, &value)? {
                keys.push(key);
            }
        }
        cursor.close();
        Ok((scanned, keys))
    }

    /// Removes every revision the purge planner marks reclaimable.
    /// `split` maps a key to its entity prefix and version. The scan and
    /// the removals share `txn`, so callers can clean derived tables in the
    /// same transaction.
    pub(crate) fn purge_below(
        &self,
        txn: &Transaction<'_>,
        watermark: Version,
        split: impl Fn(&[u8]) -> StoreResult<(usize, Version)>,
    ) -> StoreResult<(PurgeCounts, Vec<Entry>)> {
        let mut planner = PurgePlanner::new(watermark);
        let mut reclaimed = Vec::new();
        {
            let mut cursor = self.cursor(Some(txn), Vec::new(), Direction::Forward)?;
            while let Some((key, value)) = cursor.next_entry()? {
                let (entity_len, version) = split(&key)?;
                if planner.observe(&key[..entity_len], version) == RevisionState::Reclaimable {
                    reclaimed.push((key, value));
                }
            }
        }

        let mut table = txn.table(self.table)?;
        for (key, _) in &reclaimed {
            table.remove(key.as_slice())?;
        }

        let counts = PurgeCounts {
            scanned: planner.scanned(),
            removed: reclaimed.len() as u64,
        };
        debug!(
            container = self.name,
            watermark = %watermark,
            scanned = counts.scanned,
            removed = counts.removed,
            "purged revisions"
        );
        Ok((counts, reclaimed))
    }

    /// Removes every revision written at exactly `version`, within `txn`.
    pub(crate) fn undo_version(
        &self,
        txn: &Transaction<'_>,
        version: Version,
        version_of: impl Fn(&[u8]) -> StoreResult<Version>,
    ) -> StoreResult<PurgeCounts> {
        let (scanned, keys) =
            self.collect_keys(Some(txn), |key, _| Ok(version_of(key)? == version))?;
        let mut table = txn.table(self.table)?;
        for key in &keys {
            table.remove(key.as_slice())?;
        }
        debug!(
            container = self.name,
            version = %version,
            removed = keys.len(),
            "undid version"
        );
        Ok(PurgeCounts {
            scanned,
            removed: keys.len() as u64,
        })
    }

    /// Online space reclamation for the whole engine file.
    pub fn compact(&self, attempts: u32) -> StoreResult<CompactStats> {
        self.check_open()?;
        debug!(container = self.name, "compaction requested");
        self.store.compact(attempts)
    }
}
