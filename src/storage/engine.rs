//! Engine handle and transactions
//!
//! `Store` wraps the embedded B-tree (redb). It is an explicit handle
//! shared by every container through `Arc<Store>`; there is no global
//! engine state.
//!
//! Two transaction ownership modes exist:
//!
//! - Caller-owned: the caller opened a `Transaction` and passes it in.
//!   A deadlock is returned to the caller, who alone knows the full set
//!   of writes that must be redone.
//! - Container-owned: no transaction is passed. The store opens a
//!   micro-transaction, and a deadlock discards it and runs the
//!   operation again.
//!
//! The engine admits one writer at a time: beginning a container-owned
//! write on a thread that already holds a live `Transaction` blocks.

use std::fs;
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::thread;
use std::time::{Duration, Instant};

use redb::backends::InMemoryBackend;
use redb::{
    Database, ReadTransaction, ReadableTable, TableDefinition, TableHandle, WriteTransaction,
};
use tracing::{debug, info, trace, warn};

use super::compact::CompactStats;
use super::cursor::DEFAULT_BATCH;
use super::errors::{StoreError, StoreResult};
use crate::conflict_point::{points, ConflictPoints};

/// Definition of a byte-keyed, byte-valued engine table.
pub type RawDefinition = TableDefinition<'static, &'static [u8], &'static [u8]>;

/// A raw key/value pair copied out of the engine.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Engine-level open options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Create the backing file (and tables) if missing
    pub create: bool,
    /// Keep everything in memory; nothing touches the filesystem
    pub ram: bool,
    /// Readers always see a stable snapshot for the life of a cursor
    pub snapshot_isolation: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create: true,
            ram: false,
            snapshot_isolation: true,
        }
    }
}

impl StoreOptions {
    /// Options for a throwaway in-memory store.
    pub fn in_memory() -> Self {
        Self {
            create: true,
            ram: true,
            snapshot_isolation: true,
        }
    }
}

/// Shared handle on the embedded ordered key/value engine.
pub struct Store {
    db: RwLock<Database>,
    path: Option<PathBuf>,
    options: StoreOptions,
    conflicts: ConflictPoints,
    deadlocks: AtomicU64,
    cursor_batch: usize,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("options", &self.options)
            .field("deadlocks", &self.deadlocks())
            .finish()
    }
}

impl Store {
    /// Opens (or creates, per `options`) the engine.
    pub fn open(path: Option<&Path>, options: StoreOptions) -> StoreResult<Self> {
        let db = if options.ram {
            Database::builder().create_with_backend(InMemoryBackend::new())?
        } else {
            let path = path.ok_or_else(|| {
                StoreError::Config("an on-disk store requires a path".to_string())
            })?;
            if options.create {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                Database::create(path)?
            } else if path.exists() {
                Database::open(path)?
            } else {
                return Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("store file not found: {}", path.display()),
                )));
            }
        };

        info!(path = ?path, ram = options.ram, create = options.create, "opened engine");

        Ok(Self {
            db: RwLock::new(db),
            path: if options.ram {
                None
            } else {
                path.map(Path::to_path_buf)
            },
            options,
            conflicts: ConflictPoints::new(),
            deadlocks: AtomicU64::new(0),
            cursor_batch: DEFAULT_BATCH,
        })
    }

    /// Opens a throwaway in-memory engine.
    pub fn in_memory() -> StoreResult<Self> {
        Self::open(None, StoreOptions::in_memory())
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Entries buffered per cursor refill.
    pub fn cursor_batch(&self) -> usize {
        self.cursor_batch
    }

    pub fn set_cursor_batch(&mut self, batch: usize) {
        self.cursor_batch = batch.max(1);
    }

    pub fn conflict_points(&self) -> &ConflictPoints {
        &self.conflicts
    }

    /// Deadlocks retried by container-owned transactions so far.
    pub fn deadlocks(&self) -> u64 {
        self.deadlocks.load(Ordering::Relaxed)
    }

    /// Begins a caller-owned write transaction.
    pub fn begin(&self) -> StoreResult<Transaction<'_>> {
        let txn = self.db.read()?.begin_write()?;
        trace!("began write transaction");
        Ok(Transaction {
            store: self,
            inner: Some(txn),
        })
    }

    /// Opens a read scope: the caller's transaction when given, else a
    /// fresh snapshot owned by the scope.
    pub(crate) fn scope<'t>(&'t self, txn: Option<&'t Transaction<'t>>) -> StoreResult<Scope<'t>> {
        match txn {
            Some(txn) => Ok(Scope {
                store: self,
                kind: ScopeKind::Caller(txn),
            }),
            None => self.snapshot(),
        }
    }

    pub(crate) fn snapshot(&self) -> StoreResult<Scope<'_>> {
        let txn = self.db.read()?.begin_read()?;
        Ok(Scope {
            store: self,
            kind: ScopeKind::Snapshot(txn),
        })
    }

    pub(crate) fn note_deadlock(&self, container: &'static str, attempt: u32, err: &StoreError) {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
        debug!(container, attempt, error = %err, "deadlock, retrying");
    }

    /// Runs a read. Inside a caller transaction a deadlock is returned;
    /// otherwise the snapshot is discarded and `f` runs again.
    pub fn read<T>(
        &self,
        txn: Option<&Transaction<'_>>,
        container: &'static str,
        mut f: impl FnMut(&Scope<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        if let Some(txn) = txn {
            return f(&Scope {
                store: self,
                kind: ScopeKind::Caller(txn),
            });
        }

        let mut attempt = 0;
        loop {
            let scope = self.snapshot()?;
            match f(&scope) {
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    self.note_deadlock(container, attempt, &e);
                }
                result => return result,
            }
        }
    }

    /// Runs a write. Inside a caller transaction a deadlock is returned;
    /// otherwise the micro-transaction is aborted and `f` runs again.
    pub fn write<T>(
        &self,
        txn: Option<&Transaction<'_>>,
        container: &'static str,
        mut f: impl FnMut(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        if let Some(txn) = txn {
            return f(txn);
        }

        let mut attempt = 0;
        loop {
            let txn = self.begin()?;
            let result = f(&txn).and_then(|value| {
                self.conflicts.check(points::COMMIT)?;
                Ok(value)
            });
            match result {
                Ok(value) => {
                    txn.commit()?;
                    return Ok(value);
                }
                Err(e) => {
                    if let Err(abort) = txn.abort() {
                        warn!(container, error = %abort, "abort after failed write");
                    }
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    attempt += 1;
                    self.note_deadlock(container, attempt, &e);
                }
            }
        }
    }

    /// Creates `table` if it does not exist yet.
    pub(crate) fn create_table(
        &self,
        txn: Option<&Transaction<'_>>,
        container: &'static str,
        table: RawDefinition,
    ) -> StoreResult<()> {
        self.write(txn, container, |t| {
            t.table(table)?;
            Ok(())
        })
    }

    /// Verifies that `table` exists without creating it. Opening a table
    /// inside a write transaction creates it, so this lists tables instead.
    pub(crate) fn require_table(
        &self,
        txn: Option<&Transaction<'_>>,
        container: &'static str,
        table: RawDefinition,
    ) -> StoreResult<()> {
        self.read(txn, container, |scope| {
            if scope.has_table(table.name())? {
                Ok(())
            } else {
                Err(StoreError::MissingTable(container))
            }
        })
    }

    fn file_size(&self) -> StoreResult<Option<u64>> {
        match &self.path {
            Some(path) => Ok(Some(fs::metadata(path)?.len())),
            None => Ok(None),
        }
    }

    /// Reclaims free space online.
    ///
    /// Compaction needs every transaction to have ended; while some are
    /// live it waits and retries up to `attempts` times. It either
    /// completes or leaves the file untouched.
    pub fn compact(&self, attempts: u32) -> StoreResult<CompactStats> {
        let started = Instant::now();
        let bytes_before = self.file_size()?;
        let mut tries = 0;

        let compacted = {
            let mut db = self.db.write()?;
            loop {
                tries += 1;
                match db.compact() {
                    Ok(compacted) => break compacted,
                    Err(redb::CompactionError::Storage(e)) => return Err(e.into()),
                    Err(e) if tries < attempts.max(1) => {
                        debug!(attempt = tries, error = %e, "compaction blocked, waiting");
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        warn!(attempts = tries, error = %e, "compaction gave up");
                        return Err(StoreError::CompactionBusy {
                            stats: CompactStats {
                                duration: started.elapsed(),
                                compacted: false,
                                attempts: tries,
                                bytes_before,
                                bytes_after: bytes_before,
                                deadlocks: self.deadlocks(),
                            },
                        });
                    }
                }
            }
        };

        let stats = CompactStats {
            duration: started.elapsed(),
            compacted,
            attempts: tries,
            bytes_before,
            bytes_after: self.file_size()?,
            deadlocks: self.deadlocks(),
        };
        info!(
            compacted = stats.compacted,
            attempts = stats.attempts,
            reclaimed = stats.bytes_reclaimed(),
            duration_ms = stats.duration.as_millis() as u64,
            "compaction finished"
        );
        Ok(stats)
    }
}

/// A caller-owned write transaction.
///
/// Must be ended with [`Transaction::commit`] or [`Transaction::abort`];
/// dropping a live transaction aborts it.
pub struct Transaction<'s> {
    store: &'s Store,
    inner: Option<WriteTransaction>,
}

impl<'s> Transaction<'s> {
    fn inner(&self) -> StoreResult<&WriteTransaction> {
        self.inner.as_ref().ok_or(StoreError::TransactionFinished)
    }

    pub fn store(&self) -> &'s Store {
        self.store
    }

    /// Opens `table` for writing. The handle must be dropped before the
    /// same table is opened again within this transaction.
    pub(crate) fn table(
        &self,
        table: RawDefinition,
    ) -> StoreResult<redb::Table<'_, &'static [u8], &'static [u8]>> {
        self.store.conflicts.check(points::TABLE_WRITE)?;
        Ok(self.inner()?.open_table(table)?)
    }

    pub fn commit(mut self) -> StoreResult<()> {
        let txn = self.inner.take().ok_or(StoreError::TransactionFinished)?;
        txn.commit()?;
        trace!("committed write transaction");
        Ok(())
    }

    pub fn abort(mut self) -> StoreResult<()> {
        let txn = self.inner.take().ok_or(StoreError::TransactionFinished)?;
        txn.abort()?;
        trace!("aborted write transaction");
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Some(txn) = self.inner.take() {
            warn!("write transaction dropped without commit or abort, aborting");
            if let Err(e) = txn.abort() {
                warn!(error = %e, "abort of dropped transaction failed");
            }
        }
    }
}

/// Object-safe read access shared by snapshot and write tables.
pub(crate) trait RawTable {
    fn fetch(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Up to `limit` entries in ascending key order starting at `from`.
    fn scan(&self, from: Bound<&[u8]>, limit: usize) -> StoreResult<Vec<Entry>>;

    /// Up to `limit` entries in descending key order ending at `to`.
    fn scan_back(&self, to: Bound<&[u8]>, limit: usize) -> StoreResult<Vec<Entry>>;
}

impl<T> RawTable for T
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    fn fetch(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.get(key)?.map(|value| value.value().to_vec()))
    }

    fn scan(&self, from: Bound<&[u8]>, limit: usize) -> StoreResult<Vec<Entry>> {
        let mut entries = Vec::new();
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (from, Bound::Unbounded);
        for entry in self.range::<&[u8]>(bounds)? {
            let (key, value) = entry?;
            entries.push((key.value().to_vec(), value.value().to_vec()));
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }

    fn scan_back(&self, to: Bound<&[u8]>, limit: usize) -> StoreResult<Vec<Entry>> {
        let mut entries = Vec::new();
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Unbounded, to);
        for entry in self.range::<&[u8]>(bounds)?.rev() {
            let (key, value) = entry?;
            entries.push((key.value().to_vec(), value.value().to_vec()));
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }
}

enum ScopeKind<'t> {
    Snapshot(ReadTransaction),
    Caller(&'t Transaction<'t>),
}

/// The transaction a read runs under.
pub struct Scope<'t> {
    store: &'t Store,
    kind: ScopeKind<'t>,
}

impl<'t> Scope<'t> {
    /// Whether the scope owns its transaction (and so may retry).
    pub fn is_owned(&self) -> bool {
        matches!(self.kind, ScopeKind::Snapshot(_))
    }

    pub fn store(&self) -> &'t Store {
        self.store
    }

    pub(crate) fn table<'a>(&'a self, table: RawDefinition) -> StoreResult<Box<dyn RawTable + 'a>> {
        self.store.conflicts.check(points::TABLE_READ)?;
        match &self.kind {
            ScopeKind::Snapshot(txn) => Ok(Box::new(txn.open_table(table)?)),
            ScopeKind::Caller(txn) => Ok(Box::new(txn.inner()?.open_table(table)?)),
        }
    }

    pub(crate) fn has_table(&self, name: &str) -> StoreResult<bool> {
        self.store.conflicts.check(points::TABLE_READ)?;
        let found = match &self.kind {
            ScopeKind::Snapshot(txn) => txn.list_tables()?.any(|t| t.name() == name),
            ScopeKind::Caller(txn) => txn.inner()?.list_tables()?.any(|t| t.name() == name),
        };
        Ok(found)
    }

    /// First entry at or after `from` whose key starts with `prefix`.
    pub(crate) fn seek(
        &self,
        table: RawDefinition,
        from: &[u8],
        prefix: &[u8],
    ) -> StoreResult<Option<Entry>> {
        let entries = self.table(table)?.scan(Bound::Included(from), 1)?;
        Ok(entries.into_iter().next().filter(|(key, _)| key.starts_with(prefix)))
    }

    pub(crate) fn get(&self, table: RawDefinition, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.table(table)?.fetch(key)
    }
}
