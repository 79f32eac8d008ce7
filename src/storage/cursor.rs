//! Cursors and lookup handles
//!
//! A cursor walks one key prefix of one table in key order, forward or
//! backward. It owns its read scope for its whole life:
//!
//! - Without a caller transaction it holds its own snapshot. A deadlock
//!   discards the snapshot and resumes from the last key returned, so
//!   the caller never sees the conflict.
//! - Inside a caller transaction it borrows that transaction and a
//!   deadlock is returned to the caller.
//!
//! Entries are fetched in batches. `close` releases the scope early and
//! is idempotent; dropping a cursor closes it.

use std::collections::VecDeque;
use std::ops::Bound;

use tracing::trace;

use super::engine::{Entry, RawDefinition, Scope, Store, Transaction};
use super::errors::StoreResult;

/// Default number of entries fetched per batch.
pub const DEFAULT_BATCH: usize = 64;

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// if no such key exists (empty prefix, or all bytes `0xff`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Runs `f` under `scope`, replacing an owned snapshot after a deadlock.
fn run_scoped<'t, T>(
    store: &'t Store,
    scope: &mut Scope<'t>,
    container: &'static str,
    mut f: impl FnMut(&Scope<'t>) -> StoreResult<T>,
) -> StoreResult<T> {
    let mut attempt = 0;
    loop {
        match f(scope) {
            Err(e) if e.is_retryable() && scope.is_owned() => {
                attempt += 1;
                store.note_deadlock(container, attempt, &e);
                *scope = store.snapshot()?;
            }
            result => return result,
        }
    }
}

/// Reusable point-lookup handle bound to one read scope.
pub struct Lookup<'t> {
    store: &'t Store,
    container: &'static str,
    scope: Option<Scope<'t>>,
}

impl<'t> Lookup<'t> {
    pub(crate) fn new(
        store: &'t Store,
        container: &'static str,
        txn: Option<&'t Transaction<'t>>,
    ) -> StoreResult<Self> {
        Ok(Self {
            store,
            container,
            scope: Some(store.scope(txn)?),
        })
    }

    /// Runs `f` against the current scope. A closed lookup reopens on a
    /// fresh snapshot.
    pub(crate) fn with_scope<T>(
        &mut self,
        f: impl FnMut(&Scope<'t>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let scope = match self.scope.take() {
            Some(scope) => scope,
            None => self.store.snapshot()?,
        };
        let scope = self.scope.insert(scope);
        run_scoped(self.store, scope, self.container, f)
    }

    pub fn get(&mut self, table: RawDefinition, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.with_scope(|scope| scope.get(table, key))
    }

    pub fn seek(
        &mut self,
        table: RawDefinition,
        from: &[u8],
        prefix: &[u8],
    ) -> StoreResult<Option<Entry>> {
        self.with_scope(|scope| scope.seek(table, from, prefix))
    }

    /// Takes a fresh snapshot so later lookups see newer commits. Inside a
    /// caller transaction this is a no-op.
    pub fn reset(&mut self) -> StoreResult<()> {
        if self.scope.as_ref().map_or(true, Scope::is_owned) {
            self.scope = Some(self.store.snapshot()?);
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.scope = None;
    }
}

/// Prefix cursor over a raw table.
pub struct Cursor<'t> {
    store: &'t Store,
    container: &'static str,
    table: RawDefinition,
    scope: Option<Scope<'t>>,
    prefix: Vec<u8>,
    direction: Direction,
    position: Bound<Vec<u8>>,
    buffer: VecDeque<Entry>,
    batch: usize,
    exhausted: bool,
}

impl<'t> Cursor<'t> {
    /// Cursor over every key starting with `prefix`.
    pub(crate) fn new(
        store: &'t Store,
        container: &'static str,
        table: RawDefinition,
        txn: Option<&'t Transaction<'t>>,
        prefix: Vec<u8>,
        direction: Direction,
    ) -> StoreResult<Self> {
        let position = match direction {
            Direction::Forward => Bound::Included(prefix.clone()),
            Direction::Backward => match prefix_successor(&prefix) {
                Some(end) => Bound::Excluded(end),
                None => Bound::Unbounded,
            },
        };
        Ok(Self {
            store,
            container,
            table,
            scope: Some(store.scope(txn)?),
            prefix,
            direction,
            position,
            buffer: VecDeque::new(),
            batch: store.cursor_batch(),
            exhausted: false,
        })
    }

    /// Starts the walk at `key` (inclusive) instead of the prefix boundary.
    pub(crate) fn starting_at(mut self, key: Vec<u8>) -> Self {
        self.position = Bound::Included(key);
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.scope.is_none()
    }

    /// Returns the next entry, or `None` once the prefix is exhausted or
    /// the cursor is closed. Running out releases the read scope.
    pub fn next_entry(&mut self) -> StoreResult<Option<Entry>> {
        if self.buffer.is_empty() && !self.exhausted && self.scope.is_some() {
            self.refill()?;
        }
        let entry = self.buffer.pop_front();
        if entry.is_none() && self.scope.take().is_some() {
            trace!(container = self.container, "cursor exhausted, scope released");
        }
        Ok(entry)
    }

    fn refill(&mut self) -> StoreResult<()> {
        let Some(scope) = self.scope.as_mut() else {
            return Ok(());
        };

        if scope.is_owned() && !self.store.options().snapshot_isolation {
            *scope = self.store.snapshot()?;
        }

        let table = self.table;
        let batch = self.batch;
        let direction = self.direction;
        let position = self.position.clone();
        let entries = run_scoped(self.store, scope, self.container, |scope| {
            let raw = scope.table(table)?;
            let from = match &position {
                Bound::Included(key) => Bound::Included(key.as_slice()),
                Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
                Bound::Unbounded => Bound::Unbounded,
            };
            match direction {
                Direction::Forward => raw.scan(from, batch),
                Direction::Backward => raw.scan_back(from, batch),
            }
        })?;

        let fetched = entries.len();
        for (key, value) in entries {
            if !key.starts_with(&self.prefix) {
                self.exhausted = true;
                break;
            }
            self.position = Bound::Excluded(key.clone());
            self.buffer.push_back((key, value));
        }
        if fetched < batch {
            self.exhausted = true;
        }
        trace!(
            container = self.container,
            buffered = self.buffer.len(),
            exhausted = self.exhausted,
            "cursor refill"
        );
        Ok(())
    }

    /// Point lookup in `table` under this cursor's scope.
    pub(crate) fn get_in(&mut self, table: RawDefinition, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match self.scope.as_mut() {
            Some(scope) => run_scoped(self.store, scope, self.container, |s| s.get(table, key)),
            None => Ok(None),
        }
    }

    /// Seek in `table` under this cursor's scope.
    pub(crate) fn seek_in(
        &mut self,
        table: RawDefinition,
        from: &[u8],
        prefix: &[u8],
    ) -> StoreResult<Option<Entry>> {
        match self.scope.as_mut() {
            Some(scope) => {
                run_scoped(self.store, scope, self.container, |s| s.seek(table, from, prefix))
            }
            None => Ok(None),
        }
    }

    /// Takes a fresh snapshot and resumes after the last key returned.
    pub fn reset(&mut self) -> StoreResult<()> {
        if let Some(scope) = self.scope.as_mut() {
            if scope.is_owned() {
                *scope = self.store.snapshot()?;
            }
        }
        if let Some((key, _)) = self.buffer.front() {
            self.position = Bound::Included(key.clone());
        }
        self.buffer.clear();
        self.exhausted = false;
        Ok(())
    }

    /// Releases the read scope. Safe to call more than once.
    pub fn close(&mut self) {
        if self.scope.take().is_some() {
            trace!(container = self.container, "cursor closed");
        }
        self.buffer.clear();
        self.exhausted = true;
    }
}

impl Iterator for Cursor<'_> {
    type Item = StoreResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
