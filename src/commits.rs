//! Commits container
//!
//! Append-only commit log for audit and diagnostics.
//!
//! ```text
//! commits   version (4, ascending)
//!             -> timestamp ms (8) | view size (8) | commit count (4) | view name (opt str)
//! ```

use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::debug;

use crate::mvcc::{PurgeCounts, Version};
use crate::storage::{
    version_at, Container, Cursor, Direction, RecordReader, RecordWriter, Store, StoreError,
    StoreOptions, StoreResult, Transaction,
};

const COMMITS: &str = "commits";

/// One committed version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommitRecord {
    pub version: Version,
    pub timestamp: DateTime<Utc>,
    /// Bytes of item records written
    pub view_size: u64,
    /// Records written
    pub commit_count: u32,
    pub view_name: Option<String>,
}

impl CommitRecord {
    pub fn new(version: Version, view_name: Option<&str>) -> Self {
        Self {
            version,
            timestamp: Utc::now(),
            view_size: 0,
            commit_count: 0,
            view_name: view_name.map(str::to_string),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::with_capacity(24);
        w.put_i64(self.timestamp.timestamp_millis())
            .put_u64(self.view_size)
            .put_u32(self.commit_count)
            .put_opt_str(self.view_name.as_deref());
        w.finish()
    }

    fn decode(key: &[u8], data: &[u8]) -> StoreResult<Self> {
        let version = version_at(COMMITS, key, 0)?;
        let mut r = RecordReader::new(COMMITS, key, data);
        let millis = r.get_i64()?;
        let timestamp = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| StoreError::corrupt(COMMITS, key, format!("bad timestamp {}", millis)))?;
        let record = Self {
            version,
            timestamp,
            view_size: r.get_u64()?,
            commit_count: r.get_u32()?,
            view_name: r.get_opt_str()?,
        };
        r.finish()?;
        Ok(record)
    }
}

#[derive(Debug)]
pub struct CommitsContainer {
    commits: Container,
}

impl CommitsContainer {
    pub fn open(
        store: Arc<Store>,
        txn: Option<&Transaction<'_>>,
        options: StoreOptions,
    ) -> StoreResult<Self> {
        Ok(Self {
            commits: Container::open(store, COMMITS, txn, options)?,
        })
    }

    pub fn close(&self) {
        self.commits.close();
    }

    pub fn log_commit(&self, txn: Option<&Transaction<'_>>, record: &CommitRecord) -> StoreResult<()> {
        self.commits
            .put(txn, &record.version.to_be_bytes(), &record.encode())?;
        debug!(
            version = %record.version,
            view = record.view_name.as_deref().unwrap_or(""),
            count = record.commit_count,
            "commit logged"
        );
        Ok(())
    }

    pub fn get_commit(
        &self,
        txn: Option<&Transaction<'_>>,
        version: Version,
    ) -> StoreResult<Option<CommitRecord>> {
        let key = version.to_be_bytes();
        match self.commits.get(txn, &key)? {
            Some(value) => Ok(Some(CommitRecord::decode(&key, &value)?)),
            None => Ok(None),
        }
    }

    /// Commit records with versions in `from..=to`, oldest first.
    pub fn iter_commits<'t>(
        &'t self,
        txn: Option<&'t Transaction<'t>>,
        from: Version,
        to: Version,
    ) -> StoreResult<CommitIter<'t>> {
        let cursor = self
            .commits
            .cursor(txn, Vec::new(), Direction::Forward)?
            .starting_at(from.to_be_bytes().to_vec());
        Ok(CommitIter {
            cursor,
            range: from..=to,
        })
    }

    /// Drops every record older than `watermark`.
    pub fn purge_commits(&self, txn: Option<&Transaction<'_>>, watermark: Version) -> StoreResult<PurgeCounts> {
        let (scanned, keys) = self.commits.write(txn, |t| {
            let (scanned, keys) = self
                .commits
                .collect_keys(Some(t), |key, _| Ok(version_at(COMMITS, key, 0)? < watermark))?;
            for key in &keys {
                self.commits.remove(t, key)?;
            }
            Ok((scanned, keys))
        })?;
        debug!(watermark = %watermark, removed = keys.len(), "purged commit log");
        Ok(PurgeCounts {
            scanned,
            removed: keys.len() as u64,
        })
    }

    /// Removes the record of `version`, if any.
    pub fn undo_commit(&self, txn: Option<&Transaction<'_>>, version: Version) -> StoreResult<bool> {
        self.commits.delete(txn, &version.to_be_bytes())
    }
}

/// Commit records over an inclusive version range.
pub struct CommitIter<'t> {
    cursor: Cursor<'t>,
    range: RangeInclusive<Version>,
}

impl CommitIter<'_> {
    pub fn next_entry(&mut self) -> StoreResult<Option<CommitRecord>> {
        match self.cursor.next_entry()? {
            Some((k, v)) => {
                let record = CommitRecord::decode(&k, &v)?;
                if self.range.contains(&record.version) {
                    Ok(Some(record))
                } else {
                    self.cursor.close();
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    pub fn close(&mut self) {
        self.cursor.close();
    }
}

impl Iterator for CommitIter<'_> {
    type Item = StoreResult<CommitRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
