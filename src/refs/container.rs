//! Ref container
//!
//! ```text
//! refs         collection (16) | member (16) | ~version (4)      -> entry
//! ref_history  collection (16) | version (4) | member (16)       -> ()
//! ```
//!
//! `ref_history` lets a consumer ask which members of one collection
//! changed between two versions without replaying the collection.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use super::entry::{RefEntry, RefHead, RefLink};
use super::iter::{RefHistory, RefIterator};
use crate::mvcc::{PurgeCounts, Version};
use crate::storage::{
    key, uuid_at, version_at, version_key_at, Container, Scope, Store, StoreError, StoreOptions,
    StoreResult, Transaction,
};

pub(crate) const REFS: &str = "refs";
pub(crate) const REF_HISTORY: &str = "ref_history";

pub(crate) fn ref_key(collection: &Uuid, member: &Uuid, version: Version) -> Vec<u8> {
    key(&[collection.as_bytes(), member.as_bytes(), &version.to_key()])
}

pub(crate) fn ref_prefix(collection: &Uuid, member: &Uuid) -> Vec<u8> {
    key(&[collection.as_bytes(), member.as_bytes()])
}

fn history_key(collection: &Uuid, version: Version, member: &Uuid) -> Vec<u8> {
    key(&[collection.as_bytes(), &version.to_be_bytes(), member.as_bytes()])
}

/// Resolves the entry for `(collection, member)` at `version`.
pub(crate) fn seek_entry(
    scope: &Scope<'_>,
    refs: &Container,
    collection: &Uuid,
    member: &Uuid,
    version: Version,
) -> StoreResult<Option<RefEntry>> {
    let prefix = ref_prefix(collection, member);
    match scope.seek(refs.table(), &ref_key(collection, member, version), &prefix)? {
        Some((k, v)) => Ok(Some(RefEntry::decode(REFS, &k, &v, collection == member)?)),
        None => Ok(None),
    }
}

#[derive(Debug)]
pub struct RefContainer {
    pub(crate) refs: Container,
    pub(crate) history: Container,
}

impl RefContainer {
    pub fn open(
        store: Arc<Store>,
        txn: Option<&Transaction<'_>>,
        options: StoreOptions,
    ) -> StoreResult<Self> {
        Ok(Self {
            refs: Container::open(Arc::clone(&store), REFS, txn, options)?,
            history: Container::open(store, REF_HISTORY, txn, options)?,
        })
    }

    pub fn close(&self) {
        self.refs.close();
        self.history.close();
    }

    fn write_entry(
        &self,
        txn: Option<&Transaction<'_>>,
        collection: &Uuid,
        version: Version,
        member: &Uuid,
        entry: &RefEntry,
    ) -> StoreResult<()> {
        let value = entry.encode();
        self.refs.write(txn, |t| {
            self.refs.insert(t, &ref_key(collection, member, version), &value)?;
            self.history
                .insert(t, &history_key(collection, version, member), &[])
        })
    }

    /// Records `member`'s links in `collection` as of `version`.
    pub fn save_ref(
        &self,
        txn: Option<&Transaction<'_>>,
        collection: &Uuid,
        version: Version,
        member: &Uuid,
        link: &RefLink,
    ) -> StoreResult<()> {
        self.write_entry(txn, collection, version, member, &RefEntry::Link(link.clone()))
    }

    /// Records the list head of `collection` as of `version`.
    pub fn save_head(
        &self,
        txn: Option<&Transaction<'_>>,
        collection: &Uuid,
        version: Version,
        head: &RefHead,
    ) -> StoreResult<()> {
        self.write_entry(txn, collection, version, collection, &RefEntry::Head(head.clone()))
    }

    /// Writes the tombstone for `member` at `version`.
    pub fn delete_ref(
        &self,
        txn: Option<&Transaction<'_>>,
        collection: &Uuid,
        version: Version,
        member: &Uuid,
    ) -> StoreResult<()> {
        self.write_entry(txn, collection, version, member, &RefEntry::Removed)
    }

    /// Raw entry for `member` at `version`, tombstones included.
    pub fn load_entry(
        &self,
        txn: Option<&Transaction<'_>>,
        collection: &Uuid,
        version: Version,
        member: &Uuid,
    ) -> StoreResult<Option<RefEntry>> {
        self.refs
            .read(txn, |scope| seek_entry(scope, &self.refs, collection, member, version))
    }

    /// `member`'s links at `version`; `None` if absent or removed.
    pub fn load_ref(
        &self,
        txn: Option<&Transaction<'_>>,
        collection: &Uuid,
        version: Version,
        member: &Uuid,
    ) -> StoreResult<Option<RefLink>> {
        match self.load_entry(txn, collection, version, member)? {
            Some(RefEntry::Link(link)) => Ok(Some(link)),
            _ => Ok(None),
        }
    }

    pub fn load_head(
        &self,
        txn: Option<&Transaction<'_>>,
        collection: &Uuid,
        version: Version,
    ) -> StoreResult<Option<RefHead>> {
        match self.load_entry(txn, collection, version, collection)? {
            Some(RefEntry::Head(head)) => Ok(Some(head)),
            _ => Ok(None),
        }
    }

    /// Reusable lookup handle pinned to `(collection, version)`.
    pub fn ref_iterator<'t>(
        &'t self,
        txn: Option<&'t Transaction<'t>>,
        collection: Uuid,
        version: Version,
    ) -> StoreResult<RefIterator<'t>> {
        RefIterator::new(self, txn, collection, version)
    }

    /// Appends `member` at the tail of `collection`, writing the new link,
    /// the old tail's forward link and the head in one write. Returns false
    /// when `member` is already a live member.
    pub fn append_ref(
        &self,
        txn: Option<&Transaction<'_>>,
        collection: &Uuid,
        version: Version,
        member: &Uuid,
        alias: Option<&str>,
    ) -> StoreResult<bool> {
        if member == collection {
            return Err(StoreError::InvalidArgument(format!(
                "collection {} cannot be its own member",
                collection
            )));
        }
        self.refs.write(txn, |t| {
            if self.load_ref(Some(t), collection, version, member)?.is_some() {
                return Ok(false);
            }
            let mut head = self.load_head(Some(t), collection, version)?.unwrap_or_default();
            if let Some(tail) = head.last {
                let mut link = self
                    .load_ref(Some(t), collection, version, &tail)?
                    .ok_or_else(|| self.broken(collection, &tail, "tail has no link"))?;
                link.next = Some(*member);
                self.save_ref(Some(t), collection, version, &tail, &link)?;
            }
            let link = RefLink {
                previous: head.last,
                next: None,
                alias: alias.map(str::to_string),
            };
            self.save_ref(Some(t), collection, version, member, &link)?;

            head.first.get_or_insert(*member);
            head.last = Some(*member);
            head.count += 1;
            self.save_head(Some(t), collection, version, &head)?;
            Ok(true)
        })
    }

    /// Unlinks `member` from `collection` and writes its tombstone.
    /// Returns false when it was not a live member.
    pub fn remove_ref(
        &self,
        txn: Option<&Transaction<'_>>,
        collection: &Uuid,
        version: Version,
        member: &Uuid,
    ) -> StoreResult<bool> {
        self.refs.write(txn, |t| {
            let Some(link) = self.load_ref(Some(t), collection, version, member)? else {
                return Ok(false);
            };
            let mut head = self
                .load_head(Some(t), collection, version)?
                .ok_or_else(|| self.broken(collection, collection, "member without head"))?;

            match link.previous {
                Some(prev) => {
                    let mut before = self
                        .load_ref(Some(t), collection, version, &prev)?
                        .ok_or_else(|| self.broken(collection, &prev, "dangling previous"))?;
                    before.next = link.next;
                    self.save_ref(Some(t), collection, version, &prev, &before)?;
                }
                None => head.first = link.next,
            }
            match link.next {
                Some(next) => {
                    let mut after = self
                        .load_ref(Some(t), collection, version, &next)?
                        .ok_or_else(|| self.broken(collection, &next, "dangling next"))?;
                    after.previous = link.previous;
                    self.save_ref(Some(t), collection, version, &next, &after)?;
                }
                None => head.last = link.previous,
            }
            head.count = head.count.saturating_sub(1);
            self.save_head(Some(t), collection, version, &head)?;
            self.delete_ref(Some(t), collection, version, member)?;
            Ok(true)
        })
    }

    fn broken(&self, collection: &Uuid, member: &Uuid, reason: &str) -> StoreError {
        StoreError::corrupt(REFS, &ref_prefix(collection, member), reason)
    }

    /// Members of `collection` at `version`, head to tail.
    pub fn walk(
        &self,
        txn: Option<&Transaction<'_>>,
        collection: &Uuid,
        version: Version,
    ) -> StoreResult<Vec<(Uuid, RefLink)>> {
        self.follow(txn, collection, version, false)
    }

    /// Members of `collection` at `version`, tail to head.
    pub fn walk_back(
        &self,
        txn: Option<&Transaction<'_>>,
        collection: &Uuid,
        version: Version,
    ) -> StoreResult<Vec<(Uuid, RefLink)>> {
        self.follow(txn, collection, version, true)
    }

    fn follow(
        &self,
        txn: Option<&Transaction<'_>>,
        collection: &Uuid,
        version: Version,
        backwards: bool,
    ) -> StoreResult<Vec<(Uuid, RefLink)>> {
        self.refs.read(txn, |scope| {
            let head = match seek_entry(scope, &self.refs, collection, collection, version)? {
                Some(RefEntry::Head(head)) => head,
                _ => return Ok(Vec::new()),
            };

            let mut members = Vec::with_capacity(head.count as usize);
            let mut seen = HashSet::new();
            let mut cursor = if backwards { head.last } else { head.first };
            while let Some(member) = cursor {
                if !seen.insert(member) {
                    return Err(self.broken(collection, &member, "cycle in ref list"));
                }
                let link = match seek_entry(scope, &self.refs, collection, &member, version)? {
                    Some(RefEntry::Link(link)) => link,
                    _ => return Err(self.broken(collection, &member, "link to removed member")),
                };
                cursor = if backwards { link.previous } else { link.next };
                members.push((member, link));
            }
            Ok(members)
        })
    }

    /// Membership changes of `collection` in `from..=to`, in version order.
    pub fn iter_history<'t>(
        &'t self,
        txn: Option<&'t Transaction<'t>>,
        collection: Uuid,
        from: Version,
        to: Version,
        refs_only: bool,
    ) -> StoreResult<RefHistory<'t>> {
        RefHistory::new(self, txn, collection, from, to, refs_only)
    }

    /// Removes revisions superseded below `watermark`. The newest revision
    /// below it, tombstone or not, is kept.
    pub fn purge_refs(&self, txn: Option<&Transaction<'_>>, watermark: Version) -> StoreResult<PurgeCounts> {
        self.refs.write(txn, |t| {
            let (counts, reclaimed) = self
                .refs
                .purge_below(t, watermark, |k| Ok((32, version_key_at(REFS, k, 32)?)))?;
            for (k, _) in &reclaimed {
                let collection = uuid_at(REFS, k, 0)?;
                let member = uuid_at(REFS, k, 16)?;
                let version = version_key_at(REFS, k, 32)?;
                self.history
                    .remove(t, &history_key(&collection, version, &member))?;
            }
            Ok(counts)
        })
    }

    /// Removes every ref revision written at exactly `version`.
    pub fn undo_refs(&self, txn: Option<&Transaction<'_>>, version: Version) -> StoreResult<PurgeCounts> {
        let counts = self.refs.write(txn, |t| {
            let counts = self
                .refs
                .undo_version(t, version, |k| version_key_at(REFS, k, 32))?;
            self.history
                .undo_version(t, version, |k| version_at(REF_HISTORY, k, 16))?;
            Ok(counts)
        })?;
        debug!(version = %version, removed = counts.removed, "undid ref revisions");
        Ok(counts)
    }
}
