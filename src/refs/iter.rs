//! Ref iterators

use uuid::Uuid;

use super::container::{ref_key, seek_entry, RefContainer, REFS, REF_HISTORY};
use super::entry::{RefEntry, RefHead, RefLink};
use crate::mvcc::Version;
use crate::storage::{
    key, uuid_at, version_at, Cursor, Direction, Lookup, StoreError, StoreResult, Transaction,
};

/// Repeated point lookups against one `(collection, version)` pair.
///
/// The iterator holds one read scope for all lookups. After a deadlock
/// in its own snapshot it reopens the snapshot and repeats the lookup.
pub struct RefIterator<'t> {
    refs: &'t RefContainer,
    lookup: Lookup<'t>,
    collection: Uuid,
    version: Version,
}

impl<'t> RefIterator<'t> {
    pub(super) fn new(
        refs: &'t RefContainer,
        txn: Option<&'t Transaction<'t>>,
        collection: Uuid,
        version: Version,
    ) -> StoreResult<Self> {
        Ok(Self {
            refs,
            lookup: refs.refs.lookup(txn)?,
            collection,
            version,
        })
    }

    pub fn collection(&self) -> Uuid {
        self.collection
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn entry(&mut self, member: &Uuid) -> StoreResult<Option<RefEntry>> {
        let refs = &self.refs.refs;
        let (collection, version) = (self.collection, self.version);
        self.lookup
            .with_scope(|scope| seek_entry(scope, refs, &collection, member, version))
    }

    /// `member`'s links; `None` if absent or removed.
    pub fn load(&mut self, member: &Uuid) -> StoreResult<Option<RefLink>> {
        match self.entry(member)? {
            Some(RefEntry::Link(link)) => Ok(Some(link)),
            _ => Ok(None),
        }
    }

    pub fn head(&mut self) -> StoreResult<Option<RefHead>> {
        let collection = self.collection;
        match self.entry(&collection)? {
            Some(RefEntry::Head(head)) => Ok(Some(head)),
            _ => Ok(None),
        }
    }

    /// Reopens the read scope.
    pub fn reset(&mut self) -> StoreResult<()> {
        self.lookup.reset()
    }

    pub fn close(&mut self) {
        self.lookup.close();
    }
}

/// One membership change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefChange {
    pub member: Uuid,
    pub version: Version,
    pub entry: RefEntry,
}

/// Membership changes of one collection in a version range.
pub struct RefHistory<'t> {
    refs: &'t RefContainer,
    cursor: Cursor<'t>,
    collection: Uuid,
    to: Version,
    refs_only: bool,
}

impl<'t> RefHistory<'t> {
    pub(super) fn new(
        refs: &'t RefContainer,
        txn: Option<&'t Transaction<'t>>,
        collection: Uuid,
        from: Version,
        to: Version,
        refs_only: bool,
    ) -> StoreResult<Self> {
        let cursor = refs
            .history
            .cursor(txn, collection.as_bytes().to_vec(), Direction::Forward)?
            .starting_at(key(&[collection.as_bytes(), &from.to_be_bytes()]));
        Ok(Self {
            refs,
            cursor,
            collection,
            to,
            refs_only,
        })
    }

    pub fn next_entry(&mut self) -> StoreResult<Option<RefChange>> {
        while let Some((k, _)) = self.cursor.next_entry()? {
            let version = version_at(REF_HISTORY, &k, 16)?;
            if version > self.to {
                self.cursor.close();
                return Ok(None);
            }
            let member = uuid_at(REF_HISTORY, &k, 20)?;
            if self.refs_only && member == self.collection {
                continue;
            }

            let rk = ref_key(&self.collection, &member, version);
            let value = self
                .cursor
                .get_in(self.refs.refs.table(), &rk)?
                .ok_or_else(|| StoreError::corrupt(REF_HISTORY, &k, "no matching ref revision"))?;
            let entry = RefEntry::decode(REFS, &rk, &value, member == self.collection)?;
            return Ok(Some(RefChange {
                member,
                version,
                entry,
            }));
        }
        Ok(None)
    }

    pub fn close(&mut self) {
        self.cursor.close();
    }
}

impl Iterator for RefHistory<'_> {
    type Item = StoreResult<RefChange>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::conflict_point::points;
    use crate::storage::{Store, StoreOptions};

    fn open() -> RefContainer {
        let store = Arc::new(Store::in_memory().unwrap());
        RefContainer::open(store, None, StoreOptions::in_memory()).unwrap()
    }

    fn v(n: u32) -> Version {
        Version::new(n)
    }

    #[test]
    fn test_ref_iterator_pins_version() {
        let refs = open();
        let coll = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        refs.append_ref(None, &coll, v(1), &a, None).unwrap();
        refs.append_ref(None, &coll, v(2), &b, None).unwrap();

        let mut it = refs.ref_iterator(None, coll, v(1)).unwrap();
        assert_eq!(it.head().unwrap().unwrap().count, 1);
        assert!(it.load(&a).unwrap().unwrap().next.is_none());
        assert!(it.load(&b).unwrap().is_none());
        it.close();
        it.close();
    }

    #[test]
    fn test_ref_iterator_resets_after_deadlock() {
        let refs = open();
        let coll = Uuid::new_v4();
        let a = Uuid::new_v4();
        refs.append_ref(None, &coll, v(1), &a, None).unwrap();

        let mut it = refs.ref_iterator(None, coll, v(1)).unwrap();
        refs.refs.store().conflict_points().arm(points::TABLE_READ, 3);
        assert!(it.load(&a).unwrap().is_some());
        assert_eq!(refs.refs.store().deadlocks(), 3);
    }

    #[test]
    fn test_history_refs_only_skips_head() {
        let refs = open();
        let coll = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        refs.append_ref(None, &coll, v(1), &a, None).unwrap();
        refs.append_ref(None, &coll, v(2), &b, None).unwrap();
        refs.remove_ref(None, &coll, v(3), &a).unwrap();

        let all: Vec<RefChange> = refs
            .iter_history(None, coll, v(2), v(3), false)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert!(all.iter().any(|c| c.member == coll));

        let changes: Vec<(u32, Uuid, bool)> = refs
            .iter_history(None, coll, v(2), v(3), true)
            .unwrap()
            .map(|c| {
                let c = c.unwrap();
                (c.version.value(), c.member, c.entry.is_removed())
            })
            .collect();
        assert!(changes.iter().all(|(_, m, _)| *m != coll));
        assert!(changes.contains(&(3, a, true)));
        assert!(changes.contains(&(2, b, false)));
        assert!(changes.iter().all(|(ver, _, _)| (2..=3).contains(ver)));
    }
}
