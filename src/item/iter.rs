//! Item iterators
//!
//! Each iterator owns one cursor and the scope it reads under; the
//! secondary lookups it makes into the `items` table run under that same
//! scope. Iterators close on exhaustion, on `close()` and on drop.

use uuid::Uuid;

use super::container::{item_key, ItemContainer, ITEMS, ITEM_KINDS, ITEM_VERSIONS};
use super::revision::ItemRevision;
use crate::mvcc::Version;
use crate::storage::{
    uuid_at, version_at, version_key_at, Cursor, Direction, StoreError, StoreResult, Transaction,
};

/// One hit of a kind query or history scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemEntry {
    pub uuid: Uuid,
    pub version: Version,
    /// `None` for keys-only scans
    pub revision: Option<ItemRevision>,
}

/// Items whose authoritative revision at a version has a given kind.
pub struct KindQuery<'t> {
    items: &'t ItemContainer,
    cursor: Cursor<'t>,
    version: Version,
    kind: Uuid,
    keys_only: bool,
    last: Option<Uuid>,
}

impl<'t> KindQuery<'t> {
    pub(super) fn new(
        items: &'t ItemContainer,
        txn: Option<&'t Transaction<'t>>,
        version: Version,
        kind: Uuid,
        keys_only: bool,
    ) -> StoreResult<Self> {
        Ok(Self {
            items,
            cursor: items
                .kinds
                .cursor(txn, kind.as_bytes().to_vec(), Direction::Forward)?,
            version,
            kind,
            keys_only,
            last: None,
        })
    }

    pub fn next_entry(&mut self) -> StoreResult<Option<ItemEntry>> {
        while let Some((key, _)) = self.cursor.next_entry()? {
            let uuid = uuid_at(ITEM_KINDS, &key, 16)?;
            if self.last == Some(uuid) {
                continue;
            }
            if version_key_at(ITEM_KINDS, &key, 32)? > self.version {
                continue;
            }
            self.last = Some(uuid);

            let current = self.cursor.seek_in(
                self.items.items.table(),
                &item_key(&uuid, self.version),
                uuid.as_bytes(),
            )?;
            let Some((item, value)) = current else {
                continue;
            };
            let (kind, status) = ItemRevision::decode_header(ITEMS, &item, &value)?;
            if kind != self.kind || status.is_deleted() {
                continue;
            }

            let version = version_key_at(ITEMS, &item, 16)?;
            let revision = if self.keys_only {
                None
            } else {
                Some(ItemRevision::decode(ITEMS, &item, uuid, version, &value)?)
            };
            return Ok(Some(ItemEntry {
                uuid,
                version,
                revision,
            }));
        }
        self.cursor.close();
        Ok(None)
    }

    pub fn close(&mut self) {
        self.cursor.close();
    }
}

impl Iterator for KindQuery<'_> {
    type Item = StoreResult<ItemEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

/// Every item revision written in a version range, in version order.
pub struct History<'t> {
    items: &'t ItemContainer,
    cursor: Cursor<'t>,
    to: Version,
    keys_only: bool,
}

impl<'t> History<'t> {
    pub(super) fn new(
        items: &'t ItemContainer,
        txn: Option<&'t Transaction<'t>>,
        from: Version,
        to: Version,
        keys_only: bool,
    ) -> StoreResult<Self> {
        let cursor = items
            .versions
            .cursor(txn, Vec::new(), Direction::Forward)?
            .starting_at(from.to_be_bytes().to_vec());
        Ok(Self {
            items,
            cursor,
            to,
            keys_only,
        })
    }

    pub fn next_entry(&mut self) -> StoreResult<Option<ItemEntry>> {
        let Some((key, _)) = self.cursor.next_entry()? else {
            return Ok(None);
        };
        let version = version_at(ITEM_VERSIONS, &key, 0)?;
        if version > self.to {
            self.cursor.close();
            return Ok(None);
        }
        let uuid = uuid_at(ITEM_VERSIONS, &key, 4)?;
        if self.keys_only {
            return Ok(Some(ItemEntry {
                uuid,
                version,
                revision: None,
            }));
        }

        let item = item_key(&uuid, version);
        let value = self
            .cursor
            .get_in(self.items.items.table(), &item)?
            .ok_or_else(|| StoreError::corrupt(ITEM_VERSIONS, &key, "no matching item revision"))?;
        Ok(Some(ItemEntry {
            uuid,
            version,
            revision: Some(ItemRevision::decode(ITEMS, &item, uuid, version, &value)?),
        }))
    }

    pub fn close(&mut self) {
        self.cursor.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cursor.is_closed()
    }
}

impl Iterator for History<'_> {
    type Item = StoreResult<ItemEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

/// One item's own revision chain within a version range.
pub struct ItemVersions<'t> {
    uuid: Uuid,
    cursor: Cursor<'t>,
    from: Version,
    to: Version,
    backwards: bool,
}

impl<'t> ItemVersions<'t> {
    pub(super) fn new(
        items: &'t ItemContainer,
        txn: Option<&'t Transaction<'t>>,
        uuid: Uuid,
        from: Version,
        to: Version,
        backwards: bool,
    ) -> StoreResult<Self> {
        let prefix = uuid.as_bytes().to_vec();
        // Newest first is ascending key order.
        let cursor = if backwards {
            items
                .items
                .cursor(txn, prefix, Direction::Forward)?
                .starting_at(item_key(&uuid, to))
        } else {
            items
                .items
                .cursor(txn, prefix, Direction::Backward)?
                .starting_at(item_key(&uuid, from))
        };
        Ok(Self {
            uuid,
            cursor,
            from,
            to,
            backwards,
        })
    }

    pub fn next_entry(&mut self) -> StoreResult<Option<ItemRevision>> {
        let Some((key, value)) = self.cursor.next_entry()? else {
            return Ok(None);
        };
        let version = version_key_at(ITEMS, &key, 16)?;
        let past_end = if self.backwards {
            version < self.from
        } else {
            version > self.to
        };
        if past_end {
            self.cursor.close();
            return Ok(None);
        }
        Ok(Some(ItemRevision::decode(ITEMS, &key, self.uuid, version, &value)?))
    }

    pub fn close(&mut self) {
        self.cursor.close();
    }
}

impl Iterator for ItemVersions<'_> {
    type Item = StoreResult<ItemRevision>;

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

    fn open() -> ItemContainer {
        let store = Arc::new(Store::in_memory().unwrap());
        ItemContainer::open(store, None, StoreOptions::in_memory()).unwrap()
    }

    fn v(n: u32) -> Version {
        Version::new(n)
    }

    #[test]
    fn test_kind_query_dedupes_and_follows_migration() {
        let items = open();
        let (k1, k2) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let (a, b, c) = (Uuid::from_u128(10), Uuid::from_u128(11), Uuid::from_u128(12));

        for n in 1..=3 {
            items.save_item(None, &ItemRevision::new(a, v(n), k1)).unwrap();
        }
        items.save_item(None, &ItemRevision::new(b, v(1), k1)).unwrap();
        let mut migrated = ItemRevision::new(b, v(2), k2);
        migrated.prev_kind = Some(k1);
        items.save_item(None, &migrated).unwrap();
        let live_c = ItemRevision::new(c, v(1), k1);
        items.save_item(None, &live_c).unwrap();
        items.save_item(None, &ItemRevision::deletion(&live_c, v(2))).unwrap();

        let at1: Vec<Uuid> = items
            .kind_query(None, v(1), k1, true)
            .unwrap()
            .map(|e| e.unwrap().uuid)
            .collect();
        assert_eq!(at1, vec![a, b, c]);

        let at3: Vec<ItemEntry> = items
            .kind_query(None, v(3), k1, false)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(at3.len(), 1);
        assert_eq!(at3[0].uuid, a);
        assert_eq!(at3[0].version, v(3));
        assert!(at3[0].revision.is_some());

        let k2_hits: Vec<Uuid> = items
            .kind_query(None, v(3), k2, true)
            .unwrap()
            .map(|e| e.unwrap().uuid)
            .collect();
        assert_eq!(k2_hits, vec![b]);
    }

    #[test]
    fn test_history_is_inclusive_and_ordered() {
        let items = open();
        let kind = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        for n in 1..=4 {
            items.save_item(None, &ItemRevision::new(a, v(n), kind)).unwrap();
        }
        items.save_item(None, &ItemRevision::new(b, v(3), kind)).unwrap();

        let hits: Vec<(u32, bool)> = items
            .iter_history(None, v(2), v(3), false)
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.version.value(), e.revision.is_some())
            })
            .collect();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0], (2, true));
        assert!(hits[1..].iter().all(|(ver, _)| *ver == 3));
    }

    #[test]
    fn test_iter_versions_both_directions() {
        let items = open();
        let kind = Uuid::new_v4();
        let a = Uuid::from_u128(5);
        items.save_item(None, &ItemRevision::new(Uuid::from_u128(4), v(9), kind)).unwrap();
        items.save_item(None, &ItemRevision::new(Uuid::from_u128(6), v(1), kind)).unwrap();
        for n in [1, 3, 5, 7] {
            items.save_item(None, &ItemRevision::new(a, v(n), kind)).unwrap();
        }

        let forward: Vec<u32> = items
            .iter_versions(None, a, v(2), v(7), false)
            .unwrap()
            .map(|r| r.unwrap().version.value())
            .collect();
        assert_eq!(forward, vec![3, 5, 7]);

        let backward: Vec<u32> = items
            .iter_versions(None, a, v(1), v(6), true)
            .unwrap()
            .map(|r| r.unwrap().version.value())
            .collect();
        assert_eq!(backward, vec![5, 3, 1]);
    }

    #[test]
    fn test_history_survives_owned_deadlock() {
        let items = open();
        let kind = Uuid::new_v4();
        let a = Uuid::new_v4();
        for n in 1..=3 {
            items.save_item(None, &ItemRevision::new(a, v(n), kind)).unwrap();
        }
        let mut history = items.iter_history(None, v(1), v(3), false).unwrap();
        assert_eq!(history.next_entry().unwrap().unwrap().version, v(1));
        items.items.store().conflict_points().arm(points::TABLE_READ, 2);
        let rest: Vec<u32> = history.map(|e| e.unwrap().version.value()).collect();
        assert_eq!(rest, vec![2, 3]);
    }
}
