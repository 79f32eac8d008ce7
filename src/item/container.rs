//! Item container
//!
//! The primary store: one revision chain per item plus two derived
//! orderings used by history scans.
//!
//! ```text
//! items          uuid (16) | ~version (4)              -> revision
//! item_kinds     kind (16) | uuid (16) | ~version (4)  -> status (4)
//! item_versions  version (4) | uuid (16)               -> kind (16)
//! ```
//!
//! Within one item's chain keys ascend as versions descend, so the first
//! key at or after `(uuid, ~v)` is the authoritative revision at `v`.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use super::iter::{History, ItemVersions, KindQuery};
use super::revision::ItemRevision;
use crate::mvcc::{PurgeCounts, Version};
use crate::storage::{
    key, uuid_at, version_key_at, Container, Direction, Scope, Store,
    StoreOptions, StoreResult, Transaction,
};

pub(crate) const ITEMS: &str = "items";
pub(crate) const ITEM_KINDS: &str = "item_kinds";
pub(crate) const ITEM_VERSIONS: &str = "item_versions";

pub(crate) fn item_key(uuid: &Uuid, version: Version) -> Vec<u8> {
    key(&[uuid.as_bytes(), &version.to_key()])
}

fn kind_key(kind: &Uuid, uuid: &Uuid, version: Version) -> Vec<u8> {
    key(&[kind.as_bytes(), uuid.as_bytes(), &version.to_key()])
}

fn history_key(version: Version, uuid: &Uuid) -> Vec<u8> {
    key(&[&version.to_be_bytes(), uuid.as_bytes()])
}

#[derive(Debug)]
pub struct ItemContainer {
    pub(crate) items: Container,
    pub(crate) kinds: Container,
    pub(crate) versions: Container,
}

impl ItemContainer {
    pub fn open(
        store: Arc<Store>,
        txn: Option<&Transaction<'_>>,
        options: StoreOptions,
    ) -> StoreResult<Self> {
        Ok(Self {
            items: Container::open(Arc::clone(&store), ITEMS, txn, options)?,
            kinds: Container::open(Arc::clone(&store), ITEM_KINDS, txn, options)?,
            versions: Container::open(store, ITEM_VERSIONS, txn, options)?,
        })
    }

    pub fn close(&self) {
        self.items.close();
        self.kinds.close();
        self.versions.close();
    }

    /// Writes one revision and its kind and version orderings. Returns the
    /// encoded size of the revision record.
    pub fn save_item(&self, txn: Option<&Transaction<'_>>, revision: &ItemRevision) -> StoreResult<usize> {
        let mut revision = revision.clone();
        revision.canonicalize();
        let value = revision.encode();
        let (uuid, version) = (revision.uuid, revision.version);

        self.items.write(txn, |t| {
            self.items.insert(t, &item_key(&uuid, version), &value)?;
            self.kinds.insert(
                t,
                &kind_key(&revision.kind, &uuid, version),
                &revision.status.bits().to_be_bytes(),
            )?;
            self.versions
                .insert(t, &history_key(version, &uuid), revision.kind.as_bytes())?;
            Ok(value.len())
        })
    }

    /// Authoritative raw entry for `uuid` at `version`, deleted or not.
    fn seek_revision(
        &self,
        scope: &Scope<'_>,
        version: Version,
        uuid: &Uuid,
    ) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        scope.seek(self.items.table(), &item_key(uuid, version), uuid.as_bytes())
    }

    /// Most recent revision with version <= `version`, including deletion
    /// revisions.
    pub fn find_revision(
        &self,
        txn: Option<&Transaction<'_>>,
        version: Version,
        uuid: &Uuid,
    ) -> StoreResult<Option<ItemRevision>> {
        self.items.read(txn, |scope| {
            match self.seek_revision(scope, version, uuid)? {
                Some((k, v)) => {
                    let found = version_key_at(ITEMS, &k, 16)?;
                    Ok(Some(ItemRevision::decode(ITEMS, &k, *uuid, found, &v)?))
                }
                None => Ok(None),
            }
        })
    }

    /// Most recent live revision with version <= `version`. A deleted item
    /// is absent.
    pub fn find_item(
        &self,
        txn: Option<&Transaction<'_>>,
        version: Version,
        uuid: &Uuid,
    ) -> StoreResult<Option<ItemRevision>> {
        Ok(self
            .find_revision(txn, version, uuid)?
            .filter(|revision| !revision.is_deleted()))
    }

    /// Version of the authoritative live revision at `version`.
    pub fn get_item_version(
        &self,
        txn: Option<&Transaction<'_>>,
        version: Version,
        uuid: &Uuid,
    ) -> StoreResult<Option<Version>> {
        self.items.read(txn, |scope| {
            match self.seek_revision(scope, version, uuid)? {
                Some((k, v)) => {
                    let (_, status) = ItemRevision::decode_header(ITEMS, &k, &v)?;
                    if status.is_deleted() {
                        Ok(None)
                    } else {
                        Ok(Some(version_key_at(ITEMS, &k, 16)?))
                    }
                }
                None => Ok(None),
            }
        })
    }

    /// One attribute value of a live item.
    pub fn find_value(
        &self,
        txn: Option<&Transaction<'_>>,
        version: Version,
        uuid: &Uuid,
        hash: u32,
    ) -> StoreResult<Option<Uuid>> {
        Ok(self
            .find_values(txn, version, uuid, &[hash])?
            .and_then(|values| values.first().map(|(_, value)| *value)))
    }

    /// The subset of a live item's values whose hash is in `hashes`, in
    /// hash order. `None` when the item is absent or deleted.
    pub fn find_values(
        &self,
        txn: Option<&Transaction<'_>>,
        version: Version,
        uuid: &Uuid,
        hashes: &[u32],
    ) -> StoreResult<Option<Vec<(u32, Uuid)>>> {
        self.items.read(txn, |scope| {
            match self.seek_revision(scope, version, uuid)? {
                Some((k, v)) => {
                    let (_, status) = ItemRevision::decode_header(ITEMS, &k, &v)?;
                    if status.is_deleted() {
                        return Ok(None);
                    }
                    Ok(Some(ItemRevision::decode_values(ITEMS, &k, &v, hashes)?))
                }
                None => Ok(None),
            }
        })
    }

    /// Every item whose revision as of `version` has kind `kind`.
    pub fn kind_query<'t>(
        &'t self,
        txn: Option<&'t Transaction<'t>>,
        version: Version,
        kind: Uuid,
        keys_only: bool,
    ) -> StoreResult<KindQuery<'t>> {
        KindQuery::new(self, txn, version, kind, keys_only)
    }

    /// Every revision written in `from..=to`, in version order.
    pub fn iter_history<'t>(
        &'t self,
        txn: Option<&'t Transaction<'t>>,
        from: Version,
        to: Version,
        keys_only: bool,
    ) -> StoreResult<History<'t>> {
        History::new(self, txn, from, to, keys_only)
    }

    /// One item's revisions in `from..=to`; oldest first unless `backwards`.
    pub fn iter_versions<'t>(
        &'t self,
        txn: Option<&'t Transaction<'t>>,
        uuid: Uuid,
        from: Version,
        to: Version,
        backwards: bool,
    ) -> StoreResult<ItemVersions<'t>> {
        ItemVersions::new(self, txn, uuid, from, to, backwards)
    }

    /// Physically removes the revision of `uuid` written at `version`.
    pub fn purge_item(
        &self,
        txn: Option<&Transaction<'_>>,
        uuid: &Uuid,
        version: Version,
    ) -> StoreResult<bool> {
        let item = item_key(uuid, version);
        self.items.write(txn, |t| {
            let value = t
                .table(self.items.table())?
                .remove(item.as_slice())?
                .map(|v| v.value().to_vec());
            let Some(value) = value else {
                return Ok(false);
            };
            let (kind, _) = ItemRevision::decode_header(ITEMS, &item, &value)?;
            self.kinds.remove(t, &kind_key(&kind, uuid, version))?;
            self.versions.remove(t, &history_key(version, uuid))?;
            Ok(true)
        })
    }

    /// Removes every revision superseded below `watermark`, keeping each
    /// item's newest revision below it. The kind and version orderings are
    /// cleaned in the same transaction.
    pub fn purge_items(
        &self,
        txn: Option<&Transaction<'_>>,
        watermark: Version,
    ) -> StoreResult<PurgeCounts> {
        self.items.write(txn, |t| {
            let (counts, reclaimed) = self
                .items
                .purge_below(t, watermark, |k| Ok((16, version_key_at(ITEMS, k, 16)?)))?;
            for (k, v) in &reclaimed {
                let uuid = uuid_at(ITEMS, k, 0)?;
                let version = version_key_at(ITEMS, k, 16)?;
                let (kind, _) = ItemRevision::decode_header(ITEMS, k, v)?;
                self.kinds.remove(t, &kind_key(&kind, &uuid, version))?;
                self.versions.remove(t, &history_key(version, &uuid))?;
            }
            Ok(counts)
        })
    }

    /// Removes every revision written at exactly `version`.
    pub fn undo_items(&self, txn: Option<&Transaction<'_>>, version: Version) -> StoreResult<PurgeCounts> {
        let counts = self.items.write(txn, |t| {
            let mut uuids = Vec::new();
            {
                let mut cursor = self.versions.cursor(
                    Some(t),
                    version.to_be_bytes().to_vec(),
                    Direction::Forward,
                )?;
                while let Some((k, _)) = cursor.next_entry()? {
                    uuids.push(uuid_at(ITEM_VERSIONS, &k, 4)?);
                }
            }

            let mut counts = PurgeCounts::default();
            for uuid in &uuids {
                counts.scanned += 1;
                if self.purge_item(Some(t), uuid, version)? {
                    counts.removed += 1;
                }
            }
            Ok(counts)
        })?;
        debug!(version = %version, removed = counts.removed, "undid item revisions");
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict_point::points;
    use crate::storage::name_hash;

    fn open() -> ItemContainer {
        let store = Arc::new(Store::in_memory().unwrap());
        ItemContainer::open(store, None, StoreOptions::in_memory()).unwrap()
    }

    fn v(n: u32) -> Version {
        Version::new(n)
    }

    #[test]
    fn test_find_item_picks_newest_at_or_before() {
        let items = open();
        let uuid = Uuid::new_v4();
        let kind = Uuid::new_v4();
        let x = name_hash("x");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        items
            .save_item(None, &ItemRevision::new(uuid, v(2), kind).with_value(x, a))
            .unwrap();
        items
            .save_item(None, &ItemRevision::new(uuid, v(5), kind).with_value(x, b))
            .unwrap();

        assert!(items.find_item(None, v(1), &uuid).unwrap().is_none());
        assert_eq!(items.find_value(None, v(2), &uuid, x).unwrap(), Some(a));
        assert_eq!(items.find_value(None, v(4), &uuid, x).unwrap(), Some(a));
        assert_eq!(items.find_value(None, v(5), &uuid, x).unwrap(), Some(b));
        assert_eq!(items.get_item_version(None, Version::MAX, &uuid).unwrap(), Some(v(5)));
    }

    #[test]
    fn test_missing_item_does_not_match_neighbor() {
        let items = open();
        let kind = Uuid::new_v4();
        let present = Uuid::from_u128(2);
        items.save_item(None, &ItemRevision::new(present, v(1), kind)).unwrap();
        assert!(items.find_item(None, v(1), &Uuid::from_u128(1)).unwrap().is_none());
    }

    #[test]
    fn test_deleted_item_is_absent_but_revision_remains() {
        let items = open();
        let uuid = Uuid::new_v4();
        let live = ItemRevision::new(uuid, v(1), Uuid::new_v4());
        items.save_item(None, &live).unwrap();
        items.save_item(None, &ItemRevision::deletion(&live, v(2))).unwrap();

        assert!(items.find_item(None, v(2), &uuid).unwrap().is_none());
        assert!(items.find_values(None, v(2), &uuid, &[]).unwrap().is_none());
        assert!(items.get_item_version(None, v(2), &uuid).unwrap().is_none());
        assert!(items.find_revision(None, v(2), &uuid).unwrap().unwrap().is_deleted());
        assert!(items.find_item(None, v(1), &uuid).unwrap().is_some());
    }

    #[test]
    fn test_purge_item_removes_orderings() {
        let items = open();
        let uuid = Uuid::new_v4();
        let kind = Uuid::new_v4();
        items.save_item(None, &ItemRevision::new(uuid, v(1), kind)).unwrap();
        assert!(items.purge_item(None, &uuid, v(1)).unwrap());
        assert!(!items.purge_item(None, &uuid, v(1)).unwrap());
        assert_eq!(items.kind_query(None, v(1), kind, true).unwrap().count(), 0);
        assert_eq!(items.iter_history(None, v(1), v(1), true).unwrap().count(), 0);
    }

    #[test]
    fn test_undo_items_removes_one_version() {
        let items = open();
        let kind = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        items.save_item(None, &ItemRevision::new(a, v(1), kind)).unwrap();
        items.save_item(None, &ItemRevision::new(a, v(2), kind)).unwrap();
        items.save_item(None, &ItemRevision::new(b, v(2), kind)).unwrap();

        let counts = items.undo_items(None, v(2)).unwrap();
        assert_eq!(counts.removed, 2);
        assert_eq!(items.get_item_version(None, v(9), &a).unwrap(), Some(v(1)));
        assert!(items.find_item(None, v(9), &b).unwrap().is_none());
    }

    #[test]
    fn test_purge_items_keeps_newest_below_watermark() {
        let items = open();
        let uuid = Uuid::new_v4();
        let kind = Uuid::new_v4();
        for n in 1..=4 {
            items.save_item(None, &ItemRevision::new(uuid, v(n), kind)).unwrap();
        }
        let counts = items.purge_items(None, v(3)).unwrap();
        assert_eq!(counts.removed, 1);
        assert!(items.find_item(None, v(1), &uuid).unwrap().is_none());
        assert_eq!(items.get_item_version(None, v(2), &uuid).unwrap(), Some(v(2)));
        assert_eq!(items.get_item_version(None, v(3), &uuid).unwrap(), Some(v(3)));
        let remaining: Vec<u32> = items
            .iter_history(None, v(1), v(4), true)
            .unwrap()
            .map(|e| e.unwrap().version.value())
            .collect();
        assert_eq!(remaining, vec![2, 3, 4]);
    }

    #[test]
    fn test_purge_items_changes_all_tables_together() {
        let items = open();
        let uuid = Uuid::new_v4();
        let kind = Uuid::new_v4();
        for n in 1..=4 {
            items.save_item(None, &ItemRevision::new(uuid, v(n), kind)).unwrap();
        }
        let history = |items: &ItemContainer| -> Vec<u32> {
            items
                .iter_history(None, v(1), v(4), false)
                .unwrap()
                .map(|e| e.unwrap().version.value())
                .collect()
        };

        let store = Arc::clone(items.items.store());
        store.conflict_points().arm(points::COMMIT, 1);
        assert_eq!(items.purge_items(None, v(3)).unwrap().removed, 1);
        assert_eq!(store.deadlocks(), 1);
        assert_eq!(history(&items), vec![2, 3, 4]);

        let txn = store.begin().unwrap();
        assert_eq!(items.purge_items(Some(&txn), v(4)).unwrap().removed, 1);
        txn.abort().unwrap();
        assert_eq!(history(&items), vec![2, 3, 4]);
        assert_eq!(items.kind_query(None, v(4), kind, true).unwrap().count(), 1);
    }
}
