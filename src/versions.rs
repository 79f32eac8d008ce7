//! Version container
//!
//! Store-wide metadata, all in one table:
//!
//! ```text
//! STAMP (16) | 0x00                    -> format (4) | schema (4) | store uuid (16)
//! STAMP (16) | 0x01                    -> current version (4)
//! STAMP (16) | 0x02                    -> minimum retained version (4)
//! store uuid (16) | 0x03 | ~version (4) -> status (4) | timezone (opt str)
//!                                         | count (4) | index uuid (16) * count
//! ```
//!
//! Opening against a different (format, schema) stamp fails before any
//! other container is touched. There is no automatic migration.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mvcc::{PurgeCounts, ReadView, Version};
use crate::storage::{
    key, version_key_at, Container, Direction, FormatStamp, RecordReader, RecordWriter, Store,
    StoreError, StoreOptions, StoreResult, Transaction,
};

const VERSIONS: &str = "versions";

/// On-disk layout version of this crate.
pub const FORMAT_VERSION: u32 = 1;
/// Key and value schema version of this crate.
pub const SCHEMA_VERSION: u32 = 1;

/// The stamp this build reads and writes.
pub const CURRENT_STAMP: FormatStamp = FormatStamp {
    format: FORMAT_VERSION,
    schema: SCHEMA_VERSION,
};

/// Reserved prefix of the fixed metadata keys.
const STAMP_UUID: Uuid = Uuid::from_u128(0x2e7a_1c5e_9d6b_4d0e_8f61_5b3e_0c9a_7d41);

const STAMP_KEY: [u8; 17] = fixed_key(0x00);
const VERSION_KEY: [u8; 17] = fixed_key(0x01);
const MIN_VERSION_KEY: [u8; 17] = fixed_key(0x02);
const VIEW_DATA: u8 = 0x03;

const fn fixed_key(tag: u8) -> [u8; 17] {
    let uuid = STAMP_UUID.as_bytes();
    let mut key = [0u8; 17];
    let mut i = 0;
    while i < 16 {
        key[i] = uuid[i];
        i += 1;
    }
    key[16] = tag;
    key
}

fn view_key(store: &Uuid, version: Version) -> Vec<u8> {
    key(&[store.as_bytes(), &[VIEW_DATA], &version.to_key()])
}

fn view_prefix(store: &Uuid) -> Vec<u8> {
    key(&[store.as_bytes(), &[VIEW_DATA]])
}

/// Identity and progress of a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub store: Uuid,
    pub version: Version,
    pub min_version: Version,
    pub stamp: FormatStamp,
}

/// View status recorded at one version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewData {
    pub version: Version,
    pub status: u32,
    pub timezone: Option<String>,
    /// Indexes created at this version
    pub new_indexes: Vec<Uuid>,
}

impl ViewData {
    fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::new();
        w.put_u32(self.status)
            .put_opt_str(self.timezone.as_deref())
            .put_u32(self.new_indexes.len() as u32);
        for index in &self.new_indexes {
            w.put_uuid(index);
        }
        w.finish()
    }

    fn decode(key: &[u8], data: &[u8]) -> StoreResult<Self> {
        let version = version_key_at(VERSIONS, key, 17)?;
        let mut r = RecordReader::new(VERSIONS, key, data);
        let status = r.get_u32()?;
        let timezone = r.get_opt_str()?;
        let count = r.get_u32()? as usize;
        let mut new_indexes = Vec::with_capacity(count.min(r.remaining() / 16));
        for _ in 0..count {
            new_indexes.push(r.get_uuid()?);
        }
        r.finish()?;
        Ok(Self {
            version,
            status,
            timezone,
            new_indexes,
        })
    }
}

fn decode_u32(key: &[u8], data: &[u8]) -> StoreResult<u32> {
    let mut r = RecordReader::new(VERSIONS, key, data);
    let value = r.get_u32()?;
    r.finish()?;
    Ok(value)
}

#[derive(Debug)]
pub struct VersionContainer {
    versions: Container,
    store_uuid: Uuid,
    stamp: FormatStamp,
}

impl VersionContainer {
    /// Opens the container and checks the persisted stamp against
    /// `expected`. A new, empty store is stamped when `options.create`.
    pub fn open(
        store: Arc<Store>,
        txn: Option<&Transaction<'_>>,
        options: StoreOptions,
        expected: FormatStamp,
    ) -> StoreResult<Self> {
        let versions = Container::open(store, VERSIONS, txn, options)?;

        let store_uuid = versions.write(txn, |t| {
            match versions.get(Some(t), &STAMP_KEY)? {
                Some(value) => {
                    let mut r = RecordReader::new(VERSIONS, &STAMP_KEY, &value);
                    let found = FormatStamp {
                        format: r.get_u32()?,
                        schema: r.get_u32()?,
                    };
                    let uuid = r.get_uuid()?;
                    r.finish()?;
                    if found != expected {
                        warn!(found = %found, expected = %expected, "incompatible store stamp");
                        return Err(StoreError::IncompatibleFormat { found, expected });
                    }
                    Ok(uuid)
                }
                None => {
                    let empty = versions.seek(Some(t), &[], &[])?.is_none();
                    if !options.create || !empty {
                        return Err(StoreError::MissingStamp);
                    }
                    let uuid = Uuid::new_v4();
                    let mut w = RecordWriter::new();
                    w.put_u32(expected.format)
                        .put_u32(expected.schema)
                        .put_uuid(&uuid);
                    versions.insert(t, &STAMP_KEY, &w.finish())?;
                    versions.insert(t, &VERSION_KEY, &0u32.to_be_bytes())?;
                    versions.insert(t, &MIN_VERSION_KEY, &0u32.to_be_bytes())?;
                    info!(store = %uuid, stamp = %expected, "stamped new store");
                    Ok(uuid)
                }
            }
        })?;

        debug!(store = %store_uuid, "version container opened");
        Ok(Self {
            versions,
            store_uuid,
            stamp: expected,
        })
    }

    pub fn close(&self) {
        self.versions.close();
    }

    pub fn store_uuid(&self) -> Uuid {
        self.store_uuid
    }

    pub fn stamp(&self) -> FormatStamp {
        self.stamp
    }

    fn read_u32(&self, txn: Option<&Transaction<'_>>, key: &[u8]) -> StoreResult<u32> {
        match self.versions.get(txn, key)? {
            Some(value) => decode_u32(key, &value),
            None => Err(StoreError::MissingStamp),
        }
    }

    /// The latest committed version.
    pub fn get_version(&self, txn: Option<&Transaction<'_>>) -> StoreResult<Version> {
        Ok(Version::new(self.read_u32(txn, &VERSION_KEY)?))
    }

    /// Allocates the next version. Inside a caller transaction the bump
    /// commits or aborts with it.
    pub fn next_version(&self, txn: Option<&Transaction<'_>>) -> StoreResult<Version> {
        self.versions.write(txn, |t| {
            let current = Version::new(self.read_u32(Some(t), &VERSION_KEY)?);
            let next = current.next().ok_or_else(|| {
                StoreError::InvalidArgument("version counter exhausted".to_string())
            })?;
            self.versions
                .insert(t, &VERSION_KEY, &next.value().to_be_bytes())?;
            Ok(next)
        })
    }

    pub fn get_min_version(&self, txn: Option<&Transaction<'_>>) -> StoreResult<Version> {
        Ok(Version::new(self.read_u32(txn, &MIN_VERSION_KEY)?))
    }

    /// Moves the purge watermark. It never moves backwards nor past the
    /// latest version.
    pub fn set_min_version(&self, txn: Option<&Transaction<'_>>, version: Version) -> StoreResult<()> {
        self.versions.write(txn, |t| {
            let current = self.get_min_version(Some(t))?;
            let latest = self.get_version(Some(t))?;
            if version < current || version > latest {
                return Err(StoreError::NonMonotonicWatermark {
                    requested: version.value(),
                    current: current.value(),
                    latest: latest.value(),
                });
            }
            self.versions
                .insert(t, &MIN_VERSION_KEY, &version.value().to_be_bytes())
        })
    }

    pub fn get_version_info(&self, txn: Option<&Transaction<'_>>) -> StoreResult<VersionInfo> {
        self.versions.read(txn, |scope| {
            let table = self.versions.table();
            let read = |key: &[u8]| -> StoreResult<Version> {
                match scope.get(table, key)? {
                    Some(value) => Ok(Version::new(decode_u32(key, &value)?)),
                    None => Err(StoreError::MissingStamp),
                }
            };
            Ok(VersionInfo {
                store: self.store_uuid,
                version: read(&VERSION_KEY)?,
                min_version: read(&MIN_VERSION_KEY)?,
                stamp: self.stamp,
            })
        })
    }

    pub fn set_view_data(&self, txn: Option<&Transaction<'_>>, data: &ViewData) -> StoreResult<()> {
        self.versions
            .put(txn, &view_key(&self.store_uuid, data.version), &data.encode())
    }

    /// View data recorded at or before `version`.
    pub fn get_view_data(
        &self,
        txn: Option<&Transaction<'_>>,
        version: Version,
    ) -> StoreResult<Option<ViewData>> {
        match self.versions.seek(
            txn,
            &view_key(&self.store_uuid, version),
            &view_prefix(&self.store_uuid),
        )? {
            Some((k, v)) => Ok(Some(ViewData::decode(&k, &v)?)),
            None => Ok(None),
        }
    }

    /// Reconstructs what a reader at `version` sees: the newest status and
    /// timezone at or before it, and every index created by then.
    pub fn read_view(&self, txn: Option<&Transaction<'_>>, version: Version) -> StoreResult<ReadView> {
        let mut cursor = self
            .versions
            .cursor(txn, view_prefix(&self.store_uuid), Direction::Forward)?
            .starting_at(view_key(&self.store_uuid, version));

        let mut newest: Option<ViewData> = None;
        let mut indexes = BTreeSet::new();
        while let Some((k, v)) = cursor.next_entry()? {
            let data = ViewData::decode(&k, &v)?;
            indexes.extend(data.new_indexes.iter().copied());
            if newest.is_none() {
                newest = Some(data);
            }
        }

        Ok(match newest {
            Some(data) => ReadView::new(version, data.status, data.timezone, indexes),
            None => ReadView::at(version),
        })
    }

    /// Folds view data below `watermark` into its newest entry, carrying
    /// the created-index lists forward so `read_view` stays exact.
    pub fn purge_views(&self, txn: Option<&Transaction<'_>>, watermark: Version) -> StoreResult<PurgeCounts> {
        let mut below = Vec::new();
        let mut scanned = 0;
        {
            let mut cursor = self
                .versions
                .cursor(txn, view_prefix(&self.store_uuid), Direction::Forward)?;
            while let Some((k, v)) = cursor.next_entry()? {
                scanned += 1;
                let data = ViewData::decode(&k, &v)?;
                if data.version < watermark {
                    below.push(data);
                }
            }
        }
        if below.len() < 2 {
            return Ok(PurgeCounts {
                scanned,
                removed: 0,
            });
        }

        let mut kept = below[0].clone();
        let mut folded: BTreeSet<Uuid> = BTreeSet::new();
        for data in &below {
            folded.extend(data.new_indexes.iter().copied());
        }
        kept.new_indexes = folded.into_iter().collect();

        self.versions.write(txn, |t| {
            for data in &below[1..] {
                self.versions
                    .remove(t, &view_key(&self.store_uuid, data.version))?;
            }
            self.versions
                .insert(t, &view_key(&self.store_uuid, kept.version), &kept.encode())
        })?;
        Ok(PurgeCounts {
            scanned,
            removed: (below.len() - 1) as u64,
        })
    }

    /// Drops the view data written at `version` and rewinds the counter
    /// when `version` is the latest.
    pub fn undo_version(&self, txn: Option<&Transaction<'_>>, version: Version) -> StoreResult<()> {
        self.versions.write(txn, |t| {
            self.versions
                .remove(t, &view_key(&self.store_uuid, version))?;
            if self.get_version(Some(t))? == version && version > Version::ZERO {
                let previous = Version::new(version.value() - 1);
                self.versions
                    .insert(t, &VERSION_KEY, &previous.value().to_be_bytes())?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_on(store: &Arc<Store>, stamp: FormatStamp) -> StoreResult<VersionContainer> {
        VersionContainer::open(Arc::clone(store), None, StoreOptions::in_memory(), stamp)
    }

    fn v(n: u32) -> Version {
        Version::new(n)
    }

    #[test]
    fn test_new_store_is_stamped_once() {
        let store = Arc::new(Store::in_memory().unwrap());
        let first = open_on(&store, CURRENT_STAMP).unwrap();
        let again = open_on(&store, CURRENT_STAMP).unwrap();
        assert_eq!(first.store_uuid(), again.store_uuid());
        assert_eq!(again.get_version(None).unwrap(), Version::ZERO);
    }

    #[test]
    fn test_stamp_mismatch_fails_fast() {
        let store = Arc::new(Store::in_memory().unwrap());
        open_on(&store, CURRENT_STAMP).unwrap();
        let newer = FormatStamp {
            format: FORMAT_VERSION,
            schema: SCHEMA_VERSION + 1,
        };
        let err = open_on(&store, newer).unwrap_err();
        assert!(matches!(err, StoreError::IncompatibleFormat { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_stamp_without_create() {
        let store = Arc::new(Store::in_memory().unwrap());
        Container::open(Arc::clone(&store), VERSIONS, None, StoreOptions::in_memory()).unwrap();
        let options = StoreOptions {
            create: false,
            ..StoreOptions::in_memory()
        };
        let err = VersionContainer::open(store, None, options, CURRENT_STAMP).unwrap_err();
        assert!(matches!(err, StoreError::MissingStamp));
    }

    #[test]
    fn test_next_version_and_watermark() {
        let store = Arc::new(Store::in_memory().unwrap());
        let versions = open_on(&store, CURRENT_STAMP).unwrap();
        assert_eq!(versions.next_version(None).unwrap(), v(1));
        assert_eq!(versions.next_version(None).unwrap(), v(2));

        versions.set_min_version(None, v(2)).unwrap();
        assert!(matches!(
            versions.set_min_version(None, v(1)),
            Err(StoreError::NonMonotonicWatermark { .. })
        ));
        assert!(versions.set_min_version(None, v(3)).is_err());

        let info = versions.get_version_info(None).unwrap();
        assert_eq!(info.version, v(2));
        assert_eq!(info.min_version, v(2));
        assert_eq!(info.store, versions.store_uuid());
    }

    #[test]
    fn test_aborted_bump_is_not_visible() {
        let store = Arc::new(Store::in_memory().unwrap());
        let versions = open_on(&store, CURRENT_STAMP).unwrap();
        let txn = store.begin().unwrap();
        assert_eq!(versions.next_version(Some(&txn)).unwrap(), v(1));
        txn.abort().unwrap();
        assert_eq!(versions.get_version(None).unwrap(), Version::ZERO);
    }

    #[test]
    fn test_read_view_accumulates_indexes() {
        let store = Arc::new(Store::in_memory().unwrap());
        let versions = open_on(&store, CURRENT_STAMP).unwrap();
        let (i1, i2) = (Uuid::new_v4(), Uuid::new_v4());
        versions
            .set_view_data(None, &ViewData { version: v(1), status: 1, timezone: Some("UTC".into()), new_indexes: vec![i1] })
            .unwrap();
        versions
            .set_view_data(None, &ViewData { version: v(3), status: 2, timezone: None, new_indexes: vec![i2] })
            .unwrap();

        let at2 = versions.read_view(None, v(2)).unwrap();
        assert_eq!(at2.status(), 1);
        assert_eq!(at2.timezone(), Some("UTC"));
        assert!(at2.has_index(&i1) && !at2.has_index(&i2));

        let at5 = versions.read_view(None, v(5)).unwrap();
        assert_eq!(at5.status(), 2);
        assert_eq!(at5.indexes().len(), 2);

        assert_eq!(versions.read_view(None, v(0)).unwrap(), ReadView::at(v(0)));
        assert_eq!(versions.get_view_data(None, v(2)).unwrap().unwrap().version, v(1));

        assert_eq!(versions.purge_views(None, v(5)).unwrap().removed, 1);
        let folded = versions.read_view(None, v(5)).unwrap();
        assert_eq!(folded.indexes().len(), 2);
        assert_eq!(folded.status(), 2);
    }
}
