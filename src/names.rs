//! Names container
//!
//! Resolves `(owner, name)` to a target, versioned.
//!
//! ```text
//! names   owner (16) | name hash (4) | ~version (4)  -> target (16)
//! ```
//!
//! A target equal to the owner is the tombstone: the name was removed at
//! that version.

use std::sync::Arc;

use uuid::Uuid;

use crate::mvcc::{PurgeCounts, Version};
use crate::storage::{
    key, name_hash, u32_at, uuid_at, version_key_at, Container, Direction, RecordReader, Store,
    StoreOptions, StoreResult, Transaction,
};

const NAMES: &str = "names";

fn name_key(owner: &Uuid, hash: u32, version: Version) -> Vec<u8> {
    key(&[owner.as_bytes(), &hash.to_be_bytes(), &version.to_key()])
}

fn decode_target(key: &[u8], value: &[u8]) -> StoreResult<Uuid> {
    let mut r = RecordReader::new(NAMES, key, value);
    let target = r.get_uuid()?;
    r.finish()?;
    Ok(target)
}

#[derive(Debug)]
pub struct NamesContainer {
    names: Container,
}

impl NamesContainer {
    pub fn open(
        store: Arc<Store>,
        txn: Option<&Transaction<'_>>,
        options: StoreOptions,
    ) -> StoreResult<Self> {
        Ok(Self {
            names: Container::open(store, NAMES, txn, options)?,
        })
    }

    pub fn close(&self) {
        self.names.close();
    }

    /// Binds `name` under `owner` to `target` as of `version`; `None`
    /// removes the name.
    pub fn write_name(
        &self,
        txn: Option<&Transaction<'_>>,
        version: Version,
        owner: &Uuid,
        name: &str,
        target: Option<&Uuid>,
    ) -> StoreResult<()> {
        let value = target.unwrap_or(owner);
        self.names.put(
            txn,
            &name_key(owner, name_hash(name), version),
            value.as_bytes(),
        )
    }

    pub fn read_name(
        &self,
        txn: Option<&Transaction<'_>>,
        version: Version,
        owner: &Uuid,
        name: &str,
    ) -> StoreResult<Option<Uuid>> {
        let hash = name_hash(name);
        let prefix = key(&[owner.as_bytes(), &hash.to_be_bytes()]);
        match self.names.seek(txn, &name_key(owner, hash, version), &prefix)? {
            Some((k, v)) => {
                let target = decode_target(&k, &v)?;
                Ok((target != *owner).then_some(target))
            }
            None => Ok(None),
        }
    }

    /// One resolved target per live name under `owner` at `version`, in
    /// hash order.
    pub fn read_names(
        &self,
        txn: Option<&Transaction<'_>>,
        version: Version,
        owner: &Uuid,
    ) -> StoreResult<Vec<(u32, Uuid)>> {
        let mut cursor = self
            .names
            .cursor(txn, owner.as_bytes().to_vec(), Direction::Forward)?;
        let mut names = Vec::new();
        let mut last = None;
        while let Some((k, v)) = cursor.next_entry()? {
            let hash = u32_at(NAMES, &k, 16)?;
            if last == Some(hash) || version_key_at(NAMES, &k, 20)? > version {
                continue;
            }
            last = Some(hash);
            let target = decode_target(&k, &v)?;
            if target != *owner {
                names.push((hash, target));
            }
        }
        Ok(names)
    }

    pub fn purge_names(&self, txn: Option<&Transaction<'_>>, watermark: Version) -> StoreResult<PurgeCounts> {
        let (counts, _) = self.names.write(txn, |t| {
            self.names
                .purge_below(t, watermark, |k| Ok((20, version_key_at(NAMES, k, 20)?)))
        })?;
        Ok(counts)
    }

    pub fn undo_names(&self, txn: Option<&Transaction<'_>>, version: Version) -> StoreResult<PurgeCounts> {
        self.names.write(txn, |t| {
            self.names
                .undo_version(t, version, |k| version_key_at(NAMES, k, 20))
        })
    }

    /// Owners with at least one name revision, for diagnostics.
    pub fn owners(&self, txn: Option<&Transaction<'_>>) -> StoreResult<Vec<Uuid>> {
        let mut owners: Vec<Uuid> = Vec::new();
        let (_, keys) = self.names.collect_keys(txn, |_, _| Ok(true))?;
        for k in keys {
            let owner = uuid_at(NAMES, &k, 0)?;
            if owners.last() != Some(&owner) {
                owners.push(owner);
            }
        }
        Ok(owners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> NamesContainer {
        let store = Arc::new(Store::in_memory().unwrap());
        NamesContainer::open(store, None, StoreOptions::in_memory()).unwrap()
    }

    fn v(n: u32) -> Version {
        Version::new(n)
    }

    #[test]
    fn test_tombstone_law() {
        let names = open();
        let owner = Uuid::new_v4();
        let target = Uuid::new_v4();
        names.write_name(None, v(1), &owner, "home", Some(&target)).unwrap();
        names.write_name(None, v(3), &owner, "home", None).unwrap();

        assert_eq!(names.read_name(None, v(1), &owner, "home").unwrap(), Some(target));
        assert_eq!(names.read_name(None, v(2), &owner, "home").unwrap(), Some(target));
        assert!(names.read_name(None, v(3), &owner, "home").unwrap().is_none());
        assert!(names.read_name(None, v(9), &owner, "home").unwrap().is_none());
        assert!(names.read_name(None, v(0), &owner, "home").unwrap().is_none());
    }

    #[test]
    fn test_read_names_collapses_to_newest() {
        let names = open();
        let owner = Uuid::new_v4();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        names.write_name(None, v(1), &owner, "x", Some(&a)).unwrap();
        names.write_name(None, v(2), &owner, "x", Some(&b)).unwrap();
        names.write_name(None, v(1), &owner, "y", Some(&c)).unwrap();
        names.write_name(None, v(2), &owner, "y", None).unwrap();
        names.write_name(None, v(4), &owner, "x", Some(&c)).unwrap();

        let at3 = names.read_names(None, v(3), &owner).unwrap();
        assert_eq!(at3, vec![(name_hash("x"), b)]);

        let mut at1 = names.read_names(None, v(1), &owner).unwrap();
        at1.sort_by_key(|(_, t)| *t);
        let mut expected = vec![(name_hash("x"), a), (name_hash("y"), c)];
        expected.sort_by_key(|(_, t)| *t);
        assert_eq!(at1, expected);
    }

    #[test]
    fn test_purge_and_undo() {
        let names = open();
        let owner = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        names.write_name(None, v(1), &owner, "x", Some(&a)).unwrap();
        names.write_name(None, v(2), &owner, "x", Some(&b)).unwrap();
        names.write_name(None, v(3), &owner, "x", Some(&a)).unwrap();

        assert_eq!(names.purge_names(None, v(3)).unwrap().removed, 1);
        assert_eq!(names.read_name(None, v(2), &owner, "x").unwrap(), Some(b));

        assert_eq!(names.undo_names(None, v(3)).unwrap().removed, 1);
        assert_eq!(names.read_name(None, v(9), &owner, "x").unwrap(), Some(b));
        assert_eq!(names.owners(None).unwrap(), vec![owner]);
    }
}
