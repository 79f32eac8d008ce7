//! ACL container
//!
//! Persists access-control lists per subject and optional name.
//!
//! ```text
//! acls   subject (16) | name hash or 0 (4) | ~version (4)
//!          -> count (4) | (principal (16), permissions (4)) * count
//! ```
//!
//! A count of zero is the tombstone: the ACL was removed at that version.

use std::sync::Arc;

use uuid::Uuid;

use crate::mvcc::{PurgeCounts, Version};
use crate::storage::{
    key, name_hash, version_key_at, Container, RecordReader, RecordWriter, Store, StoreOptions,
    StoreResult, Transaction,
};

const ACLS: &str = "acls";

/// Permission bits.
pub mod permissions {
    pub const READ: u32 = 0x0001;
    pub const WRITE: u32 = 0x0002;
    pub const REMOVE: u32 = 0x0004;
    pub const CHANGE_ACL: u32 = 0x0008;
    /// Set on an entry that denies rather than grants its bits
    pub const DENY: u32 = 0x8000;
}

/// One access-control entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ace {
    pub principal: Uuid,
    pub permissions: u32,
}

impl Ace {
    pub fn new(principal: Uuid, permissions: u32) -> Self {
        Self {
            principal,
            permissions,
        }
    }

    pub fn denies(&self) -> bool {
        self.permissions & permissions::DENY != 0
    }
}

/// Ordered access-control list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Acl {
    entries: Vec<Ace>,
}

impl Acl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ace: Ace) {
        self.entries.push(ace);
    }

    pub fn entries(&self) -> &[Ace] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `principal` holds every bit in `wanted`. The first entry
    /// naming the principal decides.
    pub fn allows(&self, principal: &Uuid, wanted: u32) -> bool {
        self.entries
            .iter()
            .find(|ace| ace.principal == *principal && ace.permissions & wanted != 0)
            .map_or(false, |ace| !ace.denies() && ace.permissions & wanted == wanted)
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::with_capacity(4 + self.entries.len() * 20);
        w.put_u32(self.entries.len() as u32);
        for ace in &self.entries {
            w.put_uuid(&ace.principal).put_u32(ace.permissions);
        }
        w.finish()
    }

    fn decode(key: &[u8], data: &[u8]) -> StoreResult<Self> {
        let mut r = RecordReader::new(ACLS, key, data);
        let count = r.get_u32()? as usize;
        let mut entries = Vec::with_capacity(count.min(r.remaining() / 20));
        for _ in 0..count {
            entries.push(Ace::new(r.get_uuid()?, r.get_u32()?));
        }
        r.finish()?;
        Ok(Self { entries })
    }
}

impl FromIterator<Ace> for Acl {
    fn from_iter<I: IntoIterator<Item = Ace>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn acl_hash(name: Option<&str>) -> u32 {
    name.map_or(0, name_hash)
}

fn acl_key(subject: &Uuid, name: Option<&str>, version: Version) -> Vec<u8> {
    key(&[subject.as_bytes(), &acl_hash(name).to_be_bytes(), &version.to_key()])
}

#[derive(Debug)]
pub struct AclContainer {
    acls: Container,
}

impl AclContainer {
    pub fn open(
        store: Arc<Store>,
        txn: Option<&Transaction<'_>>,
        options: StoreOptions,
    ) -> StoreResult<Self> {
        Ok(Self {
            acls: Container::open(store, ACLS, txn, options)?,
        })
    }

    pub fn close(&self) {
        self.acls.close();
    }

    /// Stores `acl` for `(subject, name)` as of `version`; `None` or an
    /// empty list removes it.
    pub fn write_acl(
        &self,
        txn: Option<&Transaction<'_>>,
        version: Version,
        subject: &Uuid,
        name: Option<&str>,
        acl: Option<&Acl>,
    ) -> StoreResult<()> {
        let value = acl.cloned().unwrap_or_default().encode();
        self.acls.put(txn, &acl_key(subject, name, version), &value)
    }

    pub fn read_acl(
        &self,
        txn: Option<&Transaction<'_>>,
        version: Version,
        subject: &Uuid,
        name: Option<&str>,
    ) -> StoreResult<Option<Acl>> {
        let prefix = key(&[subject.as_bytes(), &acl_hash(name).to_be_bytes()]);
        match self.acls.seek(txn, &acl_key(subject, name, version), &prefix)? {
            Some((k, v)) => {
                let acl = Acl::decode(&k, &v)?;
                Ok((!acl.is_empty()).then_some(acl))
            }
            None => Ok(None),
        }
    }

    pub fn purge_acls(&self, txn: Option<&Transaction<'_>>, watermark: Version) -> StoreResult<PurgeCounts> {
        let (counts, _) = self.acls.write(txn, |t| {
            self.acls
                .purge_below(t, watermark, |k| Ok((20, version_key_at(ACLS, k, 20)?)))
        })?;
        Ok(counts)
    }

    pub fn undo_acls(&self, txn: Option<&Transaction<'_>>, version: Version) -> StoreResult<PurgeCounts> {
        self.acls.write(txn, |t| {
            self.acls
                .undo_version(t, version, |k| version_key_at(ACLS, k, 20))
        })
    }
}
