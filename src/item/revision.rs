//! Item revisions
//!
//! One revision is written per item per commit. The stored value is:
//!
//! ```text
//! +----------+------------+----------------+-------------------+
//! | kind (16)| status (4) | parent (opt)   | prev_kind (opt)   |
//! +----------+------------+----------------+-------------------+
//! | name (opt str) | module (opt str) | class (opt str)        |
//! +-----------------------------------------------------------+
//! | values: count (4) + (hash (4), value uuid (16)) * count     |
//! | dirty values: count (4) + hash (4) * count                  |
//! | dirty refs: count (4) + hash (4) * count                    |
//! +-----------------------------------------------------------+
//! ```
//!
//! Values are sorted by attribute hash before encoding so equal revisions
//! always have equal bytes.

use std::collections::BTreeSet;
use std::fmt;

use uuid::Uuid;

use crate::mvcc::Version;
use crate::storage::{RecordReader, RecordWriter, StoreResult};

/// Item status bitmask.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Status(u32);

impl Status {
    pub const NONE: Status = Status(0);
    /// The item was deleted at this revision.
    pub const DELETED: Status = Status(0x1);
    /// The revision is the result of merging concurrent changes.
    pub const MERGED: Status = Status(0x2);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_deleted(&self) -> bool {
        self.contains(Status::DELETED)
    }
}

impl std::ops::BitOr for Status {
    type Output = Status;

    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One revision of an item.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ItemRevision {
    pub uuid: Uuid,
    pub version: Version,
    pub kind: Uuid,
    pub status: Status,
    pub parent: Option<Uuid>,
    /// Set on the revision where the item migrated from another kind
    pub prev_kind: Option<Uuid>,
    pub name: Option<String>,
    pub module: Option<String>,
    pub class: Option<String>,
    /// (attribute hash, value uuid) pairs
    pub values: Vec<(u32, Uuid)>,
    /// Hashes of literal attributes changed by this revision
    pub dirty_values: Vec<u32>,
    /// Hashes of reference attributes changed by this revision
    pub dirty_refs: Vec<u32>,
}

impl ItemRevision {
    pub fn new(uuid: Uuid, version: Version, kind: Uuid) -> Self {
        Self {
            uuid,
            version,
            kind,
            ..Self::default()
        }
    }

    /// A deletion revision carrying `previous`'s kind and parent.
    pub fn deletion(previous: &ItemRevision, version: Version) -> Self {
        Self {
            uuid: previous.uuid,
            version,
            kind: previous.kind,
            status: previous.status | Status::DELETED,
            parent: previous.parent,
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Sets one value, keeping `values` in hash order.
    pub fn with_value(mut self, hash: u32, value: Uuid) -> Self {
        match self.values.binary_search_by_key(&hash, |(h, _)| *h) {
            Ok(i) => self.values[i].1 = value,
            Err(i) => self.values.insert(i, (hash, value)),
        }
        self.dirty_values.push(hash);
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.status.is_deleted()
    }

    /// `values` is public and may be out of order until canonicalized.
    pub fn value(&self, hash: u32) -> Option<Uuid> {
        self.values
            .iter()
            .find(|(h, _)| *h == hash)
            .map(|(_, value)| *value)
    }

    /// Every attribute hash this revision changed.
    pub fn dirty_attributes(&self) -> BTreeSet<u32> {
        self.dirty_values
            .iter()
            .chain(self.dirty_refs.iter())
            .copied()
            .collect()
    }

    /// Puts values and dirty sets into canonical order.
    pub fn canonicalize(&mut self) {
        self.values.sort_by_key(|(hash, _)| *hash);
        self.values.dedup_by_key(|(hash, _)| *hash);
        self.dirty_values.sort_unstable();
        self.dirty_values.dedup();
        self.dirty_refs.sort_unstable();
        self.dirty_refs.dedup();
    }

    /// Encodes the stored value. Call [`ItemRevision::canonicalize`] first.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::with_capacity(64 + self.values.len() * 20);
        w.put_uuid(&self.kind)
            .put_u32(self.status.bits())
            .put_opt_uuid(self.parent.as_ref())
            .put_opt_uuid(self.prev_kind.as_ref())
            .put_opt_str(self.name.as_deref())
            .put_opt_str(self.module.as_deref())
            .put_opt_str(self.class.as_deref());
        w.put_u32(self.values.len() as u32);
        for (hash, value) in &self.values {
            w.put_u32(*hash).put_uuid(value);
        }
        for set in [&self.dirty_values, &self.dirty_refs] {
            w.put_u32(set.len() as u32);
            for hash in set {
                w.put_u32(*hash);
            }
        }
        w.finish()
    }

    pub fn decode(
        container: &'static str,
        key: &[u8],
        uuid: Uuid,
        version: Version,
        data: &[u8],
    ) -> StoreResult<Self> {
        let mut r = RecordReader::new(container, key, data);
        let kind = r.get_uuid()?;
        let status = Status::from_bits(r.get_u32()?);
        let parent = r.get_opt_uuid()?;
        let prev_kind = r.get_opt_uuid()?;
        let name = r.get_opt_str()?;
        let module = r.get_opt_str()?;
        let class = r.get_opt_str()?;

        let count = r.get_u32()? as usize;
        let mut values = Vec::with_capacity(count.min(r.remaining() / 20));
        for _ in 0..count {
            values.push((r.get_u32()?, r.get_uuid()?));
        }
        let dirty_values = read_hashes(&mut r)?;
        let dirty_refs = read_hashes(&mut r)?;
        r.finish()?;

        Ok(Self {
            uuid,
            version,
            kind,
            status,
            parent,
            prev_kind,
            name,
            module,
            class,
            values,
            dirty_values,
            dirty_refs,
        })
    }

    /// Reads the requested attribute values without decoding the rest.
    /// `hashes` empty means every value.
    pub(crate) fn decode_values(
        container: &'static str,
        key: &[u8],
        data: &[u8],
        hashes: &[u32],
    ) -> StoreResult<Vec<(u32, Uuid)>> {
        let mut r = RecordReader::new(container, key, data);
        r.skip(16 + 4)?;
        r.get_opt_uuid()?;
        r.get_opt_uuid()?;
        r.skip_opt_str()?;
        r.skip_opt_str()?;
        r.skip_opt_str()?;

        let count = r.get_u32()? as usize;
        let mut values = Vec::new();
        for _ in 0..count {
            let hash = r.get_u32()?;
            if hashes.is_empty() || hashes.contains(&hash) {
                values.push((hash, r.get_uuid()?));
            } else {
                r.skip(16)?;
            }
        }
        Ok(values)
    }

    /// Reads the kind and status of an encoded revision.
    pub(crate) fn decode_header(
        container: &'static str,
        key: &[u8],
        data: &[u8],
    ) -> StoreResult<(Uuid, Status)> {
        let mut r = RecordReader::new(container, key, data);
        Ok((r.get_uuid()?, Status::from_bits(r.get_u32()?)))
    }
}

fn read_hashes(r: &mut RecordReader<'_>) -> StoreResult<Vec<u32>> {
    let count = r.get_u32()? as usize;
    let mut hashes = Vec::with_capacity(count.min(r.remaining() / 4));
    for _ in 0..count {
        hashes.push(r.get_u32()?);
    }
    Ok(hashes)
}
