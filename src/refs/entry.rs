//! Ref entries
//!
//! Every member of a collection is a link in a doubly linked list. The
//! collection's own key (member == collection) holds the list head.
//!
//! ```text
//! link:     previous (opt uuid) | next (opt uuid) | alias (opt str)
//! head:     first (opt uuid) | last (opt uuid) | count (4)
//! removed:  0x02
//! ```
//!
//! A one-byte value is the tombstone: the member was removed at that
//! version.

use uuid::Uuid;

use crate::storage::{RecordReader, RecordWriter, StoreResult};

const TOMBSTONE: u8 = 0x02;

/// A member's position in its collection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefLink {
    pub previous: Option<Uuid>,
    pub next: Option<Uuid>,
    pub alias: Option<String>,
}

impl RefLink {
    pub fn new(previous: Option<Uuid>, next: Option<Uuid>) -> Self {
        Self {
            previous,
            next,
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// A collection's list head.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefHead {
    pub first: Option<Uuid>,
    pub last: Option<Uuid>,
    pub count: u32,
}

/// Decoded value of one ref revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefEntry {
    Link(RefLink),
    Head(RefHead),
    Removed,
}

impl RefEntry {
    pub fn is_removed(&self) -> bool {
        matches!(self, RefEntry::Removed)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::new();
        match self {
            RefEntry::Link(link) => {
                w.put_opt_uuid(link.previous.as_ref())
                    .put_opt_uuid(link.next.as_ref())
                    .put_opt_str(link.alias.as_deref());
            }
            RefEntry::Head(head) => {
                w.put_opt_uuid(head.first.as_ref())
                    .put_opt_uuid(head.last.as_ref())
                    .put_u32(head.count);
            }
            RefEntry::Removed => {
                w.put_u8(TOMBSTONE);
            }
        }
        w.finish()
    }

    /// Decodes a stored value. `head` tells whether the key is the
    /// collection's own key.
    pub fn decode(container: &'static str, key: &[u8], data: &[u8], head: bool) -> StoreResult<Self> {
        if data.len() == 1 {
            return Ok(RefEntry::Removed);
        }
        let mut r = RecordReader::new(container, key, data);
        let entry = if head {
            RefEntry::Head(RefHead {
                first: r.get_opt_uuid()?,
                last: r.get_opt_uuid()?,
                count: r.get_u32()?,
            })
        } else {
            RefEntry::Link(RefLink {
                previous: r.get_opt_uuid()?,
                next: r.get_opt_uuid()?,
                alias: r.get_opt_str()?,
            })
        };
        r.finish()?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;

    #[test]
    fn test_tombstone_is_one_byte() {
        assert_eq!(RefEntry::Removed.encode().len(), 1);
        assert_eq!(RefEntry::decode("refs", b"k", &[TOMBSTONE], false).unwrap(), RefEntry::Removed);
    }

    #[test]
    fn test_link_with_alias() {
        let link = RefLink::new(Some(Uuid::new_v4()), None).with_alias("primary");
        let entry = RefEntry::Link(link);
        assert_eq!(RefEntry::decode("refs", b"k", &entry.encode(), false).unwrap(), entry);
    }

    #[test]
    fn test_head_decodes_as_head() {
        let entry = RefEntry::Head(RefHead {
            first: Some(Uuid::new_v4()),
            last: Some(Uuid::new_v4()),
            count: 2,
        });
        assert_eq!(RefEntry::decode("refs", b"k", &entry.encode(), true).unwrap(), entry);
    }

    #[test]
    fn test_trailing_bytes_are_corrupt() {
        let mut bytes = RefEntry::Link(RefLink::default()).encode();
        bytes.push(0);
        assert!(matches!(
            RefEntry::decode("refs", b"k", &bytes, false),
            Err(StoreError::CorruptRecord { .. })
        ));
    }
}
