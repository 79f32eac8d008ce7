//! Attribute and name hashing
//!
//! Names, ACL names and attribute names are persisted as 32-bit hashes.
//! Uses CRC32 (IEEE polynomial): the same name always produces the same
//! hash across processes and platforms, which keeps keys stable on disk.

use crc32fast::Hasher;

/// Computes the 32-bit hash under which `name` is persisted.
pub fn name_hash(name: &str) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(name.as_bytes());
    hasher.finalize()
}
