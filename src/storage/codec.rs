//! Record codec
//!
//! Keys are a left-to-right concatenation of fixed-width fields, most
//! significant grouping first, so that every prefix scan ("all revisions
//! of this entity") is contiguous:
//!
//! ```text
//! +-----------+-------------+--------------+
//! | UUID (16) | [hash (4)]  | ~version (4) |
//! +-----------+-------------+--------------+
//! ```
//!
//! Integers are big endian. Version fields in keys are stored
//! bit-complemented. Values use the tagged optional encodings below:
//!
//! ```text
//! optional UUID:    0x00 + 16 bytes  | 0x02
//! optional string:  0x01 + u32 length + UTF-8 bytes | 0x02
//! ```
//!
//! Decoding never guesses: a short or malformed buffer is a
//! `CorruptRecord` error, never a default value.

use uuid::Uuid;

use super::errors::{StoreError, StoreResult};
use crate::mvcc::Version;

const TAG_UUID: u8 = 0;
const TAG_STRING: u8 = 1;
const TAG_NONE: u8 = 2;

/// Concatenates fixed-width key fields.
pub fn key(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len()).sum();
    let mut buf = Vec::with_capacity(len);
    for part in parts {
        buf.extend_from_slice(part);
    }
    buf
}

/// Reads the UUID stored at `offset` in a key.
pub fn uuid_at(container: &'static str, key: &[u8], offset: usize) -> StoreResult<Uuid> {
    key.get(offset..offset + 16)
        .and_then(|b| <[u8; 16]>::try_from(b).ok())
        .map(Uuid::from_bytes)
        .ok_or_else(|| StoreError::corrupt(container, key, format!("no uuid at offset {}", offset)))
}

/// Reads the big-endian u32 stored at `offset` in a key.
pub fn u32_at(container: &'static str, key: &[u8], offset: usize) -> StoreResult<u32> {
    key.get(offset..offset + 4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| StoreError::corrupt(container, key, format!("no u32 at offset {}", offset)))
}

/// Reads the complemented version stored at `offset` in a key.
pub fn version_key_at(container: &'static str, key: &[u8], offset: usize) -> StoreResult<Version> {
    Ok(Version::from_key(u32_at(container, key, offset)?.to_be_bytes()))
}

/// Reads the plain (ascending) version stored at `offset` in a key.
pub fn version_at(container: &'static str, key: &[u8], offset: usize) -> StoreResult<Version> {
    Ok(Version::new(u32_at(container, key, offset)?))
}

/// Builds a record value field by field.
#[derive(Debug, Default)]
pub struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_uuid(&mut self, value: &Uuid) -> &mut Self {
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn put_opt_uuid(&mut self, value: Option<&Uuid>) -> &mut Self {
        match value {
            Some(uuid) => {
                self.buf.push(TAG_UUID);
                self.buf.extend_from_slice(uuid.as_bytes());
            }
            None => self.buf.push(TAG_NONE),
        }
        self
    }

    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn put_opt_str(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(s) => {
                self.buf.push(TAG_STRING);
                self.put_str(s);
            }
            None => self.buf.push(TAG_NONE),
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Decodes a record value, reporting any malformation as corruption of
/// the record stored under `key`.
#[derive(Debug)]
pub struct RecordReader<'a> {
    container: &'static str,
    key: &'a [u8],
    data: &'a [u8],
    offset: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(container: &'static str, key: &'a [u8], data: &'a [u8]) -> Self {
        Self {
            container,
            key,
            data,
            offset: 0,
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> StoreError {
        StoreError::corrupt(self.container, self.key, reason)
    }

    fn take(&mut self, len: usize) -> StoreResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                self.corrupt(format!(
                    "truncated value: need {} bytes at offset {}, have {}",
                    len,
                    self.offset,
                    self.data.len()
                ))
            })?;
        let data = self.data;
        let bytes = &data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    pub fn get_u8(&mut self) -> StoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> StoreResult<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    pub fn get_u64(&mut self) -> StoreResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    pub fn get_i64(&mut self) -> StoreResult<i64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(buf))
    }

    pub fn get_uuid(&mut self) -> StoreResult<Uuid> {
        let mut buf = [0u8; 16];
        buf.copy_from_slice(self.take(16)?);
        Ok(Uuid::from_bytes(buf))
    }

    pub fn get_opt_uuid(&mut self) -> StoreResult<Option<Uuid>> {
        match self.get_u8()? {
            TAG_UUID => Ok(Some(self.get_uuid()?)),
            TAG_NONE => Ok(None),
            tag => Err(self.corrupt(format!("unexpected tag {} for optional uuid", tag))),
        }
    }

    pub fn get_str(&mut self) -> StoreResult<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| self.corrupt(format!("invalid UTF-8: {}", e)))
    }

    pub fn get_opt_str(&mut self) -> StoreResult<Option<String>> {
        match self.get_u8()? {
            TAG_STRING => Ok(Some(self.get_str()?)),
            TAG_NONE => Ok(None),
            tag => Err(self.corrupt(format!("unexpected tag {} for optional string", tag))),
        }
    }

    /// Skips an optional string without allocating it.
    pub fn skip_opt_str(&mut self) -> StoreResult<()> {
        match self.get_u8()? {
            TAG_STRING => {
                let len = self.get_u32()? as usize;
                self.take(len)?;
                Ok(())
            }
            TAG_NONE => Ok(()),
            tag => Err(self.corrupt(format!("unexpected tag {} for optional string", tag))),
        }
    }

    pub fn skip(&mut self, len: usize) -> StoreResult<()> {
        self.take(len).map(|_| ())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Fails unless every byte of the value was consumed.
    pub fn finish(self) -> StoreResult<()> {
        if self.offset != self.data.len() {
            return Err(self.corrupt(format!(
                "{} trailing bytes after record",
                self.data.len() - self.offset
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_fields_roundtrip() {
        let a = Uuid::new_v4();
        let mut w = RecordWriter::new();
        w.put_opt_uuid(Some(&a))
            .put_opt_uuid(None)
            .put_opt_str(Some("alias"))
            .put_opt_str(None)
            .put_u32(7)
            .put_i64(-3);
        let bytes = w.finish();

        let mut r = RecordReader::new("test", b"k", &bytes);
        assert_eq!(r.get_opt_uuid().unwrap(), Some(a));
        assert_eq!(r.get_opt_uuid().unwrap(), None);
        assert_eq!(r.get_opt_str().unwrap().as_deref(), Some("alias"));
        assert_eq!(r.get_opt_str().unwrap(), None);
        assert_eq!(r.get_u32().unwrap(), 7);
        assert_eq!(r.get_i64().unwrap(), -3);
        r.finish().unwrap();
    }

    #[test]
    fn test_truncated_value_is_corruption() {
        let mut r = RecordReader::new("items", &[1, 2], &[0, 1, 2]);
        let err = r.get_opt_uuid().unwrap_err();
        assert!(matches!(err, StoreError::CorruptRecord { container: "items", .. }));
    }

    #[test]
    fn test_bad_tag_is_corruption() {
        let mut r = RecordReader::new("refs", b"k", &[9]);
        assert!(r.get_opt_uuid().unwrap_err().is_fatal());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut r = RecordReader::new("names", b"k", &[0, 0, 0, 1, 0xff]);
        assert_eq!(r.get_u32().unwrap(), 1);
        assert!(r.finish().is_err());
    }

    #[test]
    fn test_key_field_accessors() {
        let uuid = Uuid::new_v4();
        let k = key(&[uuid.as_bytes(), &Version::new(9).to_key()]);
        assert_eq!(uuid_at("t", &k, 0).unwrap(), uuid);
        assert_eq!(version_key_at("t", &k, 16).unwrap(), Version::new(9));
        assert!(uuid_at("t", &k, 8).is_err());
    }
}
