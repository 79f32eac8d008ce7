//! Version - Totally ordered commit point
//!
//! A version is assigned once per committed write batch and is never
//! reused. Every key that must be time-ordered stores the bit-complement
//! of the version so that "newest first" is a plain ascending key scan.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A totally ordered commit point.
///
/// Versions start at 1; version 0 denotes "before any commit".
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u32);

impl Version {
    /// The version of an empty store.
    pub const ZERO: Version = Version(0);

    /// The largest representable version; a read at `MAX` sees everything.
    pub const MAX: Version = Version(u32::MAX);

    #[inline]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Returns the version following this one, or `None` on exhaustion.
    #[inline]
    pub fn next(&self) -> Option<Version> {
        self.0.checked_add(1).map(Version)
    }

    /// Encodes the version for descending-order keys (`~version`, big endian).
    #[inline]
    pub fn to_key(self) -> [u8; 4] {
        (!self.0).to_be_bytes()
    }

    /// Decodes a version stored with [`Version::to_key`].
    #[inline]
    pub fn from_key(bytes: [u8; 4]) -> Self {
        Self(!u32::from_be_bytes(bytes))
    }

    /// Encodes the version for ascending-order keys (plain big endian).
    #[inline]
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    #[inline]
    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl From<u32> for Version {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
