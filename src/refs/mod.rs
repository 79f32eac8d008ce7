//! Reference collections
//!
//! This module provides:
//! - `RefEntry` - Link, list head or tombstone of one membership revision
//! - `RefContainer` - Versioned doubly linked membership lists
//! - `RefIterator`, `RefHistory` - Scoped lookups and change feeds

mod container;
mod entry;
mod iter;

pub use container::RefContainer;
pub use entry::{RefEntry, RefHead, RefLink};
pub use iter::{RefChange, RefHistory, RefIterator};
