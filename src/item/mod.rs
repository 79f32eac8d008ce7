//! Item storage
//!
//! This module provides:
//! - `ItemRevision` - One versioned revision of an item
//! - `ItemContainer` - Revision chains plus kind and version orderings
//! - `KindQuery`, `History`, `ItemVersions` - Scoped iterators over them

mod container;
mod iter;
mod revision;

pub use container::ItemContainer;
pub use iter::{History, ItemEntry, ItemVersions, KindQuery};
pub use revision::{ItemRevision, Status};
