//! Skip-list index persistence
//!
//! This module provides:
//! - `SkipNode` - Per-level neighbor pointers of one index entry
//! - `IndexContainer` - Versioned node storage per (index, key)
//! - `NodeIterator` - Scoped node lookups at one version

mod container;
mod node;

pub use container::{IndexContainer, NodeIterator};
pub use node::{SkipLevel, SkipNode, MAX_LEVELS};
