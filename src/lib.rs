//! revdb - A versioned, append-only item store
//!
//! Items, reference collections, names, ACLs and skip-list index nodes are
//! stored as immutable revisions keyed by a global version, over an
//! embedded B-tree engine. Readers see any past version; purging below a
//! watermark reclaims history no reader can reach.

pub mod acl;
pub mod commits;
pub mod config;
pub mod conflict_point;
pub mod indexes;
pub mod item;
pub mod mvcc;
pub mod names;
pub mod refs;
pub mod repository;
pub mod storage;
pub mod versions;

pub use config::StoreConfig;
pub use mvcc::{ReadView, Version};
pub use repository::{CommitBatch, ItemStore, PurgeReport};
pub use storage::{StoreError, StoreResult};
