//! Storage subsystem for revdb
//!
//! The storage layer owns the embedded engine handle and the primitives
//! every versioned container is built from.
//!
//! # Design Principles
//!
//! - Append-only revisions (no in-place updates)
//! - Fixed-width, order-preserving keys with complemented versions
//! - Decode failures are fatal and never read as "not found"
//! - Deadlocks retried only by the transaction owner
//! - Cursors own their read scope and release it on close or drop

mod codec;
mod compact;
mod container;
mod cursor;
mod engine;
mod errors;
mod hash;

pub use codec::{
    key, u32_at, uuid_at, version_at, version_key_at, RecordReader, RecordWriter,
};
pub use compact::CompactStats;
pub use container::{Container, DEFAULT_COMPACTION_ATTEMPTS};
pub use cursor::{prefix_successor, Cursor, Direction, Lookup, DEFAULT_BATCH};
pub use engine::{Entry, RawDefinition, Scope, Store, StoreOptions, Transaction};
pub use errors::{FormatStamp, Severity, StoreError, StoreResult};
pub use hash::name_hash;
