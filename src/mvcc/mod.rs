//! MVCC Domain Types
//!
//! - Defines the versioning vocabulary shared by every container
//! - Encodes the ordering and purge rules structurally
//!
//! This module provides:
//! - `Version` - Totally ordered commit point
//! - `ReadView` - Reconstructed reader snapshot at a version
//! - `PurgePlanner` - Watermark-bounded revision reclamation

mod purge;
mod read_view;
mod version;

pub use purge::{PurgeCounts, PurgePlanner, RevisionState};
pub use read_view::ReadView;
pub use version::Version;
