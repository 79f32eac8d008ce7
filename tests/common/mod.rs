//! Shared fixtures for integration tests

#![allow(dead_code)]

use revdb::item::ItemRevision;
use revdb::storage::name_hash;
use revdb::{ItemStore, StoreConfig, Version};
use tempfile::TempDir;
use uuid::Uuid;

pub fn memory_store() -> ItemStore {
    ItemStore::open(&StoreConfig::in_memory()).expect("Failed to open in-memory store")
}

pub fn create_temp_data_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

pub fn disk_config(dir: &TempDir) -> StoreConfig {
    StoreConfig::at(dir.path().join("items.redb"))
}

pub fn v(n: u32) -> Version {
    Version::new(n)
}

/// Attribute hash of `name`.
pub fn attr(name: &str) -> u32 {
    name_hash(name)
}

/// Deterministic uuid standing in for an attribute value.
pub fn value(n: u128) -> Uuid {
    Uuid::from_u128(0x1000 + n)
}

/// Commits one revision of `uuid` with attribute `x` set to `value(x)`.
pub fn commit_item(store: &ItemStore, uuid: Uuid, kind: Uuid, x: u128) -> Version {
    let (version, ()) = store
        .commit(None, |batch| {
            batch.save_item(ItemRevision::new(uuid, Version::ZERO, kind).with_value(attr("x"), value(x)))
        })
        .expect("commit failed");
    version
}
