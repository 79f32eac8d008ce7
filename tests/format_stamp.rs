//! Format stamp checks on reopen
//!
//! A store written by one (format, schema) pair must refuse to open under
//! another, before any container is usable.

mod common;

use std::sync::Arc;

use common::{commit_item, create_temp_data_dir, disk_config, v};
use revdb::storage::{FormatStamp, Severity, Store};
use revdb::versions::{VersionContainer, CURRENT_STAMP, FORMAT_VERSION, SCHEMA_VERSION};
use revdb::{ItemStore, StoreConfig, StoreError};
use uuid::Uuid;

#[test]
fn test_reopen_keeps_identity_and_data() {
    let dir = create_temp_data_dir();
    let config = disk_config(&dir);
    let (kind, a) = (Uuid::new_v4(), Uuid::new_v4());

    let identity = {
        let store = ItemStore::open(&config).unwrap();
        commit_item(&store, a, kind, 1);
        let info = store.version_info().unwrap();
        assert_eq!(info.stamp, CURRENT_STAMP);
        store.close();
        info.store
    };

    let store = ItemStore::open(&config).unwrap();
    let info = store.version_info().unwrap();
    assert_eq!(info.store, identity);
    assert_eq!(info.version, v(1));
    assert!(store.items().find_item(None, v(1), &a).unwrap().is_some());
}

#[test]
fn test_schema_mismatch_fails_fast() {
    let dir = create_temp_data_dir();
    let config = disk_config(&dir);
    drop(ItemStore::open(&config).unwrap());

    let newer = FormatStamp {
        format: FORMAT_VERSION,
        schema: SCHEMA_VERSION + 1,
    };
    let err = ItemStore::open_with_stamp(&config, newer).unwrap_err();
    match &err {
        StoreError::IncompatibleFormat { found, expected } => {
            assert_eq!(*found, CURRENT_STAMP);
            assert_eq!(*expected, newer);
        }
        other => panic!("expected IncompatibleFormat, got {:?}", other),
    }
    assert_eq!(err.severity(), Severity::Fatal);
    assert_eq!(err.code(), "REVDB_INCOMPATIBLE_FORMAT");

    // The failed open left the store untouched.
    assert!(ItemStore::open(&config).is_ok());
}

#[test]
fn test_missing_file_without_create() {
    let dir = create_temp_data_dir();
    let config = StoreConfig {
        create: false,
        ..disk_config(&dir)
    };
    let err = ItemStore::open(&config).unwrap_err();
    assert!(matches!(err, StoreError::Io(_)));
}

#[test]
fn test_open_without_create_reports_missing_table() {
    let dir = create_temp_data_dir();
    let config = disk_config(&dir);
    {
        let options = config.to_options();
        let store = Arc::new(Store::open(config.path.as_deref(), options).unwrap());
        VersionContainer::open(store, None, options, CURRENT_STAMP).unwrap();
    }

    let config = StoreConfig {
        create: false,
        ..config
    };
    let err = ItemStore::open(&config).unwrap_err();
    assert!(matches!(err, StoreError::MissingTable("items")));
    assert!(err.is_fatal());

    // The failed open created nothing either.
    let err = ItemStore::open(&config).unwrap_err();
    assert!(matches!(err, StoreError::MissingTable("items")));
}

#[test]
fn test_config_from_json_opens_store() {
    let dir = create_temp_data_dir();
    let path = dir.path().join("items.redb");
    let json = format!(
        r#"{{ "path": {}, "cursor_batch": 2 }}"#,
        serde_json::to_string(&path).unwrap()
    );
    let config = StoreConfig::from_json(&json).unwrap();
    let store = ItemStore::open(&config).unwrap();
    assert_eq!(store.store().cursor_batch(), 2);
    assert_eq!(store.store().path(), Some(path.as_path()));
}
