//! Store configuration
//!
//! Loaded from a JSON file or built in code. Every field is optional and
//! falls back to its default.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage::{StoreError, StoreOptions, StoreResult, DEFAULT_BATCH, DEFAULT_COMPACTION_ATTEMPTS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Engine file (required unless `ram`)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Create the file and tables if missing (default: true)
    #[serde(default = "default_true")]
    pub create: bool,

    /// In-memory backend (default: false)
    #[serde(default)]
    pub ram: bool,

    /// Stable snapshot per cursor (default: true)
    #[serde(default = "default_true")]
    pub snapshot_isolation: bool,

    /// Compaction retries while transactions are live (default: 16)
    #[serde(default = "default_compaction_attempts")]
    pub compaction_attempts: u32,

    /// Entries buffered per cursor refill (default: 64)
    #[serde(default = "default_cursor_batch")]
    pub cursor_batch: usize,
}

fn default_true() -> bool {
    true
}

fn default_compaction_attempts() -> u32 {
    DEFAULT_COMPACTION_ATTEMPTS
}

fn default_cursor_batch() -> usize {
    DEFAULT_BATCH
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            create: true,
            ram: false,
            snapshot_isolation: true,
            compaction_attempts: default_compaction_attempts(),
            cursor_batch: default_cursor_batch(),
        }
    }
}

impl StoreConfig {
    /// On-disk store at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Throwaway in-memory store.
    pub fn in_memory() -> Self {
        Self {
            ram: true,
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> StoreResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> StoreResult<Self> {
        let config: StoreConfig = serde_json::from_str(content)
            .map_err(|e| StoreError::Config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if !self.ram && self.path.is_none() {
            return Err(StoreError::Config(
                "path is required unless ram is set".to_string(),
            ));
        }
        if self.cursor_batch == 0 {
            return Err(StoreError::Config("cursor_batch must be > 0".to_string()));
        }
        if self.compaction_attempts == 0 {
            return Err(StoreError::Config(
                "compaction_attempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_options(&self) -> StoreOptions {
        StoreOptions {
            create: self.create,
            ram: self.ram,
            snapshot_isolation: self.snapshot_isolation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = StoreConfig::from_json(r#"{ "path": "/tmp/items.redb" }"#).unwrap();
        assert!(config.create);
        assert!(!config.ram);
        assert!(config.snapshot_isolation);
        assert_eq!(config.compaction_attempts, DEFAULT_COMPACTION_ATTEMPTS);
        assert_eq!(config.cursor_batch, DEFAULT_BATCH);
    }

    #[test]
    fn test_disk_mode_requires_path() {
        let err = StoreConfig::from_json("{}").unwrap_err();
        assert_eq!(err.code(), "REVDB_CONFIG_ERROR");
        assert!(StoreConfig::from_json(r#"{ "ram": true }"#).is_ok());
    }

    #[test]
    fn test_zero_batch_rejected() {
        let mut config = StoreConfig::in_memory();
        config.cursor_batch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_options_projection() {
        let mut config = StoreConfig::at("/tmp/x");
        config.snapshot_isolation = false;
        let options = config.to_options();
        assert!(options.create && !options.ram && !options.snapshot_isolation);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("revdb.json");
        fs::write(&file, r#"{ "ram": true, "cursor_batch": 8 }"#).unwrap();
        let config = StoreConfig::load(&file).unwrap();
        assert_eq!(config.cursor_batch, 8);
        assert!(StoreConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
