//! Store error types
//!
//! Error codes:
//! - REVDB_DEADLOCK (ERROR severity, retryable)
//! - REVDB_INCOMPATIBLE_FORMAT (FATAL severity)
//! - REVDB_MISSING_STAMP (FATAL severity)
//! - REVDB_MISSING_TABLE (FATAL severity)
//! - REVDB_CORRUPT_RECORD (FATAL severity)
//! - REVDB_COMPACTION_BUSY (ERROR severity)
//! - REVDB_ENGINE_ERROR (ERROR severity)
//!
//! "Not found" is never an error: point lookups return `Ok(None)`.

use std::fmt;
use std::io;

use thiserror::Error;

use super::compact::CompactStats;

/// Severity levels for store errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, store continues
    Error,
    /// Store must not continue
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Persisted (format, schema) compatibility pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatStamp {
    pub format: u32,
    pub schema: u32,
}

impl fmt::Display for FormatStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "format {} schema {}", self.format, self.schema)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Lock conflict reported by the engine. Retried inside
    /// container-owned transactions, re-raised inside caller-owned ones.
    #[error("deadlock at {site}")]
    Deadlock { site: &'static str },

    #[error("incompatible store: found {found}, expected {expected}")]
    IncompatibleFormat {
        found: FormatStamp,
        expected: FormatStamp,
    },

    #[error("store has no format stamp")]
    MissingStamp,

    #[error("table for container {0} does not exist")]
    MissingTable(&'static str),

    #[error("corrupt record in {container} at key {key}: {reason}")]
    CorruptRecord {
        container: &'static str,
        key: String,
        reason: String,
    },

    #[error("compaction gave up after {} attempts", .stats.attempts)]
    CompactionBusy { stats: CompactStats },

    #[error("container {0} is closed")]
    ContainerClosed(&'static str),

    #[error("transaction already finished")]
    TransactionFinished,

    #[error("watermark {requested} rejected: current minimum {current}, latest version {latest}")]
    NonMonotonicWatermark {
        requested: u32,
        current: u32,
        latest: u32,
    },

    #[error("engine error: {0}")]
    Engine(#[from] redb::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("engine handle lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Create a corrupt record error for the raw key it was read under.
    pub fn corrupt(container: &'static str, key: &[u8], reason: impl Into<String>) -> Self {
        StoreError::CorruptRecord {
            container,
            key: hex::encode(key),
            reason: reason.into(),
        }
    }

    /// Returns the string code for this error
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Deadlock { .. } => "REVDB_DEADLOCK",
            StoreError::IncompatibleFormat { .. } => "REVDB_INCOMPATIBLE_FORMAT",
            StoreError::MissingStamp => "REVDB_MISSING_STAMP",
            StoreError::MissingTable(_) => "REVDB_MISSING_TABLE",
            StoreError::CorruptRecord { .. } => "REVDB_CORRUPT_RECORD",
            StoreError::CompactionBusy { .. } => "REVDB_COMPACTION_BUSY",
            StoreError::ContainerClosed(_) => "REVDB_CONTAINER_CLOSED",
            StoreError::TransactionFinished => "REVDB_TRANSACTION_FINISHED",
            StoreError::NonMonotonicWatermark { .. } => "REVDB_NON_MONOTONIC_WATERMARK",
            StoreError::Engine(_) => "REVDB_ENGINE_ERROR",
            StoreError::Io(_) => "REVDB_IO_ERROR",
            StoreError::Config(_) => "REVDB_CONFIG_ERROR",
            StoreError::InvalidArgument(_) => "REVDB_INVALID_ARGUMENT",
            StoreError::Poisoned => "REVDB_POISONED",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            StoreError::IncompatibleFormat { .. }
            | StoreError::MissingStamp
            | StoreError::MissingTable(_)
            | StoreError::CorruptRecord { .. }
            | StoreError::Poisoned => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// Returns whether this error is fatal
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Returns whether the whole unit of work may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Deadlock { .. })
    }
}

macro_rules! engine_error {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for StoreError {
                fn from(e: $ty) -> Self {
                    StoreError::Engine(e.into())
                }
            }
        )*
    };
}

engine_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::Poisoned
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
