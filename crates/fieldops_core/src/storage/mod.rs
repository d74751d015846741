//! Local durable key/value storage for whole-collection snapshots.
//!
//! # Responsibility
//! - Define the storage contract used by the persistence scheduler.
//! - Provide SQLite-backed and in-memory implementations.
//! - Load persisted snapshots tolerantly.
//!
//! # Invariants
//! - Every `set` fully replaces the prior value for that key.
//! - Entries larger than the configured quota are rejected with
//!   `StorageError::Quota` and leave the prior value untouched.
//! - Malformed stored text is treated as absent by the loaders.

mod memory;
mod snapshot;
mod sqlite;

pub use memory::MemoryLocalStorage;
pub use snapshot::{load_json, load_snapshot, store_json};
pub use sqlite::SqliteLocalStorage;

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug)]
pub enum StorageError {
    /// Entry exceeds the per-entry quota.
    Quota {
        key: String,
        bytes: usize,
        limit: usize,
    },
    Serialize(serde_json::Error),
    Db(DbError),
    /// Backend lock was poisoned by a panicking writer.
    Unavailable(&'static str),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quota { key, bytes, limit } => write!(
                f,
                "storage quota exceeded for `{key}`: {bytes} bytes > {limit} bytes"
            ),
            Self::Serialize(err) => write!(f, "snapshot serialization failed: {err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Unavailable(details) => write!(f, "local storage unavailable: {details}"),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Serialize(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Quota { .. } | Self::Unavailable(_) => None,
        }
    }
}

impl From<DbError> for StorageError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Query(value))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialize(value)
    }
}

/// Synchronous text key/value store.
///
/// Implementations are shared between the foreground context and deferred
/// persistence tasks, hence `Send + Sync`.
pub trait LocalStorage: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
    /// Sorted keys currently stored.
    fn keys(&self) -> StorageResult<Vec<String>>;
}

pub(crate) fn check_quota(key: &str, value: &str, limit: usize) -> StorageResult<()> {
    if value.len() > limit {
        return Err(StorageError::Quota {
            key: key.to_string(),
            bytes: value.len(),
            limit,
        });
    }
    Ok(())
}
