//! SQLite bootstrap for the local durable store.
//!
//! # Responsibility
//! - Open and configure SQLite connections backing local snapshots.
//! - Apply schema migrations in deterministic order.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - No snapshot is read or written before migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

/// Failure of the local snapshot database.
#[derive(Debug)]
pub enum DbError {
    /// The database could not be opened or configured (`mode` is `file` or `memory`).
    Open {
        mode: &'static str,
        source: rusqlite::Error,
    },
    /// Migration `version` failed; its transaction was rolled back.
    Migration {
        version: u32,
        source: rusqlite::Error,
    },
    /// The file was written by a newer build of the engine.
    NewerSchema { found: u32, supported: u32 },
    /// Reading or writing a snapshot entry failed.
    Query(rusqlite::Error),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { mode, source } => {
                write!(f, "cannot open local snapshot store ({mode}): {source}")
            }
            Self::Migration { version, source } => {
                write!(f, "local snapshot store migration {version} failed: {source}")
            }
            Self::NewerSchema { found, supported } => write!(
                f,
                "local snapshot store has schema {found}; this build reads up to {supported}"
            ),
            Self::Query(err) => write!(f, "local snapshot store query failed: {err}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Open { source, .. } | Self::Migration { source, .. } => Some(source),
            Self::Query(err) => Some(err),
            Self::NewerSchema { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Query(value)
    }
}
