//! SQLite-backed `LocalStorage`.
//!
//! # Invariants
//! - One row per key in `local_entries`; writes are upserts.
//! - The connection is only touched while holding the mutex.

use super::{check_quota, LocalStorage, StorageError, StorageResult};
use crate::db::{open_db, open_db_in_memory};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct SqliteLocalStorage {
    conn: Mutex<Connection>,
    quota_bytes: usize,
}

impl SqliteLocalStorage {
    /// Opens (and migrates) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, quota_bytes: usize) -> StorageResult<Self> {
        Ok(Self::from_connection(open_db(path)?, quota_bytes))
    }

    pub fn open_in_memory(quota_bytes: usize) -> StorageResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?, quota_bytes))
    }

    /// Wraps an already migrated connection.
    pub fn from_connection(conn: Connection, quota_bytes: usize) -> Self {
        Self {
            conn: Mutex::new(conn),
            quota_bytes,
        }
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("sqlite storage lock poisoned"))
    }
}

impl LocalStorage for SqliteLocalStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM local_entries WHERE key = ?1;",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        check_quota(key, value, self.quota_bytes)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO local_entries (key, value, byte_len, updated_at)
             VALUES (?1, ?2, ?3, strftime('%s', 'now') * 1000)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                byte_len = excluded.byte_len,
                updated_at = excluded.updated_at;",
            params![key, value, value.len() as i64],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM local_entries WHERE key = ?1;", [key])?;
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key FROM local_entries ORDER BY key ASC;")?;
        let mut rows = stmt.query([])?;
        let mut keys = Vec::new();
        while let Some(row) = rows.next()? {
            keys.push(row.get::<_, String>(0)?);
        }
        Ok(keys)
    }
}
