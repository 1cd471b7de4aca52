//! Shared SQLite handle.
//!
//! rusqlite is synchronous, so every access hops onto the blocking pool via
//! `spawn_blocking`. One connection is shared behind a mutex; WAL mode keeps
//! readers from blocking on the writer.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

use crate::migration_runner::run_migrations;

/// Errors from the durable stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} record has schema version {found}, newest supported is {supported}")]
    UnsupportedVersion {
        kind: &'static str,
        found: u32,
        supported: u32,
    },

    #[error("Blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::from_connection(conn)
    }

    /// Fresh in-memory database, used by tests.
    #[allow(dead_code)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            // A panic while holding the lock leaves the connection usable;
            // SQLite rolls back any open transaction on its own.
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| E::from(StoreError::Blocking(e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_runs_on_blocking_pool_and_returns_value() {
        let db = Db::open_in_memory().unwrap();
        let count: i64 = db
            .call(|conn| {
                conn.query_row("SELECT COUNT(*) FROM identity_records", [], |row| {
                    row.get(0)
                })
                .map_err(StoreError::from)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn open_on_disk_applies_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("platewise.db");
        Db::open(&path).unwrap();
        // Re-opening sees the schema already applied.
        Db::open(&path).unwrap();
        assert!(path.exists());
    }
}
