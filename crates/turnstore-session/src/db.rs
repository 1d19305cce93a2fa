//! Shared SQLite database handle.
//!
//! The session store and the artifact store can live in one `sessions.db` so
//! that they share a connection (and its serialization of writers).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use turnstore_core::Config;

use crate::error::{Result, StoreError};

const DB_FILE: &str = "sessions.db";

/// A cloneable handle to one SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) `sessions.db` under `base_dir` and run migrations.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;

        let db_path = base_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::init(conn, Some(db_path))
    }

    /// Open the database in the configured data directory.
    pub fn open_from_config(config: &Config) -> Result<Self> {
        let data_dir = config.data_dir();
        if data_dir.starts_with("~") {
            return Err(StoreError::PathError(format!(
                "Could not resolve data directory {}",
                data_dir.display()
            )));
        }
        Self::open(data_dir)
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        tracing::debug!(path = ?path, "Opened session database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Path of the database file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

/// Run database migrations.
fn run_migrations(conn: &Connection) -> Result<()> {
    // The version table does not exist before the first migration.
    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        tracing::info!("Applying session database migration 001_initial");
        let migration = include_str!("../migrations/001_initial.sql");
        conn.execute_batch(migration)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path()).unwrap();
        assert!(temp_dir.path().join(DB_FILE).exists());
        assert_eq!(db.path(), Some(temp_dir.path().join(DB_FILE).as_path()));

        let conn = db.lock();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        drop(Database::open(temp_dir.path()).unwrap());
        let db = Database::open(temp_dir.path()).unwrap();
        let tables: i64 = db
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'events'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[test]
    fn test_in_memory_database() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.path().is_none());

        let version: i32 = db
            .lock()
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
