//! Run snapshot storage on a single SQLite file.
//!
//! The engine process writes while `baton status` in another process may
//! read, so the file is put in WAL mode and writers wait on a busy lock
//! instead of failing. Callers on the runtime go through
//! [`Database::with_conn_async`], which moves the query onto the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;

use crate::error::EngineError;

/// How long a statement waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn db_error(context: &str) -> impl Fn(rusqlite::Error) -> EngineError + '_ {
    move |e| EngineError::Database(format!("{}: {}", context, e))
}

/// Shared handle to the snapshot database; clones use the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the database file, creating it and its directory when missing.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Database(format!("Cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_error("Cannot open database"))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(db_error("Cannot set busy timeout"))?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(db_error("Cannot switch to WAL"))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!("[Db] {} stays in {} journal mode", path.display(), mode);
        }
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(db_error("Cannot set synchronous mode"))?;

        let db = Self::from_connection(conn)?;
        tracing::info!("[Db] Run store at {}", path.display());
        Ok(db)
    }

    /// Private database for tests and throwaway engines.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(db_error("Cannot open in-memory database"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, EngineError> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_tables()?;
        Ok(db)
    }

    /// Run `f` on the connection from the current thread.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        // A panic mid-query leaves no half-applied state in SQLite, so a poisoned lock is usable.
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn).map_err(|e| EngineError::Database(e.to_string()))
    }

    /// Run `f` on the blocking pool.
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| EngineError::Internal(format!("Database task failed: {}", e)))?
    }

    fn initialize_tables(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id              TEXT PRIMARY KEY,
                    workflow_name   TEXT NOT NULL,
                    status          TEXT NOT NULL,
                    snapshot        TEXT NOT NULL,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_workflow_runs_workflow ON workflow_runs(workflow_name);
                CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs(status);
                ",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_dirs_and_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("baton.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());

        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='workflow_runs'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baton.db");
        Database::open(&path).unwrap();
        let db = Database::open(&path).unwrap();
        let n: i64 = db
            .with_conn_async(|conn| conn.query_row("SELECT COUNT(*) FROM workflow_runs", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("baton.db")).unwrap();
        let mode: String = db
            .with_conn(|conn| conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
