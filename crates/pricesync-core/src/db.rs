//! SQLite store shared by the catalog repository and the lock manager.
//!
//! The database file is the coordination point between processes: every
//! process opens its own connection in WAL mode with a busy timeout, and all
//! lock transitions are single atomic statements.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

use crate::error::{Result, SyncError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS supplier_lines (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL,
    remote_code TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS catalog_items (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    code              TEXT NOT NULL UNIQUE,
    line_id           INTEGER NOT NULL REFERENCES supplier_lines(id),
    ship_code         TEXT NOT NULL,
    sailing_date      TEXT NOT NULL,
    price_interior    REAL,
    price_oceanview   REAL,
    price_balcony     REAL,
    price_suite       REAL,
    cheapest_price    REAL,
    cheapest_class    TEXT,
    currency          TEXT,
    last_synced_at    INTEGER,
    last_attempted_at INTEGER,
    active            INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_catalog_items_eligible
    ON catalog_items (line_id, active, sailing_date);

CREATE TABLE IF NOT EXISTS item_pricing (
    item_id         INTEGER PRIMARY KEY REFERENCES catalog_items(id),
    price_interior  REAL,
    price_oceanview REAL,
    price_balcony   REAL,
    price_suite     REAL,
    cheapest_price  REAL,
    cheapest_class  TEXT,
    currency        TEXT,
    payload_sha256  TEXT NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_outbox (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id   INTEGER NOT NULL,
    queued_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_locks (
    line_id      INTEGER NOT NULL,
    purpose      TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'idle',
    owner_token  TEXT,
    acquired_at  INTEGER,
    expires_at   INTEGER,
    completed_at INTEGER,
    last_error   TEXT,
    PRIMARY KEY (line_id, purpose)
);
"#;

/// Open a connection to the database at `path`, creating the schema if needed.
pub fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // journal_mode returns a row, so it cannot go through execute_batch.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// In-memory database, used by tests.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Db
// ---------------------------------------------------------------------------

/// Cloneable handle to one SQLite connection.
///
/// Async callers go through [`Db::call`], which runs the closure on the
/// blocking pool so the runtime threads never wait on SQLite.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_connection(open_connection(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_connection(open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` against the connection on the current thread.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| SyncError::Store("connection mutex poisoned".into()))?;
        f(&mut guard)
    }

    /// Run `f` against the connection on the blocking thread pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| SyncError::Store(format!("task join error: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_parent_dirs_and_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/store.db");
        let conn = open_connection(&path).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('supplier_lines', 'catalog_items', 'item_pricing', 'cache_outbox', 'sync_locks')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn reopening_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        drop(open_connection(&path).unwrap());
        assert!(open_connection(&path).is_ok());
    }

    #[tokio::test]
    async fn call_runs_on_blocking_pool() {
        let db = Db::in_memory().unwrap();
        let n: i64 = db
            .call(|conn| Ok(conn.query_row("SELECT 41 + 1", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 42);
    }

    #[test]
    fn millis_round_trip() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(from_millis(Some(to_millis(now))), Some(now));
        assert_eq!(from_millis(None), None);
    }
}
