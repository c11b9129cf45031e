//! Item read cache and its invalidation seam.
//!
//! Entries are keyed by strings whose prefix names the owning item, for
//! example `pricing:42:GBP` or `search:item:42:page1`. The pipeline never
//! populates the cache; it only drops the entries of items it re-priced.
//!
//! The redb file can be open in one process at a time. That process owns the
//! cache ([`RedbCache`]). Any other process (a CLI `sync` next to a running
//! server) gets an [`OutboxCache`], which queues item ids in the shared
//! SQLite store; the owner applies them with an [`OutboxDrainer`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use rusqlite::{params, Connection};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::db::{to_millis, Db};
use crate::error::{Result, SyncError};

/// Key: cache key string. Value: opaque bytes owned by the reader side.
const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Every key prefix under which entries derived from `item_id` are stored.
pub fn item_prefixes(item_id: i64) -> [String; 3] {
    [
        format!("item:{item_id}:"),
        format!("pricing:{item_id}:"),
        format!("search:item:{item_id}:"),
    ]
}

/// Drops cached data for an item after its pricing changed.
pub trait CacheInvalidator: Send + Sync {
    /// Returns the number of entries removed.
    fn invalidate_item(&self, item_id: i64) -> Result<usize>;

    fn kind(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// RedbCache
// ---------------------------------------------------------------------------

fn cache_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Cache(e.to_string())
}

pub struct RedbCache {
    db: Database,
}

impl RedbCache {
    /// Open or create the cache file, creating its table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(cache_err)?;
        let wt = db.begin_write().map_err(cache_err)?;
        wt.open_table(ENTRIES).map_err(cache_err)?;
        wt.commit().map_err(cache_err)?;
        Ok(Self { db })
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let wt = self.db.begin_write().map_err(cache_err)?;
        {
            let mut table = wt.open_table(ENTRIES).map_err(cache_err)?;
            table.insert(key, value).map_err(cache_err)?;
        }
        wt.commit().map_err(cache_err)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let rt = self.db.begin_read().map_err(cache_err)?;
        let table = rt.open_table(ENTRIES).map_err(cache_err)?;
        let value = table.get(key).map_err(cache_err)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    /// Remove every key starting with one of `prefixes` in one write
    /// transaction.
    pub fn invalidate_prefixes(&self, prefixes: &[String]) -> Result<usize> {
        let wt = self.db.begin_write().map_err(cache_err)?;
        let mut removed = 0;
        {
            let mut table = wt.open_table(ENTRIES).map_err(cache_err)?;
            for prefix in prefixes {
                let mut doomed = Vec::new();
                for entry in table.range(prefix.as_str()..).map_err(cache_err)? {
                    let (k, _) = entry.map_err(cache_err)?;
                    let key = k.value();
                    if !key.starts_with(prefix.as_str()) {
                        break;
                    }
                    doomed.push(key.to_string());
                }
                for key in &doomed {
                    table.remove(key.as_str()).map_err(cache_err)?;
                }
                removed += doomed.len();
            }
        }
        wt.commit().map_err(cache_err)?;
        Ok(removed)
    }
}

impl CacheInvalidator for RedbCache {
    fn invalidate_item(&self, item_id: i64) -> Result<usize> {
        self.invalidate_prefixes(&item_prefixes(item_id))
    }

    fn kind(&self) -> &'static str {
        "redb"
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

pub fn enqueue_invalidation(conn: &Connection, item_id: i64, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO cache_outbox (item_id, queued_at) VALUES (?1, ?2)",
        params![item_id, to_millis(now)],
    )?;
    Ok(())
}

pub fn pending_invalidations(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM cache_outbox", [], |row| row.get(0))?;
    Ok(usize::try_from(n).unwrap_or(0))
}

/// Apply every queued invalidation to `cache`, then delete the applied rows.
/// Rows stay queued when the cache write fails. Returns the rows applied.
pub fn drain_outbox(conn: &Connection, cache: &RedbCache) -> Result<usize> {
    let queued: Vec<(i64, i64)> = {
        let mut stmt = conn.prepare("SELECT id, item_id FROM cache_outbox ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    let Some(&(last_id, _)) = queued.last() else {
        return Ok(0);
    };

    let mut items: Vec<i64> = queued.iter().map(|(_, item)| *item).collect();
    items.sort_unstable();
    items.dedup();
    let mut removed = 0;
    for item_id in items {
        removed += cache.invalidate_item(item_id)?;
    }

    conn.execute("DELETE FROM cache_outbox WHERE id <= ?1", params![last_id])?;
    debug!(rows = queued.len(), removed, "applied queued cache invalidations");
    Ok(queued.len())
}

/// Invalidator for a process that does not own the cache file: records the
/// item in the shared store for the owner to apply.
#[derive(Clone)]
pub struct OutboxCache {
    db: Db,
}

impl OutboxCache {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

impl CacheInvalidator for OutboxCache {
    /// Nothing is removed here, so this always reports 0.
    fn invalidate_item(&self, item_id: i64) -> Result<usize> {
        self.db
            .with_conn(|conn| enqueue_invalidation(conn, item_id, Utc::now()))?;
        Ok(0)
    }

    fn kind(&self) -> &'static str {
        "outbox"
    }
}

/// Runs in the cache-owning process and applies invalidations queued by
/// other processes.
#[derive(Clone)]
pub struct OutboxDrainer {
    db: Db,
    cache: Arc<RedbCache>,
}

impl OutboxDrainer {
    pub fn new(db: Db, cache: Arc<RedbCache>) -> Self {
        Self { db, cache }
    }

    pub fn cache(&self) -> &Arc<RedbCache> {
        &self.cache
    }

    pub fn drain(&self) -> Result<usize> {
        self.db.with_conn(|conn| drain_outbox(conn, &self.cache))
    }

    /// Drain every `interval` on the blocking pool until aborted. Errors are
    /// logged and the rows are retried on the next tick.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let this = self.clone();
                match tokio::task::spawn_blocking(move || this.drain()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(n)) => info!(applied = n, "queued cache invalidations applied"),
                    Ok(Err(e)) => error!(error = %e, "cache outbox drain failed"),
                    Err(e) => error!(error = %e, "cache outbox drain task failed"),
                }
            }
        })
    }
}

/// Used by tests and by callers without a cache.
pub struct NoopCache;

impl CacheInvalidator for NoopCache {
    fn invalidate_item(&self, _item_id: i64) -> Result<usize> {
        Ok(0)
    }

    fn kind(&self) -> &'static str {
        "none"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
