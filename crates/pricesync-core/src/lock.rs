//! Cross-process mutex keyed by (supplier line, purpose).
//!
//! The lock lives in the shared SQLite file. Acquisition is one conditional
//! upsert, so two processes racing on the same key can never both win:
//! SQLite serialises the writes and only one of them sees `changes() == 1`.
//! Release is owner-checked; a holder whose TTL lapsed and whose lock was
//! taken over cannot release the new holder's lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

use crate::db::{from_millis, to_millis, Db};
use crate::error::Result;
use crate::types::{LockKey, LockStatus, SyncLock};

const LOCK_COLUMNS: &str =
    "line_id, purpose, status, owner_token, acquired_at, expires_at, completed_at, last_error";

/// Message stored on locks cleared from the admin surface.
pub const CLEARED_BY_OPERATOR: &str = "cleared by operator";

fn lock_from_row(row: &Row<'_>) -> rusqlite::Result<SyncLock> {
    let status: String = row.get(2)?;
    let status = status.parse::<LockStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::<dyn std::error::Error + Send + Sync>::from(e),
        )
    })?;
    Ok(SyncLock {
        key: LockKey::new(row.get(0)?, row.get::<_, String>(1)?),
        status,
        owner_token: row.get(3)?,
        acquired_at: from_millis(row.get(4)?),
        expires_at: from_millis(row.get(5)?),
        completed_at: from_millis(row.get(6)?),
        last_error: row.get(7)?,
    })
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

/// Take the lock for `token` unless another owner holds it unexpired.
pub fn try_acquire(
    conn: &Connection,
    key: &LockKey,
    token: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now_ms = to_millis(now);
    let expires_ms = now_ms.saturating_add(ttl_millis(ttl));
    let changed = conn.execute(
        "INSERT INTO sync_locks
             (line_id, purpose, status, owner_token, acquired_at, expires_at, completed_at, last_error)
         VALUES (?1, ?2, 'processing', ?3, ?4, ?5, NULL, NULL)
         ON CONFLICT(line_id, purpose) DO UPDATE SET
             status = 'processing',
             owner_token = excluded.owner_token,
             acquired_at = excluded.acquired_at,
             expires_at = excluded.expires_at,
             completed_at = NULL,
             last_error = NULL
         WHERE sync_locks.status != 'processing'
            OR sync_locks.expires_at IS NULL
            OR sync_locks.expires_at <= ?4",
        params![key.line_id, key.purpose, token, now_ms, expires_ms],
    )?;
    Ok(changed == 1)
}

/// Move a lock held by `token` to `status`. Returns false when the caller
/// no longer owns it (stale token, already released, reclaimed).
fn finish(
    conn: &Connection,
    key: &LockKey,
    token: &str,
    status: LockStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_locks
         SET status = ?4, completed_at = ?5, last_error = ?6
         WHERE line_id = ?1 AND purpose = ?2 AND owner_token = ?3 AND status = 'processing'",
        params![
            key.line_id,
            key.purpose,
            token,
            status.as_str(),
            to_millis(now),
            error
        ],
    )?;
    Ok(changed == 1)
}

pub fn release(conn: &Connection, key: &LockKey, token: &str, now: DateTime<Utc>) -> Result<bool> {
    finish(conn, key, token, LockStatus::Completed, None, now)
}

pub fn release_with_error(
    conn: &Connection,
    key: &LockKey,
    token: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    finish(conn, key, token, LockStatus::Failed, Some(message), now)
}

pub fn is_held(conn: &Connection, key: &LockKey, now: DateTime<Utc>) -> Result<bool> {
    let held: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sync_locks
             WHERE line_id = ?1 AND purpose = ?2 AND status = 'processing' AND expires_at > ?3",
            params![key.line_id, key.purpose, to_millis(now)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(held.is_some())
}

pub fn get(conn: &Connection, key: &LockKey) -> Result<Option<SyncLock>> {
    let sql = format!("SELECT {LOCK_COLUMNS} FROM sync_locks WHERE line_id = ?1 AND purpose = ?2");
    Ok(conn
        .query_row(&sql, params![key.line_id, key.purpose], lock_from_row)
        .optional()?)
}

pub fn list(conn: &Connection) -> Result<Vec<SyncLock>> {
    let sql = format!("SELECT {LOCK_COLUMNS} FROM sync_locks ORDER BY line_id, purpose");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], lock_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Operator remediation: reset the row to `idle` whatever its state.
/// Returns false when no row exists for the key.
pub fn force_clear(conn: &Connection, key: &LockKey, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_locks
         SET status = 'idle', owner_token = NULL, expires_at = NULL,
             completed_at = ?3, last_error = ?4
         WHERE line_id = ?1 AND purpose = ?2",
        params![key.line_id, key.purpose, to_millis(now), CLEARED_BY_OPERATOR],
    )?;
    Ok(changed == 1)
}

/// Fail every `processing` lock acquired more than `threshold` before `now`.
pub fn reclaim_stale(
    conn: &Connection,
    threshold: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<LockKey>> {
    let now_ms = to_millis(now);
    let cutoff = now_ms.saturating_sub(ttl_millis(threshold));
    let message = format!(
        "reclaimed: processing for longer than {}s",
        threshold.as_secs()
    );
    let mut stmt = conn.prepare(
        "UPDATE sync_locks
         SET status = 'failed', completed_at = ?2, last_error = ?3
         WHERE status = 'processing' AND acquired_at < ?1
         RETURNING line_id, purpose",
    )?;
    let rows = stmt.query_map(params![cutoff, now_ms, message], |row| {
        Ok(LockKey::new(row.get(0)?, row.get::<_, String>(1)?))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

/// Async facade over the lock statements, stamped with the wall clock.
#[derive(Clone)]
pub struct LockManager {
    db: Db,
}

impl LockManager {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn try_acquire(&self, key: &LockKey, token: &str, ttl: Duration) -> Result<bool> {
        let (key, token) = (key.clone(), token.to_string());
        self.db
            .call(move |conn| try_acquire(conn, &key, &token, ttl, Utc::now()))
            .await
    }

    pub async fn release(&self, key: &LockKey, token: &str) -> Result<bool> {
        let (key, token) = (key.clone(), token.to_string());
        let released = self
            .db
            .call({
                let key = key.clone();
                move |conn| release(conn, &key, &token, Utc::now())
            })
            .await?;
        if !released {
            warn!(lock = %key, "release ignored: lock no longer owned by this run");
        }
        Ok(released)
    }

    pub async fn release_with_error(&self, key: &LockKey, token: &str, message: &str) -> Result<bool> {
        let (key, token, message) = (key.clone(), token.to_string(), message.to_string());
        let released = self
            .db
            .call({
                let key = key.clone();
                move |conn| release_with_error(conn, &key, &token, &message, Utc::now())
            })
            .await?;
        if !released {
            warn!(lock = %key, "failure release ignored: lock no longer owned by this run");
        }
        Ok(released)
    }

    pub async fn is_held(&self, key: &LockKey) -> Result<bool> {
        let key = key.clone();
        self.db.call(move |conn| is_held(conn, &key, Utc::now())).await
    }

    pub async fn get(&self, key: &LockKey) -> Result<Option<SyncLock>> {
        let key = key.clone();
        self.db.call(move |conn| get(conn, &key)).await
    }

    pub async fn list(&self) -> Result<Vec<SyncLock>> {
        self.db.call(|conn| list(conn)).await
    }

    pub async fn force_clear(&self, key: &LockKey) -> Result<bool> {
        let cleared = self
            .db
            .call({
                let key = key.clone();
                move |conn| force_clear(conn, &key, Utc::now())
            })
            .await?;
        if cleared {
            info!(lock = %key, "lock cleared by operator");
        }
        Ok(cleared)
    }

    pub async fn reclaim_stale(&self, threshold: Duration) -> Result<usize> {
        let keys = self
            .db
            .call(move |conn| reclaim_stale(conn, threshold, Utc::now()))
            .await?;
        for key in &keys {
            warn!(lock = %key, threshold_secs = threshold.as_secs(), "reclaimed stale lock");
        }
        Ok(keys.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
