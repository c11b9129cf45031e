//! Bounded pool of connections to the remote file source.
//!
//! The bound protects the remote server, so it is enforced with semaphore
//! permits held for the whole checkout: at most `size` connections are ever
//! live (checked out or idle). Broken connections are discarded and replaced
//! lazily by the next [`ConnectionPool::acquire`].
//!
//! ```rust,ignore
//! let conn = pool.acquire().await?;
//! match conn.retrieve(path).await { ... }
//! conn.release(); // or conn.discard() after a transport error
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::remote::TransferError;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// One live connection to the remote file source.
#[async_trait]
pub trait RemoteConnection: Send {
    /// Retrieve the file at `path`. `Ok(None)` means the file does not exist.
    async fn retrieve(&mut self, path: &str) -> Result<Option<Vec<u8>>, TransferError>;

    /// Cheap local liveness check; no network round trip.
    fn is_alive(&self) -> bool;
}

/// Opens new connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RemoteConnection>, TransferError>;

    /// Short label for diagnostics (e.g. "http", "mirror").
    fn kind(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// PoolStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub opened_total: u64,
    pub discarded_total: u64,
    pub acquire_timeout_secs: u64,
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

struct PoolInner {
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Box<dyn RemoteConnection>>>,
    permits: Arc<Semaphore>,
    size: usize,
    acquire_timeout: Duration,
    opened: AtomicU64,
    discarded: AtomicU64,
}

/// Cloneable handle; all clones share the same bound.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, size: usize, acquire_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                idle: Mutex::new(Vec::with_capacity(size)),
                permits: Arc::new(Semaphore::new(size)),
                size,
                acquire_timeout,
                opened: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn connector_kind(&self) -> &'static str {
        self.inner.connector.kind()
    }

    /// Check out a connection, waiting at most the acquire timeout for a free
    /// slot. Reuses an idle connection when one is alive, otherwise connects.
    pub async fn acquire(&self) -> Result<PooledConnection, TransferError> {
        let timeout = self.inner.acquire_timeout;
        let permit = tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned())
            .await
            .map_err(|_| TransferError::AcquireTimeout(timeout))?
            .map_err(|_| TransferError::Connect("connection pool is closed".into()))?;

        while let Some(conn) = self.pop_idle() {
            if conn.is_alive() {
                return Ok(PooledConnection::new(self.clone(), conn, permit));
            }
            self.inner.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("dropping dead idle connection");
        }

        // Connect under the permit so a slow connect still counts toward the bound.
        let conn = self.inner.connector.connect().await?;
        self.inner.opened.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection::new(self.clone(), conn, permit))
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle.lock().map(|v| v.len()).unwrap_or(0);
        let available = self.inner.permits.available_permits();
        PoolStats {
            size: self.inner.size,
            idle,
            in_use: self.inner.size.saturating_sub(available),
            opened_total: self.inner.opened.load(Ordering::Relaxed),
            discarded_total: self.inner.discarded.load(Ordering::Relaxed),
            acquire_timeout_secs: self.inner.acquire_timeout.as_secs(),
        }
    }

    fn pop_idle(&self) -> Option<Box<dyn RemoteConnection>> {
        self.inner.idle.lock().ok().and_then(|mut v| v.pop())
    }

    fn push_idle(&self, conn: Box<dyn RemoteConnection>) {
        match self.inner.idle.lock() {
            Ok(mut idle) => idle.push(conn),
            Err(_) => {
                self.inner.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PooledConnection
// ---------------------------------------------------------------------------

/// Exclusive checkout of one connection.
///
/// Finish with [`release`](Self::release) or [`discard`](Self::discard).
/// Dropping without either discards: a connection in an unknown state never
/// goes back to the idle set.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<Box<dyn RemoteConnection>>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(pool: ConnectionPool, conn: Box<dyn RemoteConnection>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            conn: Some(conn),
            _permit: permit,
        }
    }

    pub async fn retrieve(&mut self, path: &str) -> Result<Option<Vec<u8>>, TransferError> {
        match self.conn.as_mut() {
            Some(conn) => conn.retrieve(path).await,
            None => Err(TransferError::Connect("connection already returned".into())),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.is_alive())
    }

    /// Return the connection to the idle set, or discard it if it reports dead.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.is_alive() {
                self.pool.push_idle(conn);
            } else {
                self.pool.inner.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop the connection; the pool opens a new one on a later acquire.
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            self.pool.inner.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.pool.inner.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeConn {
        alive: bool,
        live: Arc<AtomicUsize>,
    }

    impl Drop for FakeConn {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RemoteConnection for FakeConn {
        async fn retrieve(&mut self, path: &str) -> Result<Option<Vec<u8>>, TransferError> {
            if path == "broken" {
                self.alive = false;
                return Err(TransferError::Io("reset by peer".into()));
            }
            Ok(Some(path.as_bytes().to_vec()))
        }

        fn is_alive(&self) -> bool {
            self.alive
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        live: Arc<AtomicUsize>,
        peak: AtomicUsize,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn RemoteConnection>, TransferError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(FakeConn {
                alive: true,
                live: self.live.clone(),
            }))
        }

        fn kind(&self) -> &'static str {
            "fake"
        }
    }

    fn pool_with(size: usize, timeout_ms: u64) -> (Arc<FakeConnector>, ConnectionPool) {
        let connector = Arc::new(FakeConnector::default());
        let pool = ConnectionPool::new(connector.clone(), size, Duration::from_millis(timeout_ms));
        (connector, pool)
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let (connector, pool) = pool_with(2, 100);
        let conn = pool.acquire().await.unwrap();
        conn.release();
        let conn = pool.acquire().await.unwrap();
        conn.release();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let (_connector, pool) = pool_with(1, 50);
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, TransferError::AcquireTimeout(_)));
        held.release();
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn never_exceeds_bound_under_contention() {
        let (connector, pool) = pool_with(3, 5_000);
        let mut tasks = Vec::new();
        for i in 0..20 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let mut conn = pool.acquire().await.unwrap();
                conn.retrieve(&format!("f{i}")).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                conn.release();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(connector.peak.load(Ordering::SeqCst) <= 3);
        assert!(connector.live.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn broken_connection_is_replaced_lazily() {
        let (connector, pool) = pool_with(1, 100);
        let mut conn = pool.acquire().await.unwrap();
        assert!(conn.retrieve("broken").await.is_err());
        assert!(!conn.is_alive());
        conn.release();

        // Nothing reconnects until somebody asks.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().discarded_total, 1);

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_alive());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        conn.discard();
    }

    #[tokio::test]
    async fn dropped_checkout_is_discarded_not_leaked() {
        let (connector, pool) = pool_with(1, 100);
        {
            let _conn = pool.acquire().await.unwrap();
        }
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(connector.live.load(Ordering::SeqCst), 0);
        assert!(pool.acquire().await.is_ok(), "permit came back");
    }
}
