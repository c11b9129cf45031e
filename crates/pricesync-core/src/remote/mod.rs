//! Remote catalog fetcher.
//!
//! Resolves the deterministic remote path of an item and retrieves its bytes
//! through a pooled connection. Every fetch returns its connection to the
//! pool (found / not found) or discards it (any error) before returning.

pub mod http;
pub mod mirror;

use std::path::{Component, Path};
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pool::ConnectionPool;
use crate::types::{CatalogItem, SupplierLine};

pub use http::HttpConnector;
pub use mirror::MirrorConnector;

// ---------------------------------------------------------------------------
// TransferError
// ---------------------------------------------------------------------------

/// Connection or transfer failure. A missing file is not an error; see
/// [`FetchOutcome::NotFound`].
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("timed out after {0:?} waiting for a remote connection")]
    AcquireTimeout(Duration),

    #[error("fetch of '{path}' timed out after {timeout:?}")]
    FetchTimeout { path: String, timeout: Duration },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("remote returned status {status} for '{path}'")]
    Status { status: u16, path: String },

    #[error("transfer I/O error: {0}")]
    Io(String),
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Remote path for an item: `{YYYY}/{MM}/{line}/{ship}/{item}.json`.
///
/// Year and month come from the item's effective (sailing) date. There is
/// exactly one candidate path per item.
pub fn remote_path(line_code: &str, ship_code: &str, item_code: &str, as_of: NaiveDate) -> String {
    format!(
        "{:04}/{:02}/{}/{}/{}.json",
        as_of.year(),
        as_of.month(),
        line_code,
        ship_code,
        item_code
    )
}

/// Split a remote path into its segments, refusing anything that could step
/// outside the remote root: empty segments, `.`, `..`, absolute parts or
/// embedded separators. Both transports resolve paths through this.
pub(crate) fn path_segments(path: &str) -> Result<Vec<&str>, TransferError> {
    let trimmed = path.trim_start_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();
    let confined = !trimmed.is_empty()
        && segments.iter().all(|seg| {
            let mut parts = Path::new(seg).components();
            matches!(parts.next(), Some(Component::Normal(p)) if p == *seg)
                && parts.next().is_none()
                && !seg.contains('\\')
        });
    if !confined {
        return Err(TransferError::Io(format!("refusing path '{path}'")));
    }
    Ok(segments)
}

// ---------------------------------------------------------------------------
// CatalogFetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(Vec<u8>),
    NotFound { path: String },
}

#[derive(Clone)]
pub struct CatalogFetcher {
    pool: ConnectionPool,
    fetch_timeout: Duration,
}

impl CatalogFetcher {
    pub fn new(pool: ConnectionPool, fetch_timeout: Duration) -> Self {
        Self {
            pool,
            fetch_timeout,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Fetch the payload of `item` on `line` through a fresh pool checkout.
    pub async fn fetch(
        &self,
        line: &SupplierLine,
        item: &CatalogItem,
    ) -> Result<FetchOutcome, TransferError> {
        let path = remote_path(&line.remote_code, &item.ship_code, &item.code, item.sailing_date);
        let mut conn = self.pool.acquire().await?;

        let result = tokio::time::timeout(self.fetch_timeout, conn.retrieve(&path)).await;
        match result {
            Ok(Ok(Some(bytes))) => {
                conn.release();
                debug!(path = %path, bytes = bytes.len(), "fetched remote item");
                Ok(FetchOutcome::Found(bytes))
            }
            Ok(Ok(None)) => {
                conn.release();
                debug!(path = %path, "remote item not present");
                Ok(FetchOutcome::NotFound { path })
            }
            Ok(Err(e)) => {
                conn.discard();
                warn!(path = %path, error = %e, "remote transfer failed");
                Err(e)
            }
            Err(_) => {
                // The connection may still be mid-transfer.
                conn.discard();
                warn!(path = %path, timeout = ?self.fetch_timeout, "remote fetch timed out");
                Err(TransferError::FetchTimeout {
                    path,
                    timeout: self.fetch_timeout,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
