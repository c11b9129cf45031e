//! Item reconciler: payload → derived prices → one transactional write →
//! post-commit cache invalidation.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::CacheInvalidator;
use crate::catalog;
use crate::db::Db;
use crate::error::SyncError;
use crate::pricing::{parse_payload, payload_digest};
use crate::types::CatalogItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileResult {
    pub status: ReconcileStatus,
    pub error: Option<String>,
    /// False when the payload carried no prices and nothing was written.
    pub written: bool,
}

impl ReconcileResult {
    fn succeeded(written: bool) -> Self {
        Self {
            status: ReconcileStatus::Succeeded,
            error: None,
            written,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ReconcileStatus::Failed,
            error: Some(error.into()),
            written: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReconcileStatus::Succeeded
    }
}

#[derive(Clone)]
pub struct ItemReconciler {
    db: Db,
    cache: Arc<dyn CacheInvalidator>,
}

impl ItemReconciler {
    pub fn new(db: Db, cache: Arc<dyn CacheInvalidator>) -> Self {
        Self { db, cache }
    }

    /// Apply `payload` to `item`. Never returns an error: every failure is
    /// folded into a `Failed` result so the caller's batch keeps going.
    ///
    /// `currency_hint` (usually from the triggering notification) is used
    /// when the payload names no currency; with neither, the stored currency
    /// is left unchanged.
    pub async fn reconcile(
        &self,
        item: &CatalogItem,
        payload: &[u8],
        currency_hint: Option<&str>,
    ) -> ReconcileResult {
        let mut update = match parse_payload(payload) {
            Ok(update) => update,
            Err(reason) => {
                let err = SyncError::Parse {
                    item: item.code.clone(),
                    bytes: payload.len(),
                    reason,
                };
                return ReconcileResult::failed(err.to_string());
            }
        };

        if !update.has_prices() {
            debug!(item = %item.code, "payload carries no prices; nothing to write");
            return ReconcileResult::succeeded(false);
        }

        if update.currency.is_none() {
            update.currency = currency_hint
                .map(|c| c.trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty());
        }

        let digest = payload_digest(payload);
        let item_id = item.id;
        let written = self
            .db
            .call(move |conn| catalog::apply_pricing(conn, item_id, &update, &digest, Utc::now()))
            .await;
        if let Err(e) = written {
            return ReconcileResult::failed(format!("item {}: {e}", item.code));
        }

        self.invalidate(item).await;
        ReconcileResult::succeeded(true)
    }

    async fn invalidate(&self, item: &CatalogItem) {
        let cache = self.cache.clone();
        let item_id = item.id;
        let outcome = tokio::task::spawn_blocking(move || cache.invalidate_item(item_id)).await;
        match outcome {
            Ok(Ok(removed)) => debug!(item = %item.code, removed, "cache invalidated"),
            Ok(Err(e)) => warn!(item = %item.code, error = %e, "cache invalidation failed"),
            Err(e) => warn!(item = %item.code, error = %e, "cache invalidation task failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
