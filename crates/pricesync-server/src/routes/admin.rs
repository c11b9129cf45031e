use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use pricesync_core::service::ServiceStatus;
use pricesync_core::types::{LockKey, SyncLock, PRICING_SYNC};

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/admin/locks: every lock row, any status.
pub async fn list_locks(State(app): State<AppState>) -> Result<Json<Vec<SyncLock>>, AppError> {
    Ok(Json(app.services.locks.list().await?))
}

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    #[serde(default)]
    purpose: Option<String>,
}

/// DELETE /api/admin/locks/{line}: operator force-clear back to `idle`.
pub async fn clear_lock(
    State(app): State<AppState>,
    Path(line_id): Path<i64>,
    Query(query): Query<ClearQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let purpose = query.purpose.unwrap_or_else(|| PRICING_SYNC.to_string());
    let key = LockKey::new(line_id, purpose);
    if !app.services.locks.force_clear(&key).await? {
        return Err(AppError::not_found(format!("no lock for {key}")));
    }
    Ok(Json(serde_json::json!({
        "cleared": true,
        "lineId": key.line_id,
        "purpose": key.purpose,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimBody {
    #[serde(default)]
    older_than_secs: Option<u64>,
}

/// POST /api/admin/locks/reclaim: run one stale-lock sweep now.
///
/// The body is optional; without `olderThanSecs` the configured staleness
/// threshold applies.
pub async fn reclaim_locks(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let parsed: ReclaimBody = if body.iter().all(u8::is_ascii_whitespace) {
        ReclaimBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::bad_request(e.to_string()))?
    };
    let threshold = match parsed.older_than_secs {
        Some(0) => return Err(AppError::bad_request("olderThanSecs must be positive")),
        Some(secs) => Duration::from_secs(secs),
        None => app.services.reclaimer.threshold(),
    };
    let reclaimed = app.services.reclaimer.sweep(threshold).await?;
    Ok(Json(serde_json::json!({
        "reclaimed": reclaimed,
        "thresholdSecs": threshold.as_secs(),
    })))
}

/// GET /api/admin/status: pool, transport, notifier and in-flight runs.
pub async fn status(State(app): State<AppState>) -> Json<ServiceStatus> {
    Json(app.services.status())
}
