use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::Serialize;

use pricesync_core::orchestrator::{new_correlation_id, WebhookNotification};

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub received: bool,
    pub correlation_id: String,
    pub scheduled: bool,
    pub message: String,
}

/// POST /api/webhooks/catalog: acknowledge a catalog-change notification.
///
/// Always answers 200 before any work starts. Invalid bodies are
/// acknowledged with `scheduled: false`; valid ones start a background run
/// whose outcome is reported through the notifier, never to the sender.
pub async fn catalog_webhook(State(app): State<AppState>, body: Bytes) -> Json<WebhookAck> {
    let correlation_id = new_correlation_id();
    let request = WebhookNotification::from_slice(&body)
        .and_then(|n| n.into_request(correlation_id.clone()));

    match request {
        Ok(req) => {
            tracing::info!(
                line = req.line_id,
                event = %req.event_kind,
                correlation_id = %correlation_id,
                "catalog notification accepted"
            );
            let message = format!("sync scheduled for line {}", req.line_id);
            // Detached: the run releases its own lock and reports on its own.
            drop(app.services.orchestrator.spawn_run(req));
            Json(WebhookAck {
                received: true,
                correlation_id,
                scheduled: true,
                message,
            })
        }
        Err(e) => {
            tracing::warn!(
                correlation_id = %correlation_id,
                bytes = body.len(),
                error = %e,
                "catalog notification ignored"
            );
            Json(WebhookAck {
                received: true,
                correlation_id,
                scheduled: false,
                message: e.to_string(),
            })
        }
    }
}
