use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// One request to sync a supplier line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRequest {
    pub line_id: i64,
    /// Used when a payload names no currency.
    pub currency: Option<String>,
    pub correlation_id: String,
    pub event_kind: String,
}

impl SyncRequest {
    /// Manual request, as issued by the CLI.
    pub fn manual(line_id: i64) -> Self {
        Self {
            line_id,
            currency: None,
            correlation_id: new_correlation_id(),
            event_kind: "manual".to_string(),
        }
    }
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Inbound notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LineIdentifier {
    Number(i64),
    Text(String),
}

/// Body of an inbound catalog-change notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    #[serde(alias = "lineid")]
    pub line_identifier: Option<LineIdentifier>,
    #[serde(alias = "event", default)]
    pub event_kind: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl WebhookNotification {
    /// Parse raw bytes. Malformed JSON is an `InvalidNotification`.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| SyncError::InvalidNotification(e.to_string()))
    }

    pub fn line_id(&self) -> Result<i64> {
        let id = match &self.line_identifier {
            None => {
                return Err(SyncError::InvalidNotification(
                    "lineIdentifier is required".into(),
                ))
            }
            Some(LineIdentifier::Number(n)) => *n,
            Some(LineIdentifier::Text(s)) => s.trim().parse::<i64>().map_err(|_| {
                SyncError::InvalidNotification(format!("lineIdentifier '{s}' is not numeric"))
            })?,
        };
        if id <= 0 {
            return Err(SyncError::InvalidNotification(format!(
                "lineIdentifier must be positive, got {id}"
            )));
        }
        Ok(id)
    }

    /// Validate and turn into a request under `correlation_id`.
    pub fn into_request(self, correlation_id: String) -> Result<SyncRequest> {
        let line_id = self.line_id()?;
        let event_kind = self
            .event_kind
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| SyncError::InvalidNotification("eventKind is required".into()))?;
        if self.timestamp.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return Err(SyncError::InvalidNotification("timestamp is required".into()));
        }
        Ok(SyncRequest {
            line_id,
            currency: self
                .currency
                .map(|c| c.trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty()),
            correlation_id,
            event_kind,
        })
    }
}
