use thiserror::Error;

use crate::remote::TransferError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("supplier line not found: {0}")]
    LineNotFound(i64),

    #[error("catalog item not found: {0}")]
    ItemNotFound(i64),

    #[error("invalid notification: {0}")]
    InvalidNotification(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to parse payload for item {item} ({bytes} bytes): {reason}")]
    Parse {
        item: String,
        bytes: usize,
        reason: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("notification delivery failed: {0}")]
    Notify(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
