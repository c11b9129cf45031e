use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pricesync_core::error::SyncError;

// ---------------------------------------------------------------------------
// Internal sentinel for explicit 404 errors
// ---------------------------------------------------------------------------

/// Carries an explicit HTTP 404 through the `anyhow::Error` chain for
/// lookups that miss without a matching `SyncError` variant.
#[derive(Debug)]
struct NotFoundError(String);

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NotFoundError {}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// 400 Bad Request with the given message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(SyncError::InvalidNotification(msg.into()).into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self(NotFoundError(msg.into()).into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(n) = self.0.downcast_ref::<NotFoundError>() {
            let body = serde_json::json!({ "error": n.0.clone() });
            return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
        }

        let status = if let Some(e) = self.0.downcast_ref::<SyncError>() {
            match e {
                SyncError::LineNotFound(_) | SyncError::ItemNotFound(_) => StatusCode::NOT_FOUND,
                SyncError::InvalidNotification(_) | SyncError::InvalidConfig(_) => {
                    StatusCode::BAD_REQUEST
                }
                SyncError::Transfer(_) => StatusCode::BAD_GATEWAY,
                SyncError::Parse { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                SyncError::Store(_)
                | SyncError::Cache(_)
                | SyncError::Notify(_)
                | SyncError::Sqlite(_)
                | SyncError::Io(_)
                | SyncError::Yaml(_)
                | SyncError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            }
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
