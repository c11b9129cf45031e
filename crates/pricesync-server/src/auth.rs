use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::state::AppState;

/// Pull the presented token from `Authorization: Bearer …` or `x-admin-token`.
fn presented_token(req: &Request) -> Option<&str> {
    let headers = req.headers();
    if let Some(v) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(v.trim());
    }
    headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

/// Gates the admin routes behind the shared admin token.
///
/// With no token configured the middleware is a transparent no-op.
pub async fn admin_auth(State(app): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = app.admin_token.as_deref() else {
        return next.run(req).await;
    };
    if presented_token(&req) == Some(expected) {
        return next.run(req).await;
    }

    tracing::warn!(path = %req.uri().path(), "rejected admin request without valid token");
    Response::builder()
        .status(401)
        .header("Content-Type", "application/json")
        .body(Body::from(r#"{"error":"unauthorized"}"#))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
