pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{delete, get, post};
use axum::{middleware, Router};
use pricesync_core::service::Services;
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: state::AppState) -> Router {
    let admin = Router::new()
        .route("/api/admin/locks", get(routes::admin::list_locks))
        .route("/api/admin/locks/reclaim", post(routes::admin::reclaim_locks))
        .route("/api/admin/locks/{line}", delete(routes::admin::clear_lock))
        .route("/api/admin/status", get(routes::admin::status))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            auth::admin_auth,
        ));

    Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/webhooks/catalog", post(routes::webhooks::catalog_webhook))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Start the webhook/admin server, the stale-lock reclaimer loop and, when
/// this process owns the cache file, the cache outbox drainer.
pub async fn serve(services: Services, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(services, listener).await
}

/// Same as [`serve`] on a pre-bound listener, so callers can bind port 0
/// and read the port the OS picked.
pub async fn serve_on(services: Services, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let interval = services.config.sync.reclaim_interval();
    let reclaimer = services.reclaimer.clone().spawn(interval);
    let drainer = services
        .drainer
        .clone()
        .map(|d| d.spawn(services.config.sync.cache_drain_interval()));
    let app = build_router(state::AppState::new(services));

    tracing::info!(
        reclaim_interval_secs = interval.as_secs(),
        "pricesync server listening on http://localhost:{actual_port}"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    reclaimer.abort();
    if let Some(drainer) = drainer {
        drainer.abort();
    }
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
