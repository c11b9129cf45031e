use pricesync_core::service::Services;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    /// Guards `/api/admin/*` when set.
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        let admin_token = services
            .config
            .server
            .admin_token
            .clone()
            .filter(|t| !t.trim().is_empty());
        Self {
            services,
            admin_token,
        }
    }
}
