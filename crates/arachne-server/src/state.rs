use arachne_client::RuleHub;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub hub: RuleHub,
    /// Token protecting plugin management and maintenance (None = those endpoints disabled).
    pub admin_token: Option<String>,
}
