use argus_db::{Database, TaskRepository};

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub db: Database,
    pub tasks: TaskRepository,
    /// API key for the `/v1` endpoints (None = `/v1` disabled).
    pub api_key: Option<String>,
}
