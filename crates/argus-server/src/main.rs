use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use argus_core::EngineConfig;
use argus_db::{Database, DatabaseConfig};
use argus_server::routes;
use argus_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("argus=info".parse()?))
        .with_target(false)
        .init();

    let api_key = std::env::var("ARGUS_SERVER_API_KEY").ok();
    if api_key.is_none() {
        tracing::warn!("ARGUS_SERVER_API_KEY not set; /v1 endpoints will answer 403");
    }
    let port = std::env::var("ARGUS_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let replenish_ms = env_or("ARGUS_SERVER_RATE_REPLENISH_MS", 100u64)?;
    let burst = env_or("ARGUS_SERVER_RATE_BURST", 20u32)?;
    let addr = format!("0.0.0.0:{port}");

    let config = EngineConfig::from_env()?;
    let db = Database::connect(&DatabaseConfig::from_env()?).await?;
    db.migrate().await?;
    let tasks = db.task_repo(config.store);

    let state = Arc::new(AppState { db, tasks, api_key });

    let router = routes::router(state).layer(RequestBodyLimitLayer::new(64 * 1024));
    let app = routes::with_rate_limit(router, Duration::from_millis(replenish_ms), burst)?
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}={raw} is invalid: {e}")),
        Err(_) => Ok(default),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install CTRL+C handler: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
