use std::sync::Arc;

use axum::Router;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

use argus_core::StoreConfig;
use argus_db::{Database, TaskRepository};
use argus_server::routes;
use argus_server::state::AppState;

pub const TEST_API_KEY: &str = "test-secret-key";

/// Router plus direct handles on the stores, for driving tasks through
/// states the API does not expose.
///
/// The container must outlive the test; dropping it stops Postgres.
pub struct TestApp {
    pub router: Router,
    pub db: Database,
    pub tasks: TaskRepository,
    _container: ContainerAsync<GenericImage>,
}

pub async fn setup_test_app() -> TestApp {
    build_app(Some(TEST_API_KEY.to_string())).await
}

/// App started without `ARGUS_SERVER_API_KEY`.
pub async fn setup_test_app_no_auth() -> TestApp {
    build_app(None).await
}

async fn build_app(api_key: Option<String>) -> TestApp {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "argus_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let url = format!("postgresql://postgres:postgres@{host}:{port}/argus_test");
    let pool = retry_connect(&url).await;

    let db = Database::from_pool(pool);
    db.migrate().await.expect("Failed to run migrations");
    let tasks = db.task_repo(StoreConfig::default());

    let state = Arc::new(AppState {
        db: db.clone(),
        tasks: tasks.clone(),
        api_key,
    });

    TestApp {
        router: routes::router(state),
        db,
        tasks,
        _container: container,
    }
}

async fn retry_connect(url: &str) -> PgPool {
    for _ in 0..30 {
        if let Ok(pool) = PgPoolOptions::new().max_connections(5).connect(url).await {
            return pool;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("Failed to connect to test database");
}
