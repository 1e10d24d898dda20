use std::sync::Arc;

use axum::Router;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

use vigil_core::{
    CircuitBreakerConfig, CircuitBreakerRegistry, InMemoryScoreStore, MetricsCollector,
    PluginScoreModel, ScoreConfig,
};
use vigil_db::Database;
use vigil_server::backend::ScoreBackend;
use vigil_server::routes;
use vigil_server::state::AppState;

pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";

/// Router plus the shared state it serves, so tests can feed the breaker,
/// metrics and score model directly.
pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
}

fn build(backend: ScoreBackend, admin_token: Option<&str>) -> TestApp {
    let state = Arc::new(AppState {
        metrics: Arc::new(MetricsCollector::new()),
        breaker: CircuitBreakerRegistry::new(CircuitBreakerConfig::default()),
        scores: PluginScoreModel::new(backend, ScoreConfig::default()),
        admin_token: admin_token.map(str::to_string),
    });
    TestApp {
        router: routes::router(state.clone()),
        state,
    }
}

/// App backed by the in-memory score store, with admin endpoints enabled.
pub fn setup_test_app() -> TestApp {
    build(
        ScoreBackend::Memory(InMemoryScoreStore::new()),
        Some(TEST_ADMIN_TOKEN),
    )
}

/// App with no admin token configured.
pub fn setup_test_app_no_auth() -> TestApp {
    build(ScoreBackend::Memory(InMemoryScoreStore::new()), None)
}

/// Spin up a PostgreSQL container and return an app backed by it.
///
/// The container handle must stay in scope for the test duration.
pub async fn setup_postgres_app() -> (TestApp, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "vigil_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let url = format!("postgresql://postgres:postgres@{host}:{port}/vigil_test");

    let pool = retry_connect(&url).await;
    let db = Database::from_pool(pool);
    db.migrate().await.expect("Failed to run migrations");

    (
        build(ScoreBackend::Postgres(db.score_repo()), Some(TEST_ADMIN_TOKEN)),
        container,
    )
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
