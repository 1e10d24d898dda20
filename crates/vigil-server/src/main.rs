use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use vigil_client::ReqwestTransport;
use vigil_core::{
    CircuitBreakerRegistry, DomainRateLimiter, HealthMonitor, HealthProber, InMemoryScoreStore,
    MetricsCollector, MonitorConfig, PluginScoreModel, ResilienceConfig, TracingMonitorReporter,
    parse_sources,
};
use vigil_db::{Database, DatabaseConfig};
use vigil_server::backend::ScoreBackend;
use vigil_server::routes;
use vigil_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vigil=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ResilienceConfig::from_env()?;
    let sources = parse_sources(&std::env::var("VIGIL_SOURCES").unwrap_or_default())?;
    let port = std::env::var("VIGIL_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let admin_token = std::env::var("VIGIL_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.is_empty());
    if admin_token.is_none() {
        tracing::warn!("VIGIL_ADMIN_TOKEN not set, admin endpoints are disabled");
    }

    let mut monitor_config = MonitorConfig::default();
    if let Ok(raw) = std::env::var("VIGIL_PROBE_INTERVAL_SECONDS") {
        let secs: u64 = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid VIGIL_PROBE_INTERVAL_SECONDS '{raw}'"))?;
        monitor_config.interval = Duration::from_secs(secs.max(1));
        monitor_config.probe_every = monitor_config.interval;
    }

    let backend = if std::env::var("DATABASE_URL").is_ok() {
        let db = Database::connect(&DatabaseConfig::from_env()?).await?;
        db.migrate().await?;
        ScoreBackend::Postgres(db.score_repo())
    } else {
        tracing::warn!("DATABASE_URL not set, scores are kept in memory only");
        ScoreBackend::Memory(InMemoryScoreStore::new())
    };

    let metrics = Arc::new(MetricsCollector::new());
    let breaker = CircuitBreakerRegistry::new(config.breaker.clone());
    let limiter = DomainRateLimiter::new(config.rate_limit.clone());
    let scores = PluginScoreModel::new(backend, config.score.clone());

    let transport = ReqwestTransport::with_timeout(config.probe.timeout)?;
    let prober = HealthProber::with_retry(
        transport,
        limiter.clone(),
        config.probe.clone(),
        config.retry.clone(),
    );
    let monitor = HealthMonitor::new(
        sources,
        prober,
        breaker.clone(),
        limiter,
        metrics.clone(),
        scores.clone(),
        monitor_config,
    );

    let cancel_token = CancellationToken::new();
    let monitor_task = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move { monitor.run(cancel_token, &TracingMonitorReporter).await })
    };

    let state = Arc::new(AppState {
        metrics,
        breaker,
        scores,
        admin_token,
    });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel_token.cancel();
    monitor_task.await??;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for CTRL+C");
    }
    tracing::info!("Shutdown signal received");
}
