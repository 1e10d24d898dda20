use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vigil_client::ReqwestTransport;
use vigil_core::models::ProbeResult;
use vigil_core::monitor::{MonitorEvent, MonitorReporter};
use vigil_core::{
    CircuitBreakerRegistry, DomainRateLimiter, HealthMonitor, HealthProber, InMemoryScoreStore,
    MetricsCollector, MonitorConfig, PluginScoreModel, ResilienceConfig, RetryTransport,
    ScoreStore, TracingMonitorReporter, parse_sources,
};
use vigil_db::{Database, DatabaseConfig, ScoreRepository};

#[derive(Parser)]
#[command(
    name = "vigil",
    version,
    about = "Circuit breaking, rate limiting and health scoring for scrape sources"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every source once and print the results and diagnostics
    Probe {
        /// Source to probe, as name=url (repeatable)
        #[arg(short, long = "source", required = true)]
        sources: Vec<String>,

        /// Persist scores to the database (requires DATABASE_URL)
        #[arg(long, default_value_t = false)]
        save: bool,
    },

    /// Probe sources on an interval until Ctrl-C
    Monitor {
        /// Source to probe, as name=url (repeatable)
        #[arg(short, long = "source", required = true)]
        sources: Vec<String>,

        /// Seconds between probe cycles
        #[arg(
            short,
            long,
            env = "VIGIL_PROBE_INTERVAL_SECONDS",
            default_value_t = 60
        )]
        interval: u64,
    },

    /// List persisted score snapshots
    Scores {
        /// Only show snapshots of this source
        #[arg(short, long)]
        source: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vigil=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ResilienceConfig::from_env().context("Invalid resilience configuration")?;

    match cli.command {
        Commands::Probe { sources, save } => {
            let sources = parse_source_args(&sources)?;
            if save {
                let repo = connect_db().await?;
                cmd_probe(sources, &config, repo).await?;
            } else {
                cmd_probe(sources, &config, InMemoryScoreStore::new()).await?;
            }
        }
        Commands::Monitor { sources, interval } => {
            let sources = parse_source_args(&sources)?;
            let interval = Duration::from_secs(interval.max(1));
            if std::env::var("DATABASE_URL").is_ok() {
                let repo = connect_db().await?;
                cmd_monitor(sources, &config, interval, repo).await?;
            } else {
                tracing::warn!("DATABASE_URL not set, scores are kept in memory only");
                cmd_monitor(sources, &config, interval, InMemoryScoreStore::new()).await?;
            }
        }
        Commands::Scores { source } => {
            let repo = connect_db().await?;
            cmd_scores(source.as_deref(), &repo).await?;
        }
    }

    Ok(())
}

fn parse_source_args(args: &[String]) -> Result<HashMap<String, String>> {
    Ok(parse_sources(&args.join(","))?)
}

/// Connect to PostgreSQL using DATABASE_URL and run migrations.
async fn connect_db() -> Result<ScoreRepository> {
    let config = DatabaseConfig::from_env()
        .context("DATABASE_URL not set. Required for --save or the scores command.")?;

    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;

    Ok(db.score_repo())
}

/// Everything a probe run needs, wired from one configuration.
struct Components<S: ScoreStore> {
    monitor: HealthMonitor<RetryTransport<ReqwestTransport>, S>,
    metrics: Arc<MetricsCollector>,
    breaker: CircuitBreakerRegistry,
}

fn build<S: ScoreStore>(
    sources: HashMap<String, String>,
    config: &ResilienceConfig,
    monitor_config: MonitorConfig,
    store: S,
) -> Result<Components<S>> {
    let metrics = Arc::new(MetricsCollector::new());
    let breaker = CircuitBreakerRegistry::new(config.breaker.clone());
    let limiter = DomainRateLimiter::new(config.rate_limit.clone());
    let scores = PluginScoreModel::new(store, config.score.clone());

    let transport =
        ReqwestTransport::with_timeout(config.probe.timeout).context("Failed to create client")?;
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
        scores,
        monitor_config,
    );

    Ok(Components {
        monitor,
        metrics,
        breaker,
    })
}

async fn cmd_probe<S: ScoreStore>(
    sources: HashMap<String, String>,
    config: &ResilienceConfig,
    store: S,
) -> Result<()> {
    // Every source is due on a one-shot run.
    let monitor_config = MonitorConfig {
        probe_every: Duration::ZERO,
        ..MonitorConfig::default()
    };
    let components = build(sources, config, monitor_config, store)?;

    let summary = components.monitor.run_cycle(&PrintReporter).await;
    tracing::info!(
        probed = summary.probed,
        alive = summary.alive,
        blocked = summary.blocked,
        "Probe run complete"
    );

    let report = components.metrics.report(&components.breaker);
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

async fn cmd_monitor<S: ScoreStore + 'static>(
    sources: HashMap<String, String>,
    config: &ResilienceConfig,
    interval: Duration,
    store: S,
) -> Result<()> {
    let monitor_config = MonitorConfig {
        interval,
        probe_every: interval,
        ..MonitorConfig::default()
    };
    let components = build(sources, config, monitor_config, store)?;

    let cancel_token = CancellationToken::new();
    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, stopping monitor...");
        }
        ctrl_c_token.cancel();
    });

    components
        .monitor
        .run(cancel_token, &TracingMonitorReporter)
        .await?;

    let report = components.metrics.report(&components.breaker);
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

async fn cmd_scores(source: Option<&str>, repo: &ScoreRepository) -> Result<()> {
    let mut snapshots = repo.list(source).await?;

    if snapshots.is_empty() {
        match source {
            Some(source) => println!("No scores recorded for source={source}"),
            None => println!("No scores recorded"),
        }
        return Ok(());
    }

    snapshots.sort_by(|a, b| {
        b.ranking_value()
            .total_cmp(&a.ranking_value())
            .then_with(|| a.key().cmp(&b.key()))
    });

    println!(
        "{:<24} {:>8} {:<8} {:>7} {:>7} {:>7} {:>6} {:>8}",
        "SOURCE", "CATEGORY", "BUCKET", "HEALTH", "SEARCH", "FINAL", "CONF", "SAMPLES"
    );
    for s in &snapshots {
        println!(
            "{:<24} {:>8} {:<8} {:>7.3} {:>7.3} {:>7.3} {:>6.2} {:>8}",
            s.source,
            s.category,
            s.bucket.as_str(),
            s.health.value,
            s.search.value,
            s.final_score,
            s.confidence,
            s.total_samples(),
        );
    }

    println!("\nTotal: {} snapshots", snapshots.len());

    Ok(())
}

/// Prints one line per probed source to stdout.
struct PrintReporter;

impl MonitorReporter for PrintReporter {
    fn report(&self, event: MonitorEvent<'_>) {
        match event {
            MonitorEvent::SourceProbed { source, result } => {
                println!("{source:<24} {}", describe(result));
            }
            MonitorEvent::SourceSkipped {
                source,
                retry_after,
            } => {
                let wait = retry_after.map_or(0.0, |d| d.as_secs_f64());
                println!("{source:<24} skipped (circuit open, retry in {wait:.0}s)");
            }
            _ => {}
        }
    }
}

fn describe(result: &ProbeResult) -> String {
    let status = result
        .http_status
        .map_or_else(|| "-".to_string(), |s| s.to_string());
    let verdict = if result.ok {
        "alive".to_string()
    } else if result.captcha_detected {
        "blocked".to_string()
    } else {
        result
            .error_kind
            .map_or_else(|| "dead".to_string(), |k| format!("dead ({k})"))
    };
    format!("{verdict:<20} status={status:<4} {:.0}ms", result.duration_ms)
}
