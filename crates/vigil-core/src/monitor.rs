use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::AppError;
use crate::metrics::MetricsCollector;
use crate::models::ProbeResult;
use crate::probe::HealthProber;
use crate::rate_limiter::DomainRateLimiter;
use crate::score::PluginScoreModel;
use crate::traits::{HttpTransport, ScoreStore};

/// Probe type under which health probes are bookkept in the score store.
pub const HEALTH_PROBE: &str = "health";

/// Configuration for the health monitor loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Pause between cycles.
    pub interval: Duration,
    /// Minimum time between two probes of the same source, across restarts.
    pub probe_every: Duration,
    /// Closed circuits and token buckets unused this long are evicted.
    pub idle_ttl: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            probe_every: Duration::from_secs(300),
            idle_ttl: Duration::from_secs(3600),
        }
    }
}

/// Events emitted by the monitor for monitoring/logging.
#[derive(Debug, Clone)]
pub enum MonitorEvent<'a> {
    Started {
        sources: usize,
    },
    CycleStarted {
        cycle_id: Uuid,
        due: usize,
    },
    SourceSkipped {
        source: &'a str,
        retry_after: Option<Duration>,
    },
    SourceProbed {
        source: &'a str,
        result: &'a ProbeResult,
    },
    CycleCompleted {
        cycle_id: Uuid,
        summary: &'a CycleSummary,
    },
    Stopped,
}

/// Trait for receiving monitor events (decoupled logging).
pub trait MonitorReporter: Send + Sync {
    fn report(&self, event: MonitorEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitorReporter;

impl MonitorReporter for TracingMonitorReporter {
    fn report(&self, event: MonitorEvent<'_>) {
        match event {
            MonitorEvent::Started { sources } => {
                tracing::info!(%sources, "Health monitor started");
            }
            MonitorEvent::CycleStarted { cycle_id, due } => {
                tracing::debug!(%cycle_id, %due, "Probe cycle started");
            }
            MonitorEvent::SourceSkipped {
                source,
                retry_after,
            } => {
                tracing::debug!(
                    %source,
                    retry_after_secs = ?retry_after.map(|d| d.as_secs()),
                    "Circuit open, skipping probe"
                );
            }
            MonitorEvent::SourceProbed { source, result } => {
                if result.ok {
                    tracing::debug!(%source, duration_ms = result.duration_ms, "Source alive");
                } else {
                    tracing::warn!(
                        %source,
                        error_kind = ?result.error_kind,
                        status = ?result.http_status,
                        "Source probe failed"
                    );
                }
            }
            MonitorEvent::CycleCompleted { cycle_id, summary } => {
                tracing::info!(
                    %cycle_id,
                    probed = summary.probed,
                    alive = summary.alive,
                    blocked = summary.blocked,
                    skipped = summary.skipped,
                    evicted = summary.evicted,
                    "Probe cycle completed"
                );
            }
            MonitorEvent::Stopped => {
                tracing::info!("Health monitor stopped");
            }
        }
    }
}

/// Outcome counts of one monitor cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub probed: usize,
    pub alive: usize,
    pub blocked: usize,
    /// Sources whose circuit rejected the probe.
    pub skipped: usize,
    /// Idle circuit records and token buckets dropped by the sweep.
    pub evicted: usize,
}

/// Periodically probes every configured source and folds the results into
/// the circuit breaker, metrics and score model.
pub struct HealthMonitor<T, S: ScoreStore> {
    sources: HashMap<String, String>,
    prober: HealthProber<T>,
    breaker: CircuitBreakerRegistry,
    limiter: DomainRateLimiter,
    metrics: Arc<MetricsCollector>,
    scores: PluginScoreModel<S>,
    config: MonitorConfig,
}

impl<T: HttpTransport, S: ScoreStore> HealthMonitor<T, S> {
    pub fn new(
        sources: HashMap<String, String>,
        prober: HealthProber<T>,
        breaker: CircuitBreakerRegistry,
        limiter: DomainRateLimiter,
        metrics: Arc<MetricsCollector>,
        scores: PluginScoreModel<S>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            sources,
            prober,
            breaker,
            limiter,
            metrics,
            scores,
            config,
        }
    }

    /// Run the monitor loop until cancellation.
    pub async fn run<MR: MonitorReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &MR,
    ) -> Result<(), AppError> {
        reporter.report(MonitorEvent::Started {
            sources: self.sources.len(),
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            self.run_cycle(reporter).await;

            tokio::select! {
                () = tokio::time::sleep(self.config.interval) => {}
                () = cancel_token.cancelled() => break,
            }
        }

        reporter.report(MonitorEvent::Stopped);
        Ok(())
    }

    /// Probe every due source once.
    pub async fn run_cycle<MR: MonitorReporter>(&self, reporter: &MR) -> CycleSummary {
        let cycle_id = Uuid::new_v4();
        let now = Utc::now();
        let mut summary = CycleSummary::default();

        let mut due = HashMap::new();
        for (source, url) in &self.sources {
            if self.is_due(source, now).await {
                due.insert(source.clone(), url.clone());
            }
        }
        reporter.report(MonitorEvent::CycleStarted {
            cycle_id,
            due: due.len(),
        });

        // `allow` also claims the half-open trial slot for the probe.
        due.retain(|source, _| {
            let allowed = self.breaker.allow(source);
            if !allowed {
                summary.skipped += 1;
                reporter.report(MonitorEvent::SourceSkipped {
                    source,
                    retry_after: self.breaker.retry_after(source),
                });
            }
            allowed
        });

        if !due.is_empty() {
            let start = Instant::now();
            let results = self
                .prober
                .probe_all(&due, self.prober.config().concurrency)
                .await;
            let elapsed = start.elapsed();

            let mut batch = Vec::with_capacity(results.len());
            for (source, result) in &results {
                if result.ok {
                    summary.alive += 1;
                    self.breaker.record_success(source);
                } else if result.captcha_detected {
                    summary.blocked += 1;
                    self.breaker.record_inconclusive(source);
                } else {
                    self.breaker.record_failure(source);
                }
                self.scores.record_probe(source, result).await;
                self.scores
                    .mark_run(HEALTH_PROBE, source, None, None, result.started_at)
                    .await;
                reporter.report(MonitorEvent::SourceProbed { source, result });
                batch.push(result.clone());
            }
            summary.probed = batch.len();
            self.metrics.record_probe_run(&batch, elapsed);
        }

        summary.evicted = self.breaker.sweep_idle(self.config.idle_ttl)
            + self.limiter.sweep_idle(self.config.idle_ttl).await;

        reporter.report(MonitorEvent::CycleCompleted {
            cycle_id,
            summary: &summary,
        });
        summary
    }

    async fn is_due(&self, source: &str, now: chrono::DateTime<Utc>) -> bool {
        let Some(last) = self.scores.last_run(HEALTH_PROBE, source, None, None).await else {
            return true;
        };
        let every = TimeDelta::from_std(self.config.probe_every).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(last) >= every
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::models::HttpResponse;
    use crate::probe::ProbeConfig;
    use crate::rate_limiter::RateLimitConfig;
    use crate::retry::RetryConfig;
    use crate::score::{ScoreConfig, ScoreKey};
    use crate::testutil::{MockReply, MockTransport, sources};
    use crate::traits::InMemoryScoreStore;

    const ALIVE: &str = "https://alive.example.com/";
    const DEAD: &str = "https://dead.example.net/";
    const WALLED: &str = "https://walled.example.org/";

    #[derive(Default)]
    struct RecordingReporter {
        events: Mutex<Vec<String>>,
    }

    impl MonitorReporter for RecordingReporter {
        fn report(&self, event: MonitorEvent<'_>) {
            let name = match event {
                MonitorEvent::Started { .. } => "started".to_string(),
                MonitorEvent::CycleStarted { due, .. } => format!("cycle:{due}"),
                MonitorEvent::SourceSkipped { source, .. } => format!("skipped:{source}"),
                MonitorEvent::SourceProbed { source, .. } => format!("probed:{source}"),
                MonitorEvent::CycleCompleted { .. } => "completed".to_string(),
                MonitorEvent::Stopped => "stopped".to_string(),
            };
            self.events.lock().unwrap().push(name);
        }
    }

    fn transport() -> MockTransport {
        MockTransport::new()
            .with_status(ALIVE, 200)
            .with_status(DEAD, 404)
            .with_script(
                WALLED,
                vec![MockReply::Respond(
                    HttpResponse::new(503).with_header("Server", "cloudflare"),
                )],
            )
    }

    fn monitor(
        mock: &MockTransport,
        entries: &[(&str, &str)],
        config: MonitorConfig,
    ) -> (HealthMonitor<MockTransport, InMemoryScoreStore>, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        let monitor = HealthMonitor::new(
            sources(entries),
            HealthProber::new(mock.clone(), ProbeConfig::default()),
            CircuitBreakerRegistry::new(CircuitBreakerConfig::default()),
            DomainRateLimiter::new(RateLimitConfig::unlimited()),
            metrics.clone(),
            PluginScoreModel::new(InMemoryScoreStore::new(), ScoreConfig::default()),
            config,
        );
        (monitor, metrics)
    }

    fn always_due() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(10),
            probe_every: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn five_failed_probes_open_the_circuit() {
        let mock = transport();
        let (monitor, metrics) = monitor(&mock, &[("dead", DEAD)], always_due());

        for _ in 0..5 {
            monitor.run_cycle(&TracingMonitorReporter).await;
        }

        let report = serde_json::to_value(metrics.report(&monitor.breaker)).unwrap();
        assert_eq!(
            report["circuit_breaker"]["dead"],
            serde_json::json!({"state": "open", "failures": 5})
        );
        assert_eq!(report["probe"]["dead"], 5);
        assert_eq!(report["probe"]["runs"], 5);

        let summary = monitor.run_cycle(&TracingMonitorReporter).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.probed, 0);
        assert_eq!(mock.call_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_classifies_each_source() {
        let mock = transport();
        let (monitor, metrics) = monitor(
            &mock,
            &[("alive", ALIVE), ("dead", DEAD), ("walled", WALLED)],
            always_due(),
        );
        let reporter = RecordingReporter::default();

        let summary = monitor.run_cycle(&reporter).await;

        assert_eq!(summary.probed, 3);
        assert_eq!(summary.alive, 1);
        assert_eq!(summary.blocked, 1);
        let probe = metrics.probe_report();
        assert_eq!((probe.alive, probe.dead, probe.cf_blocked), (1, 1, 1));
        assert_eq!(monitor.breaker.snapshot()["dead"].failures, 1);
        assert!(!monitor.breaker.snapshot().contains_key("walled"));

        let alive = monitor
            .scores
            .snapshot(&ScoreKey::source_default("alive"))
            .await;
        let walled = monitor
            .scores
            .snapshot(&ScoreKey::source_default("walled"))
            .await;
        let dead = monitor
            .scores
            .snapshot(&ScoreKey::source_default("dead"))
            .await;
        assert!(alive.health.value > walled.health.value);
        assert!(walled.health.value > dead.health.value);

        let events = reporter.events.lock().unwrap();
        assert_eq!(events.first().map(String::as_str), Some("cycle:3"));
        assert_eq!(events.last().map(String::as_str), Some("completed"));
        assert_eq!(events.iter().filter(|e| e.starts_with("probed:")).count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_503_then_200_counts_as_alive() {
        const FLAKY: &str = "https://flaky.example.com/";
        let mock = MockTransport::new().with_script(
            FLAKY,
            vec![
                MockReply::Respond(HttpResponse::new(503)),
                MockReply::Respond(HttpResponse::new(200)),
            ],
        );
        let limiter = DomainRateLimiter::new(RateLimitConfig::unlimited());
        let metrics = Arc::new(MetricsCollector::new());
        let monitor = HealthMonitor::new(
            sources(&[("flaky", FLAKY)]),
            HealthProber::with_retry(
                mock.clone(),
                limiter.clone(),
                ProbeConfig::default(),
                RetryConfig::default(),
            ),
            CircuitBreakerRegistry::new(CircuitBreakerConfig::default()),
            limiter,
            metrics.clone(),
            PluginScoreModel::new(InMemoryScoreStore::new(), ScoreConfig::default()),
            always_due(),
        );

        let summary = monitor.run_cycle(&TracingMonitorReporter).await;

        assert_eq!(summary.alive, 1);
        let probe = metrics.probe_report();
        assert_eq!((probe.alive, probe.dead), (1, 0));
        assert!(!monitor.breaker.snapshot().contains_key("flaky"));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn recently_probed_sources_are_not_due() {
        let mock = transport();
        let (monitor, _) = monitor(&mock, &[("alive", ALIVE)], MonitorConfig::default());

        assert_eq!(monitor.run_cycle(&TracingMonitorReporter).await.probed, 1);
        assert_eq!(monitor.run_cycle(&TracingMonitorReporter).await.probed, 0);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loops_until_cancelled() {
        let mock = transport();
        let (monitor, metrics) = monitor(&mock, &[("alive", ALIVE)], always_due());
        let token = CancellationToken::new();

        let handle = {
            let token = token.clone();
            tokio::spawn(async move {
                let reporter = RecordingReporter::default();
                monitor.run(token, &reporter).await.unwrap();
                reporter.events.into_inner().unwrap()
            })
        };

        tokio::time::sleep(Duration::from_secs(25)).await;
        token.cancel();
        let events = handle.await.unwrap();

        assert_eq!(metrics.probe_report().runs, 3);
        assert_eq!(events.first().map(String::as_str), Some("started"));
        assert_eq!(events.last().map(String::as_str), Some("stopped"));
    }
}
