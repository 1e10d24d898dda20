//! In-process counters for diagnostics.
//!
//! Tracks per-source search throughput and health-probe outcomes since
//! process start, and renders them together with the circuit breaker state
//! as a [`DiagnosticsReport`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot};
use crate::models::ProbeResult;

/// Atomic counter for thread-safe incrementing
#[derive(Debug, Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn inc(&self) {
        self.add(1);
    }

    fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SourceStats {
    searches: u64,
    successes: u64,
    failures: u64,
    total_results: u64,
    total_duration_ns: u64,
}

#[derive(Debug, Default)]
struct ProbeStats {
    runs: Counter,
    total_urls: Counter,
    alive: Counter,
    dead: Counter,
    cf_blocked: Counter,
    total_duration_ns: Counter,
}

/// Per-source search summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub searches: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_results: u64,
    pub avg_duration_ms: f64,
}

/// Health-probe summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub runs: u64,
    pub total_urls: u64,
    pub alive: u64,
    pub dead: u64,
    pub cf_blocked: u64,
    /// Mean wall-clock time of one probe run.
    pub avg_duration_ms: f64,
}

/// The diagnostics document served to operators.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub uptime_seconds: f64,
    pub plugins: BTreeMap<String, SourceReport>,
    pub probe: ProbeReport,
    pub circuit_breaker: BTreeMap<String, CircuitSnapshot>,
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

fn avg_ms(total_ns: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total_ns as f64 / count as f64 / 1_000_000.0
    }
}

/// Process-wide metrics. Share it behind an `Arc`.
#[derive(Debug)]
pub struct MetricsCollector {
    sources: Mutex<HashMap<String, SourceStats>>,
    probe: ProbeStats,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            probe: ProbeStats::default(),
            start_time: Instant::now(),
        }
    }

    fn lock_sources(&self) -> MutexGuard<'_, HashMap<String, SourceStats>> {
        self.sources.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned metrics mutex");
            poisoned.into_inner()
        })
    }

    /// Record one search against `source`.
    pub fn record_search(&self, source: &str, success: bool, results: u64, duration: Duration) {
        let mut sources = self.lock_sources();
        let stats = sources.entry(source.to_string()).or_default();
        stats.searches += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.total_results = stats.total_results.saturating_add(results);
        stats.total_duration_ns = stats.total_duration_ns.saturating_add(nanos(duration));
    }

    /// Record one probe run that checked `results.len()` URLs in `elapsed`.
    ///
    /// Challenge-walled targets count as `cf_blocked`, not `dead`.
    pub fn record_probe_run(&self, results: &[ProbeResult], elapsed: Duration) {
        self.probe.runs.inc();
        self.probe.total_urls.add(results.len() as u64);
        self.probe.total_duration_ns.add(nanos(elapsed));
        for result in results {
            if result.ok {
                self.probe.alive.inc();
            } else if result.captcha_detected {
                self.probe.cf_blocked.inc();
            } else {
                self.probe.dead.inc();
            }
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn probe_report(&self) -> ProbeReport {
        let runs = self.probe.runs.get();
        ProbeReport {
            runs,
            total_urls: self.probe.total_urls.get(),
            alive: self.probe.alive.get(),
            dead: self.probe.dead.get(),
            cf_blocked: self.probe.cf_blocked.get(),
            avg_duration_ms: avg_ms(self.probe.total_duration_ns.get(), runs),
        }
    }

    pub fn source_reports(&self) -> BTreeMap<String, SourceReport> {
        self.lock_sources()
            .iter()
            .map(|(source, stats)| {
                (
                    source.clone(),
                    SourceReport {
                        searches: stats.searches,
                        successes: stats.successes,
                        failures: stats.failures,
                        total_results: stats.total_results,
                        avg_duration_ms: avg_ms(stats.total_duration_ns, stats.searches),
                    },
                )
            })
            .collect()
    }

    /// Full diagnostics document, including every tracked circuit.
    pub fn report(&self, breaker: &CircuitBreakerRegistry) -> DiagnosticsReport {
        DiagnosticsReport {
            uptime_seconds: self.uptime().as_secs_f64(),
            plugins: self.source_reports(),
            probe: self.probe_report(),
            circuit_breaker: breaker.snapshot(),
        }
    }
}
