//! Per-source circuit breaking.
//!
//! Every source (plugin) gets its own lazily created record. Consecutive
//! failures are counted rather than windowed: scrape failures from one site
//! arrive in correlated bursts (site down, ban, layout break).
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[cooldown]--> HALF_OPEN (one trial)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <---------------------------[success]----------------------------+
//! ```
//!
//! A success in any state removes the record, which is indistinguishable
//! from a fresh Closed circuit.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::AppError;

/// Current state of a source's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Cooldown elapsed - a single trial request may pass.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Time to wait before an open circuit lets a trial request through.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_touched: Instant,
}

impl CircuitRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            last_touched: Instant::now(),
        }
    }

    fn remaining_cooldown(&self, cooldown: Duration) -> Duration {
        self.opened_at
            .map(|t| cooldown.saturating_sub(t.elapsed()))
            .unwrap_or(cooldown)
    }
}

/// Point-in-time view of one source's circuit, as exposed in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: u32,
}

/// Thread-safe registry of circuits keyed by source name.
///
/// Get-or-create and every state transition happen under one lock, so two
/// tasks racing on the same source never observe diverging records.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    records: Arc<Mutex<HashMap<String, CircuitRecord>>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Acquires the records lock, recovering from poison if necessary.
    fn lock_records(&self) -> MutexGuard<'_, HashMap<String, CircuitRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned circuit breaker mutex");
            poisoned.into_inner()
        })
    }

    /// Returns true if a call to `source` may proceed.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and
    /// admits exactly one trial; further calls are rejected until that
    /// trial's outcome is recorded.
    pub fn allow(&self, source: &str) -> bool {
        let mut records = self.lock_records();
        let Some(record) = records.get_mut(source) else {
            return true;
        };
        record.last_touched = Instant::now();
        self.maybe_transition_to_half_open(source, record);

        match record.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if record.trial_in_flight {
                    false
                } else {
                    record.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self, source: &str) {
        let mut records = self.lock_records();
        if let Some(record) = records.remove(source)
            && record.state != CircuitState::Closed
        {
            tracing::info!(
                source = %source,
                from = %record.state,
                "Circuit closing after successful call"
            );
        }
    }

    pub fn record_failure(&self, source: &str) {
        let mut records = self.lock_records();
        let record = records
            .entry(source.to_string())
            .or_insert_with(CircuitRecord::new);
        record.last_touched = Instant::now();
        self.maybe_transition_to_half_open(source, record);
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);

        match record.state {
            CircuitState::Closed => {
                if record.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        source = %source,
                        failures = record.consecutive_failures,
                        "Circuit opening after {} consecutive failures",
                        record.consecutive_failures
                    );
                    record.state = CircuitState::Open;
                    record.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    source = %source,
                    "Circuit trial failed, returning to open state"
                );
                record.state = CircuitState::Open;
                record.opened_at = Some(Instant::now());
                record.trial_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    /// Frees the half-open trial slot without changing state.
    ///
    /// Used for outcomes (anti-bot challenges, caller-side errors) that say
    /// nothing about whether the source recovered.
    pub fn record_inconclusive(&self, source: &str) {
        let mut records = self.lock_records();
        if let Some(record) = records.get_mut(source) {
            record.last_touched = Instant::now();
            if record.state == CircuitState::HalfOpen {
                record.trial_in_flight = false;
            }
        }
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self, source: &str) -> CircuitState {
        let mut records = self.lock_records();
        match records.get_mut(source) {
            Some(record) => {
                self.maybe_transition_to_half_open(source, record);
                record.state
            }
            None => CircuitState::Closed,
        }
    }

    /// Remaining cooldown for an open circuit, `None` otherwise.
    pub fn retry_after(&self, source: &str) -> Option<Duration> {
        let records = self.lock_records();
        records
            .get(source)
            .filter(|r| r.state == CircuitState::Open)
            .map(|r| r.remaining_cooldown(self.config.cooldown))
    }

    pub fn reset(&self, source: &str) {
        let mut records = self.lock_records();
        if records.remove(source).is_some() {
            tracing::info!(source = %source, "Circuit manually reset");
        }
    }

    /// State and failure count of every tracked source, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, CircuitSnapshot> {
        let mut records = self.lock_records();
        records
            .iter_mut()
            .map(|(source, record)| {
                self.maybe_transition_to_half_open(source, record);
                (
                    source.clone(),
                    CircuitSnapshot {
                        state: record.state,
                        failures: record.consecutive_failures,
                    },
                )
            })
            .collect()
    }

    /// Drops closed records untouched for at least `max_idle`.
    ///
    /// Open and half-open records are kept regardless of age. Returns the
    /// number of evicted records.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let mut records = self.lock_records();
        let before = records.len();
        records.retain(|_, r| {
            r.state != CircuitState::Closed || r.last_touched.elapsed() < max_idle
        });
        let evicted = before - records.len();
        if evicted > 0 {
            tracing::debug!(evicted, "Swept idle circuit records");
        }
        evicted
    }

    /// Executes the given operation through the source's circuit.
    ///
    /// - Rejected: returns `AppError::CircuitOpen` without running `operation`
    /// - `Ok`: records a success
    /// - `Err` that trips the circuit: records a failure
    /// - any other `Err`: releases a half-open trial slot
    pub async fn call<F, T, Fut>(&self, source: &str, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        if !self.allow(source) {
            return Err(AppError::CircuitOpen {
                source_name: source.to_string(),
                retry_after: self.retry_after(source).unwrap_or(Duration::ZERO),
            });
        }

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(source),
            Err(e) if e.should_trip_circuit() => self.record_failure(source),
            Err(_) => self.record_inconclusive(source),
        }

        result
    }

    fn maybe_transition_to_half_open(&self, source: &str, record: &mut CircuitRecord) {
        if record.state == CircuitState::Open
            && let Some(opened_at) = record.opened_at
            && opened_at.elapsed() >= self.config.cooldown
        {
            tracing::info!(source = %source, "Circuit transitioning to half-open state");
            record.state = CircuitState::HalfOpen;
            record.trial_in_flight = false;
        }
    }
}
