//! Trust scoring for sources.
//!
//! Each `(source, category, age bucket)` key carries two exponentially
//! weighted moving averages: *health* (is the site reachable) and *search*
//! (does querying it yield usable results). They are combined into a
//! `final_score` with a `confidence` that grows with the number of samples.
//!
//! Snapshots live in an external [`ScoreStore`]; this module only computes
//! updates. A missing, unreadable or corrupted snapshot is replaced by the
//! neutral prior (0.5, no samples, zero confidence) instead of failing.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::models::{ProbeResult, SearchOutcome};
use crate::traits::ScoreStore;

/// Neutral prior for a dimension that has never been sampled.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Coarse recency class of the content being searched for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum AgeBucket {
    #[serde(rename = "current")]
    Current,
    #[serde(rename = "y1_2")]
    Years1To2,
    #[serde(rename = "y5_10")]
    Years5To10,
}

impl AgeBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeBucket::Current => "current",
            AgeBucket::Years1To2 => "y1_2",
            AgeBucket::Years5To10 => "y5_10",
        }
    }
}

impl fmt::Display for AgeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgeBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "current" => Ok(AgeBucket::Current),
            "y1_2" => Ok(AgeBucket::Years1To2),
            "y5_10" => Ok(AgeBucket::Years5To10),
            _ => Err(format!("Unknown age bucket: {s}")),
        }
    }
}

/// Composite key of a score snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScoreKey {
    pub source: String,
    pub category: i32,
    pub bucket: AgeBucket,
}

impl ScoreKey {
    pub fn new(source: impl Into<String>, category: i32, bucket: AgeBucket) -> Self {
        Self {
            source: source.into(),
            category,
            bucket,
        }
    }

    /// Key that source-wide signals land on when nothing more specific exists.
    pub fn source_default(source: impl Into<String>) -> Self {
        Self::new(source, 0, AgeBucket::Current)
    }
}

/// One exponentially weighted moving average in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EwmaState {
    pub value: f64,
    pub last_update: Option<DateTime<Utc>>,
    pub sample_count: u64,
}

impl Default for EwmaState {
    fn default() -> Self {
        Self::neutral()
    }
}

impl EwmaState {
    pub fn neutral() -> Self {
        Self {
            value: NEUTRAL_SCORE,
            last_update: None,
            sample_count: 0,
        }
    }

    /// Fold one sample in: `value += alpha * (sample - value)`.
    ///
    /// Both `sample` and `alpha` are clamped to `[0, 1]`, so the value
    /// never leaves that range.
    pub fn update(&mut self, sample: f64, alpha: f64, at: DateTime<Utc>) {
        let sample = if sample.is_finite() { sample.clamp(0.0, 1.0) } else { 0.0 };
        let alpha = alpha.clamp(0.0, 1.0);
        self.value = (self.value + alpha * (sample - self.value)).clamp(0.0, 1.0);
        self.sample_count = self.sample_count.saturating_add(1);
        self.last_update = Some(at);
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_finite() && (0.0..=1.0).contains(&self.value)
    }
}

/// Score state of one `(source, category, bucket)` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginScoreSnapshot {
    pub source: String,
    pub category: i32,
    pub bucket: AgeBucket,
    pub health: EwmaState,
    pub search: EwmaState,
    pub final_score: f64,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

impl PluginScoreSnapshot {
    pub fn neutral(key: &ScoreKey) -> Self {
        Self {
            source: key.source.clone(),
            category: key.category,
            bucket: key.bucket,
            health: EwmaState::neutral(),
            search: EwmaState::neutral(),
            final_score: NEUTRAL_SCORE,
            confidence: 0.0,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> ScoreKey {
        ScoreKey::new(self.source.clone(), self.category, self.bucket)
    }

    pub fn total_samples(&self) -> u64 {
        self.health.sample_count.saturating_add(self.search.sample_count)
    }

    /// Recompute the derived fields from the two dimensions.
    pub fn recompute(&mut self, config: &ScoreConfig) {
        self.final_score = config.combine(self.health.value, self.search.value);
        self.confidence = config.confidence(self.total_samples());
    }

    /// `final_score` shrunk toward neutral by the lack of confidence.
    ///
    /// An unproven source ranks near the middle rather than at either end.
    pub fn ranking_value(&self) -> f64 {
        NEUTRAL_SCORE + self.confidence * (self.final_score - NEUTRAL_SCORE)
    }

    pub fn is_valid(&self) -> bool {
        let unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        self.health.is_valid()
            && self.search.is_valid()
            && unit(self.final_score)
            && unit(self.confidence)
    }
}

/// Scoring policy. Every knob is configurable; defaults are documented in DESIGN.md.
#[derive(Debug, Clone)]
pub struct ScoreConfig {
    /// EWMA decay factor in `(0, 1]`.
    pub alpha: f64,
    pub health_weight: f64,
    pub search_weight: f64,
    /// Samples needed for confidence to reach `1 - 1/e`.
    pub confidence_k: f64,
    /// Health sample recorded for a probe that hit an anti-bot challenge.
    pub challenge_sample: f64,
    /// How long a snapshot read from the store is served from memory.
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            health_weight: 0.3,
            search_weight: 0.7,
            confidence_k: 10.0,
            challenge_sample: 0.4,
            cache_ttl: Duration::from_secs(60),
            cache_capacity: 10_000,
        }
    }
}

impl ScoreConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(AppError::ConfigError(format!(
                "score alpha must be in (0, 1], got {}",
                self.alpha
            )));
        }
        let weights = [self.health_weight, self.search_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0)
            || self.health_weight + self.search_weight <= 0.0
        {
            return Err(AppError::ConfigError(
                "score weights must be finite, non-negative and not both zero".into(),
            ));
        }
        if !(self.confidence_k.is_finite() && self.confidence_k > 0.0) {
            return Err(AppError::ConfigError(
                "confidence_k must be a positive finite number".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.challenge_sample) {
            return Err(AppError::ConfigError(
                "challenge_sample must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Weighted average of the two dimensions.
    pub fn combine(&self, health: f64, search: f64) -> f64 {
        let total = self.health_weight + self.search_weight;
        if total <= 0.0 {
            return NEUTRAL_SCORE;
        }
        ((self.health_weight * health + self.search_weight * search) / total).clamp(0.0, 1.0)
    }

    /// `1 - e^(-n/k)`: zero without samples, monotonically approaching one.
    pub fn confidence(&self, samples: u64) -> f64 {
        if self.confidence_k <= 0.0 {
            return if samples > 0 { 1.0 } else { 0.0 };
        }
        (1.0 - (-(samples as f64) / self.confidence_k).exp()).clamp(0.0, 1.0)
    }

    /// Health sample derived from a probe.
    pub fn probe_sample(&self, probe: &ProbeResult) -> f64 {
        if probe.ok {
            1.0
        } else if probe.captcha_detected {
            self.challenge_sample
        } else {
            0.0
        }
    }

    /// Search sample derived from a completed search.
    pub fn search_sample(&self, outcome: &SearchOutcome) -> f64 {
        if outcome.items_found == 0 {
            return 0.1;
        }
        if outcome.items_used == 0 {
            return 0.3;
        }
        let reachable_ratio = if outcome.hoster_checked == 0 {
            1.0
        } else {
            f64::from(outcome.hoster_reachable.min(outcome.hoster_checked))
                / f64::from(outcome.hoster_checked)
        };
        0.6 + 0.4 * reachable_ratio
    }
}

/// Maintains score snapshots on top of a [`ScoreStore`].
///
/// Reads go through a TTL-bounded cache; writes are serialized so two
/// concurrent updates of one key never lose a sample, then written through
/// to the store. Store failures are logged and never surface to callers.
#[derive(Clone)]
pub struct PluginScoreModel<S: ScoreStore> {
    store: S,
    config: Arc<ScoreConfig>,
    cache: Cache<ScoreKey, PluginScoreSnapshot>,
    write_lock: Arc<Mutex<()>>,
}

impl<S: ScoreStore> PluginScoreModel<S> {
    pub fn new(store: S, config: ScoreConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();
        Self {
            store,
            config: Arc::new(config),
            cache,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &ScoreConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn load(&self, key: &ScoreKey) -> PluginScoreSnapshot {
        if let Some(cached) = self.cache.get(key).await {
            return cached;
        }

        let snapshot = match self.store.get_snapshot(key).await {
            Ok(Some(stored)) if stored.is_valid() => stored,
            Ok(Some(_)) => {
                tracing::warn!(
                    source = %key.source,
                    category = key.category,
                    bucket = %key.bucket,
                    "Discarding corrupted score snapshot, using neutral prior"
                );
                PluginScoreSnapshot::neutral(key)
            }
            Ok(None) => PluginScoreSnapshot::neutral(key),
            Err(e) => {
                tracing::warn!(
                    source = %key.source,
                    error = %e,
                    "Score store unavailable, using neutral prior"
                );
                return PluginScoreSnapshot::neutral(key);
            }
        };
        self.cache.insert(key.clone(), snapshot.clone()).await;
        snapshot
    }

    /// Current snapshot for `key`; never fails.
    pub async fn snapshot(&self, key: &ScoreKey) -> PluginScoreSnapshot {
        self.load(key).await
    }

    async fn update<F>(&self, key: &ScoreKey, apply: F) -> PluginScoreSnapshot
    where
        F: FnOnce(&mut PluginScoreSnapshot, &ScoreConfig, DateTime<Utc>),
    {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut snapshot = self.load(key).await;
        apply(&mut snapshot, &self.config, now);
        snapshot.recompute(&self.config);
        snapshot.updated_at = now;

        self.cache.insert(key.clone(), snapshot.clone()).await;
        if let Err(e) = self.store.put_snapshot(&snapshot).await {
            tracing::warn!(
                source = %key.source,
                error = %e,
                "Failed to persist score snapshot"
            );
        }
        snapshot
    }

    /// Fold a health probe into every known key of the probed source.
    ///
    /// When the source has no stored snapshot yet, the default key is used.
    pub async fn record_probe(
        &self,
        source: &str,
        probe: &ProbeResult,
    ) -> Vec<PluginScoreSnapshot> {
        let mut keys: Vec<ScoreKey> = match self.store.list_snapshots(Some(source)).await {
            Ok(snapshots) => snapshots.iter().map(PluginScoreSnapshot::key).collect(),
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "Failed to list score snapshots");
                Vec::new()
            }
        };
        if keys.is_empty() {
            keys.push(ScoreKey::source_default(source));
        }

        let sample = self.config.probe_sample(probe);
        let mut updated = Vec::with_capacity(keys.len());
        for key in &keys {
            let snapshot = self
                .update(key, |s, config, now| s.health.update(sample, config.alpha, now))
                .await;
            updated.push(snapshot);
        }

        tracing::debug!(
            source = %source,
            sample,
            keys = updated.len(),
            "Recorded health probe"
        );
        updated
    }

    /// Fold a completed search into the search dimension of `key`.
    pub async fn record_search(
        &self,
        key: &ScoreKey,
        outcome: &SearchOutcome,
    ) -> PluginScoreSnapshot {
        let sample = self.config.search_sample(outcome);
        self.update(key, |s, config, now| s.search.update(sample, config.alpha, now))
            .await
    }

    /// Fold a search that hit an anti-bot wall into `key`.
    pub async fn record_search_challenge(&self, key: &ScoreKey) -> PluginScoreSnapshot {
        self.update(key, |s, config, now| {
            s.search.update(config.challenge_sample, config.alpha, now)
        })
        .await
    }

    /// Fold a failed search (error, timeout) into `key`.
    pub async fn record_search_failure(&self, key: &ScoreKey) -> PluginScoreSnapshot {
        self.update(key, |s, config, now| s.search.update(0.0, config.alpha, now))
            .await
    }

    /// Stored snapshots, optionally for one source. Invalid rows are replaced
    /// by the neutral prior; a failing store yields an empty list.
    pub async fn list(&self, source: Option<&str>) -> Vec<PluginScoreSnapshot> {
        match self.store.list_snapshots(source).await {
            Ok(snapshots) => snapshots
                .into_iter()
                .map(|s| {
                    if s.is_valid() {
                        s
                    } else {
                        PluginScoreSnapshot::neutral(&s.key())
                    }
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list score snapshots");
                Vec::new()
            }
        }
    }

    /// Snapshots for `keys`, best first by [`PluginScoreSnapshot::ranking_value`].
    pub async fn rank(&self, keys: &[ScoreKey]) -> Vec<PluginScoreSnapshot> {
        let mut ranked = Vec::with_capacity(keys.len());
        for key in keys {
            ranked.push(self.load(key).await);
        }
        ranked.sort_by(|a, b| {
            b.ranking_value()
                .total_cmp(&a.ranking_value())
                .then_with(|| a.source.cmp(&b.source))
        });
        ranked
    }

    /// When a probe of `probe_type` last ran; `None` if never or unknown.
    pub async fn last_run(
        &self,
        probe_type: &str,
        source: &str,
        category: Option<i32>,
        bucket: Option<AgeBucket>,
    ) -> Option<DateTime<Utc>> {
        self.store
            .get_last_run(probe_type, source, category, bucket)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(source = %source, error = %e, "Failed to read last run");
                None
            })
    }

    pub async fn mark_run(
        &self,
        probe_type: &str,
        source: &str,
        category: Option<i32>,
        bucket: Option<AgeBucket>,
        at: DateTime<Utc>,
    ) {
        if let Err(e) = self
            .store
            .set_last_run(probe_type, source, category, bucket, at)
            .await
        {
            tracing::warn!(source = %source, error = %e, "Failed to record last run");
        }
    }
}
