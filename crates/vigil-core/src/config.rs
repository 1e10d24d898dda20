use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::probe::ProbeConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::score::ScoreConfig;

/// Slowest accepted positive rate: one request every ~17 minutes.
const MIN_REQUESTS_PER_SECOND: f64 = 0.001;

/// All tunables of the reliability layer.
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfig {
    pub breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub probe: ProbeConfig,
    pub score: ScoreConfig,
}

impl ResilienceConfig {
    /// Read configuration from environment variables.
    ///
    /// Every variable is optional; unset ones keep their default.
    ///
    /// - `VIGIL_FAILURE_THRESHOLD`, `VIGIL_COOLDOWN_SECONDS`
    /// - `VIGIL_REQUESTS_PER_SECOND` (0 = unlimited), `VIGIL_BURST_SIZE`
    /// - `VIGIL_MAX_RETRIES`, `VIGIL_BACKOFF_BASE_SECONDS`, `VIGIL_MAX_BACKOFF_SECONDS`
    /// - `VIGIL_RETRYABLE_STATUS_CODES` (comma-separated, e.g. `429,503`)
    /// - `VIGIL_PROBE_CONCURRENCY`, `VIGIL_PROBE_TIMEOUT_SECONDS`
    /// - `VIGIL_SCORE_ALPHA`, `VIGIL_HEALTH_WEIGHT`, `VIGIL_SEARCH_WEIGHT`, `VIGIL_CONFIDENCE_K`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(threshold) = parse::<u32, _>(&lookup, "VIGIL_FAILURE_THRESHOLD")? {
            if threshold == 0 {
                return Err(AppError::ConfigError(
                    "VIGIL_FAILURE_THRESHOLD must be at least 1".into(),
                ));
            }
            config.breaker.failure_threshold = threshold;
        }
        if let Some(cooldown) = seconds(&lookup, "VIGIL_COOLDOWN_SECONDS")? {
            config.breaker.cooldown = cooldown;
        }

        if let Some(rps) = parse::<f64, _>(&lookup, "VIGIL_REQUESTS_PER_SECOND")? {
            if !rps.is_finite() {
                return Err(AppError::ConfigError(
                    "VIGIL_REQUESTS_PER_SECOND must be a finite number".into(),
                ));
            }
            if rps > 0.0 && rps < MIN_REQUESTS_PER_SECOND {
                return Err(AppError::ConfigError(format!(
                    "VIGIL_REQUESTS_PER_SECOND must be 0 (unlimited) or at least \
                     {MIN_REQUESTS_PER_SECOND}"
                )));
            }
            config.rate_limit.requests_per_second = rps;
        }
        if let Some(burst) = parse::<u32, _>(&lookup, "VIGIL_BURST_SIZE")? {
            config.rate_limit.burst_size = burst;
        }

        if let Some(retries) = parse::<u32, _>(&lookup, "VIGIL_MAX_RETRIES")? {
            config.retry.max_retries = retries;
        }
        if let Some(base) = seconds(&lookup, "VIGIL_BACKOFF_BASE_SECONDS")? {
            config.retry.backoff_base = base;
        }
        if let Some(max) = seconds(&lookup, "VIGIL_MAX_BACKOFF_SECONDS")? {
            config.retry.max_backoff = max;
        }
        if let Some(raw) = lookup("VIGIL_RETRYABLE_STATUS_CODES") {
            config.retry.retryable_status_codes = parse_status_codes(&raw)?;
        }

        if let Some(concurrency) = parse::<usize, _>(&lookup, "VIGIL_PROBE_CONCURRENCY")? {
            if concurrency == 0 {
                return Err(AppError::ConfigError(
                    "VIGIL_PROBE_CONCURRENCY must be at least 1".into(),
                ));
            }
            config.probe.concurrency = concurrency;
        }
        if let Some(timeout) = seconds(&lookup, "VIGIL_PROBE_TIMEOUT_SECONDS")? {
            if timeout.is_zero() {
                return Err(AppError::ConfigError(
                    "VIGIL_PROBE_TIMEOUT_SECONDS must be positive".into(),
                ));
            }
            config.probe.timeout = timeout;
        }

        if let Some(alpha) = parse(&lookup, "VIGIL_SCORE_ALPHA")? {
            config.score.alpha = alpha;
        }
        if let Some(weight) = parse(&lookup, "VIGIL_HEALTH_WEIGHT")? {
            config.score.health_weight = weight;
        }
        if let Some(weight) = parse(&lookup, "VIGIL_SEARCH_WEIGHT")? {
            config.score.search_weight = weight;
        }
        if let Some(k) = parse(&lookup, "VIGIL_CONFIDENCE_K")? {
            config.score.confidence_k = k;
        }
        config.score.validate()?;

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, AppError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}'"))
        }),
    }
}

fn seconds<F>(lookup: &F, key: &str) -> Result<Option<Duration>, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(secs) = parse::<f64, _>(lookup, key)? else {
        return Ok(None);
    };
    Duration::try_from_secs_f64(secs).map(Some).map_err(|_| {
        AppError::ConfigError(format!(
            "Invalid {key} '{secs}': must be a non-negative number of seconds"
        ))
    })
}

fn parse_status_codes(raw: &str) -> Result<Vec<u16>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|code| {
            code.parse::<u16>()
                .ok()
                .filter(|c| (100..=599).contains(c))
                .ok_or_else(|| {
                    AppError::ConfigError(format!(
                        "Invalid status code '{code}' in VIGIL_RETRYABLE_STATUS_CODES"
                    ))
                })
        })
        .collect()
}

/// Parse a `name=url,name=url` source list.
///
/// Blank entries are ignored. Names must be unique and URLs must be
/// absolute http(s) URLs.
pub fn parse_sources(raw: &str) -> Result<HashMap<String, String>, AppError> {
    let mut sources = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, url) = entry
            .split_once('=')
            .map(|(n, u)| (n.trim(), u.trim()))
            .filter(|(n, u)| !n.is_empty() && !u.is_empty())
            .ok_or_else(|| {
                AppError::ConfigError(format!("Invalid source '{entry}': expected name=url"))
            })?;

        let parsed = Url::parse(url)
            .map_err(|e| AppError::ConfigError(format!("Invalid URL for source '{name}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::ConfigError(format!(
                "Source '{name}' must use http or https"
            )));
        }

        if sources.insert(name.to_string(), url.to_string()).is_some() {
            return Err(AppError::ConfigError(format!("Duplicate source '{name}'")));
        }
    }
    Ok(sources)
}
