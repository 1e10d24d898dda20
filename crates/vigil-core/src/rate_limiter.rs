//! Per-domain token bucket rate limiting.
//!
//! Every outbound request waits for a token from the bucket of its
//! second-level domain (`example` for `cdn.eu.example.com`), so all hosts,
//! schemes and ports of one site share a single budget.
//!
//! # Example
//!
//! ```rust,no_run
//! use vigil_core::rate_limiter::{DomainRateLimiter, RateLimitConfig};
//!
//! # async fn run() {
//! // 5 requests per second, bursts of up to 10, but 1/s for one slow host
//! let config = RateLimitConfig::new(5.0, 10).with_domain_rate("slowhost", 1.0, 1);
//! let limiter = DomainRateLimiter::new(config);
//! limiter.acquire("https://www.slowhost.net/file/abc").await;
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use url::{Host, Url};

/// Configuration for the domain rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Steady refill rate per domain. Zero or negative disables limiting.
    pub requests_per_second: f64,

    /// Bucket capacity, i.e. how many requests may fire back to back.
    pub burst_size: u32,

    /// Per-domain `(requests_per_second, burst_size)` overrides.
    pub overrides: HashMap<String, (f64, u32)>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(5.0, 10)
    }
}

impl RateLimitConfig {
    pub fn new(requests_per_second: f64, burst_size: u32) -> Self {
        Self {
            requests_per_second,
            burst_size,
            overrides: HashMap::new(),
        }
    }

    /// A configuration under which `acquire` never waits.
    pub fn unlimited() -> Self {
        Self::new(0.0, 0)
    }

    /// Use a different rate for one second-level domain.
    pub fn with_domain_rate(
        mut self,
        domain: impl Into<String>,
        requests_per_second: f64,
        burst_size: u32,
    ) -> Self {
        self.overrides
            .insert(domain.into().to_ascii_lowercase(), (requests_per_second, burst_size));
        self
    }

    fn limits_for(&self, domain: &str) -> (f64, u32) {
        self.overrides
            .get(domain)
            .copied()
            .unwrap_or((self.requests_per_second, self.burst_size))
    }
}

/// A lazily refilled token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl TokenBucket {
    /// Create a full bucket. A zero capacity is raised to one token.
    pub fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    ///
    /// Waits too long for a `Duration` saturate to `Duration::MAX`.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        self.last_used = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let secs = (1.0 - self.tokens) / self.refill_rate;
            Err(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        }
    }

    /// Tokens available at `now`, without consuming any.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Token buckets keyed by second-level domain.
///
/// Thread-safe: buckets are created and drained under one lock, which is
/// released while a caller sleeps so other domains are never blocked.
#[derive(Clone)]
pub struct DomainRateLimiter {
    config: Arc<RateLimitConfig>,
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
}

impl Default for DomainRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl DomainRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: Arc::new(config),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Extract the rate-limiting key from a URL.
    ///
    /// Domain names map to their second-level label; IP literals and
    /// single-label hosts are used verbatim.
    pub fn domain_key(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        match url.host()? {
            Host::Domain(domain) => {
                let labels: Vec<&str> = domain
                    .trim_end_matches('.')
                    .split('.')
                    .filter(|l| !l.is_empty())
                    .collect();
                let key = match labels.len() {
                    0 => return None,
                    1 => labels[0],
                    n => labels[n - 2],
                };
                Some(key.to_ascii_lowercase())
            }
            Host::Ipv4(ip) => Some(ip.to_string()),
            Host::Ipv6(ip) => Some(ip.to_string()),
        }
    }

    /// Wait until a token is available for the URL's domain, then consume it.
    ///
    /// Returns immediately when the domain's rate is unlimited or the URL
    /// has no usable host.
    pub async fn acquire(&self, url: &str) {
        let Some(domain) = Self::domain_key(url) else {
            return;
        };
        let (rate, burst) = self.config.limits_for(&domain);
        if rate <= 0.0 {
            return;
        }

        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let now = Instant::now();
                let bucket = buckets
                    .entry(domain.clone())
                    .or_insert_with(|| TokenBucket::new(burst, rate, now));
                match bucket.try_acquire(now) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            // Concurrent waiters may drain the refill, hence the re-check loop.
            tracing::debug!(
                domain = %domain,
                wait_ms = %wait.as_millis(),
                "Throttling request"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available for `domain`, if a bucket exists.
    pub async fn available_tokens(&self, domain: &str) -> Option<f64> {
        let mut buckets = self.buckets.lock().await;
        buckets
            .get_mut(domain)
            .map(|bucket| bucket.available(Instant::now()))
    }

    pub async fn tracked_domains(&self) -> usize {
        self.buckets.lock().await.len()
    }

    /// Drops buckets that have not been used for at least `max_idle`.
    ///
    /// A dropped bucket is recreated full on next use. Returns the number
    /// of evicted buckets.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        let now = Instant::now();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_used) < max_idle);
        let evicted = before - buckets.len();
        if evicted > 0 {
            tracing::debug!(evicted, "Swept idle rate limit buckets");
        }
        evicted
    }
}
