//! Retrying HTTP transport.
//!
//! Wraps any [`HttpTransport`] so that every attempt first takes a token from
//! the [`DomainRateLimiter`], and transient statuses (429/503 by default) are
//! retried with exponential backoff plus jitter. A numeric `Retry-After`
//! header replaces the computed backoff.
//!
//! When retries are exhausted the last response is returned as-is, so the
//! caller always sees the final outcome. Transport errors (timeouts, refused
//! connections) are returned immediately and never retried here. A request
//! timeout bounds each attempt separately.
//!
//! # Example
//!
//! ```rust,no_run
//! use vigil_core::rate_limiter::{DomainRateLimiter, RateLimitConfig};
//! use vigil_core::retry::{RetryConfig, RetryTransport};
//! # use vigil_core::traits::HttpTransport;
//! # use vigil_core::models::{HttpRequest, HttpResponse};
//! # #[derive(Clone)] struct MyTransport;
//! # impl HttpTransport for MyTransport {
//! #     async fn send(&self, _: &HttpRequest) -> Result<HttpResponse, vigil_core::AppError> {
//! #         todo!()
//! #     }
//! # }
//!
//! # async fn run() -> Result<(), vigil_core::AppError> {
//! let limiter = DomainRateLimiter::new(RateLimitConfig::new(2.0, 4));
//! let transport = RetryTransport::new(MyTransport, limiter, RetryConfig::default());
//! let response = transport.send(&HttpRequest::get("https://example.com/")).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::error::AppError;
use crate::models::{HttpRequest, HttpResponse};
use crate::rate_limiter::DomainRateLimiter;
use crate::traits::HttpTransport;
use crate::util::jitter;

/// Retry policy of [`RetryTransport`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub backoff_base: Duration,
    /// Upper bound of any single delay, including `Retry-After` values.
    pub max_backoff: Duration,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            retryable_status_codes: vec![429, 503],
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.max_backoff = max;
        self
    }

    pub fn with_retryable_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retryable_status_codes = codes;
        self
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Upper bound on one [`RetryTransport::send`] whose attempts each time
    /// out after `request_timeout`, limiter waits excluded.
    pub fn worst_case_latency(&self, request_timeout: Duration) -> Duration {
        request_timeout
            .saturating_add(self.max_backoff)
            .saturating_mul(self.max_retries.saturating_add(1))
    }

    /// Delay before the retry that follows attempt number `attempt` (0-based).
    ///
    /// `Retry-After` (seconds form) wins over the exponential schedule
    /// `base * 2^attempt + jitter[0, base]`; both are capped at `max_backoff`.
    pub fn delay_for(&self, attempt: u32, response: &HttpResponse) -> Duration {
        if let Some(retry_after) = response.retry_after() {
            return retry_after.min(self.max_backoff);
        }
        let exponential = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt));
        exponential
            .saturating_add(jitter(self.backoff_base))
            .min(self.max_backoff)
    }
}

/// An [`HttpTransport`] that rate-limits and retries transient statuses.
#[derive(Clone)]
pub struct RetryTransport<T> {
    inner: T,
    limiter: DomainRateLimiter,
    config: Arc<RetryConfig>,
}

impl<T: HttpTransport> RetryTransport<T> {
    pub fn new(inner: T, limiter: DomainRateLimiter, config: RetryConfig) -> Self {
        Self {
            inner,
            limiter,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn limiter(&self) -> &DomainRateLimiter {
        &self.limiter
    }
}

impl<T: HttpTransport> HttpTransport for RetryTransport<T> {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, AppError> {
        let attempts = self.config.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            self.limiter.acquire(&request.url).await;
            let response = match request.timeout {
                Some(limit) => tokio::time::timeout(limit, self.inner.send(request))
                    .await
                    .map_err(|_| AppError::Timeout(limit.as_secs()))??,
                None => self.inner.send(request).await?,
            };

            if !self.config.is_retryable_status(response.status) {
                return Ok(response);
            }

            if attempt + 1 >= attempts {
                tracing::warn!(
                    url = %request.url,
                    status = response.status,
                    attempts,
                    "Retries exhausted, returning last response"
                );
                return Ok(response);
            }

            let delay = self.config.delay_for(attempt, &response);
            tracing::debug!(
                url = %request.url,
                status = response.status,
                attempt = attempt + 1,
                delay_ms = %delay.as_millis(),
                "Transient status, retrying"
            );
            drop(response);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
