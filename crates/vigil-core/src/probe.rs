//! Active health probing of source base URLs.
//!
//! A probe is a HEAD request, falling back to a one-byte ranged GET when the
//! target rejects HEAD. Every probe is bounded by a timeout and always
//! yields a [`ProbeResult`]; transport failures never escape as errors.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::challenge::{is_challenge, is_challenge_head};
use crate::error::AppError;
use crate::models::{HttpRequest, ProbeErrorKind, ProbeResult};
use crate::rate_limiter::DomainRateLimiter;
use crate::retry::{RetryConfig, RetryTransport};
use crate::traits::HttpTransport;

/// Configuration for health probing.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Budget for one probe, HEAD and GET fallback included.
    pub timeout: Duration,
    /// Maximum probes in flight in [`HealthProber::probe_all`].
    pub concurrency: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            concurrency: 5,
        }
    }
}

impl ProbeConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Probes source base URLs through an [`HttpTransport`].
#[derive(Clone)]
pub struct HealthProber<T> {
    transport: T,
    config: ProbeConfig,
    /// Deadline for a whole probe, HEAD and GET fallback included.
    budget: Duration,
}

impl<T: HttpTransport> HealthProber<T> {
    pub fn new(transport: T, config: ProbeConfig) -> Self {
        Self {
            transport,
            budget: config.timeout,
            config,
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe one base URL.
    pub async fn probe(&self, base_url: &str) -> ProbeResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let result = match tokio::time::timeout(self.budget, self.check(base_url)).await {
            Ok(Ok((status, challenge))) => {
                ProbeResult::from_status(started_at, start.elapsed(), status, challenge)
            }
            Ok(Err(e)) => {
                tracing::debug!(url = %base_url, error = %e, "Probe failed");
                ProbeResult::failed(started_at, start.elapsed(), error_kind(&e))
            }
            Err(_) => ProbeResult::failed(started_at, start.elapsed(), ProbeErrorKind::Timeout),
        };

        tracing::debug!(
            url = %base_url,
            ok = result.ok,
            status = ?result.http_status,
            error_kind = ?result.error_kind,
            duration_ms = result.duration_ms,
            "Probe finished"
        );
        result
    }

    /// Returns the final status and whether it was an anti-bot challenge.
    async fn check(&self, url: &str) -> Result<(u16, bool), AppError> {
        let head = HttpRequest::head(url).with_timeout(self.config.timeout);
        let response = self.transport.send(&head).await?;

        if matches!(response.status, 405 | 501) {
            let get = HttpRequest::get(url)
                .with_header("Range", "bytes=0-0")
                .with_timeout(self.config.timeout);
            let response = self.transport.send(&get).await?;
            return Ok((response.status, is_challenge(response.status, &response.body)));
        }

        Ok((response.status, is_challenge_head(&response)))
    }

    /// Probe every `source -> base URL` entry with at most `concurrency`
    /// probes in flight. A hanging target only holds its own slot.
    pub async fn probe_all(
        &self,
        sources: &HashMap<String, String>,
        concurrency: usize,
    ) -> HashMap<String, ProbeResult> {
        let gate = Semaphore::new(concurrency.max(1));
        let gate = &gate;

        let probes = sources.iter().map(|(source, url)| async move {
            // The semaphore lives for the whole batch and is never closed.
            let _permit = gate.acquire().await.ok();
            (source.clone(), self.probe(url).await)
        });

        join_all(probes).await.into_iter().collect()
    }
}

impl<T: HttpTransport> HealthProber<RetryTransport<T>> {
    /// A prober whose requests go through a [`RetryTransport`]: every attempt
    /// waits for a rate-limiter token and 429/503 are retried before the
    /// probe settles.
    ///
    /// `probe_config.timeout` bounds each attempt. The whole probe is bounded
    /// by the retry schedule's worst case for HEAD plus the GET fallback.
    pub fn with_retry(
        transport: T,
        limiter: DomainRateLimiter,
        probe_config: ProbeConfig,
        retry_config: RetryConfig,
    ) -> Self {
        let budget = retry_config
            .worst_case_latency(probe_config.timeout)
            .saturating_mul(2);
        Self {
            transport: RetryTransport::new(transport, limiter, retry_config),
            config: probe_config,
            budget,
        }
    }
}

fn error_kind(error: &AppError) -> ProbeErrorKind {
    match error {
        AppError::Timeout(_) => ProbeErrorKind::Timeout,
        AppError::ChallengeDetected { .. } => ProbeErrorKind::Captcha,
        _ => ProbeErrorKind::HttpError,
    }
}
