//! Single entry point for outbound calls to a source.
//!
//! Every call goes through the source's circuit, then the retrying,
//! rate-limited transport. Outcomes are classified (success, failure,
//! anti-bot challenge) and fed to the metrics collector and score model.

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;

use crate::challenge::is_challenge;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::AppError;
use crate::metrics::MetricsCollector;
use crate::models::{HttpRequest, HttpResponse, SearchOutcome};
use crate::retry::RetryTransport;
use crate::score::{PluginScoreModel, ScoreKey};
use crate::traits::{HttpTransport, ScoreStore, SourceAdapter};

/// Routes source traffic through breaker, retries and rate limiting.
#[derive(Clone)]
pub struct SourceGateway<T, S: ScoreStore> {
    breaker: CircuitBreakerRegistry,
    transport: RetryTransport<T>,
    metrics: Arc<MetricsCollector>,
    scores: PluginScoreModel<S>,
}

impl<T: HttpTransport, S: ScoreStore> SourceGateway<T, S> {
    pub fn new(
        breaker: CircuitBreakerRegistry,
        transport: RetryTransport<T>,
        metrics: Arc<MetricsCollector>,
        scores: PluginScoreModel<S>,
    ) -> Self {
        Self {
            breaker,
            transport,
            metrics,
            scores,
        }
    }

    pub fn breaker(&self) -> &CircuitBreakerRegistry {
        &self.breaker
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn scores(&self) -> &PluginScoreModel<S> {
        &self.scores
    }

    /// Send one request on behalf of `source`.
    ///
    /// Failing statuses come back as errors: a challenge page as
    /// `ChallengeDetected`, an exhausted 429 as `RateLimitExceeded`, any
    /// other status >= 400 as `HttpStatus`.
    pub async fn send(
        &self,
        source: &str,
        request: &HttpRequest,
    ) -> Result<HttpResponse, AppError> {
        let result = self
            .breaker
            .call(source, || async {
                self.transport.send(request).await.and_then(classify)
            })
            .await;

        if let Err(e) = &result {
            tracing::debug!(
                source = %source,
                url = %request.url,
                error = %e,
                "Source request failed"
            );
        }
        result
    }

    /// Run one search against the source of `key`.
    ///
    /// `search` returns the caller's results together with the
    /// [`SearchOutcome`] counters that feed the score model. A rejected
    /// circuit is counted as a failed search but leaves the score alone,
    /// since the source was never queried.
    pub async fn search<R, F, Fut>(&self, key: &ScoreKey, search: F) -> Result<R, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(R, SearchOutcome), AppError>>,
    {
        let start = Instant::now();
        let result = self.breaker.call(&key.source, search).await;
        let elapsed = start.elapsed();

        match result {
            Ok((results, outcome)) => {
                self.metrics.record_search(
                    &key.source,
                    true,
                    u64::from(outcome.items_found),
                    elapsed,
                );
                self.scores.record_search(key, &outcome).await;
                Ok(results)
            }
            Err(e) => {
                self.metrics.record_search(&key.source, false, 0, elapsed);
                match &e {
                    AppError::CircuitOpen { .. } => {}
                    e if e.is_inconclusive() => {
                        self.scores.record_search_challenge(key).await;
                    }
                    _ => {
                        self.scores.record_search_failure(key).await;
                    }
                }
                tracing::warn!(
                    source = %key.source,
                    category = key.category,
                    bucket = %key.bucket,
                    error = %e,
                    "Search failed"
                );
                Err(e)
            }
        }
    }

    /// Resolve `url` through `adapter`, gated by the adapter's circuit.
    ///
    /// `Ok(None)` (target offline) is a healthy answer from the source and
    /// counts as a success for its circuit.
    pub async fn resolve<A: SourceAdapter>(
        &self,
        adapter: &A,
        url: &str,
    ) -> Result<Option<String>, AppError> {
        let source = adapter.name();
        let result = self.breaker.call(source, || adapter.resolve(url)).await;
        match &result {
            Ok(Some(_)) => tracing::debug!(source = %source, %url, "Resolved"),
            Ok(None) => tracing::debug!(source = %source, %url, "Target offline"),
            Err(e) => tracing::warn!(source = %source, %url, error = %e, "Resolve failed"),
        }
        result
    }
}

fn classify(response: HttpResponse) -> Result<HttpResponse, AppError> {
    if is_challenge(response.status, &response.body) {
        return Err(AppError::ChallengeDetected {
            status: response.status,
        });
    }
    match response.status {
        429 => Err(AppError::RateLimitExceeded),
        status if status >= 400 => Err(AppError::HttpStatus { status }),
        _ => Ok(response),
    }
}
