pub mod challenge;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod probe;
pub mod rate_limiter;
pub mod retry;
pub mod score;
pub mod traits;
pub mod util;

#[cfg(test)]
mod testutil;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use config::{ResilienceConfig, parse_sources};
pub use error::AppError;
pub use gateway::SourceGateway;
pub use metrics::{DiagnosticsReport, MetricsCollector};
pub use models::{HttpRequest, HttpResponse, ProbeResult, SearchOutcome};
pub use monitor::{HealthMonitor, MonitorConfig, TracingMonitorReporter};
pub use probe::{HealthProber, ProbeConfig};
pub use rate_limiter::{DomainRateLimiter, RateLimitConfig};
pub use retry::{RetryConfig, RetryTransport};
pub use score::{AgeBucket, PluginScoreModel, PluginScoreSnapshot, ScoreConfig, ScoreKey};
pub use traits::{HttpTransport, InMemoryScoreStore, ScoreStore, SourceAdapter};
