use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for vigil.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request could not be built or sent.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Target answered with a failing status that is not retried.
    #[error("HTTP status {status}")]
    HttpStatus { status: u16 },

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Retries exhausted against a rate-limiting target.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Target answered with an anti-bot challenge page.
    #[error("Anti-bot challenge detected (HTTP {status})")]
    ChallengeDetected { status: u16 },

    /// Call rejected without touching the network because the source's circuit is open.
    #[error(
        "Circuit for source '{source_name}' is open. Retry after {} seconds.",
        .retry_after.as_secs()
    )]
    CircuitOpen {
        source_name: String,
        retry_after: Duration,
    },

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration error (missing or invalid settings).
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::HttpStatus { status } => matches!(status, 429 | 503),
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should count as a circuit breaker failure.
    ///
    /// Challenges are inconclusive and open-circuit rejections never reached
    /// the target, so neither trips the circuit.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::HttpStatus { .. } => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("connection")
            }
            _ => false,
        }
    }

    /// Returns true if the outcome says nothing definite about the target's health.
    pub fn is_inconclusive(&self) -> bool {
        matches!(self, AppError::ChallengeDetected { .. })
    }
}
