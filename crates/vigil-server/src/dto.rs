use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vigil_core::DiagnosticsReport;
use vigil_core::circuit_breaker::CircuitSnapshot;
use vigil_core::score::PluginScoreSnapshot;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// The diagnostics document: per-source search counters, probe counters
/// and circuit states.
#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(transparent)]
#[schema(value_type = Object)]
pub struct StatsResponse(pub DiagnosticsReport);

// ---------------------------------------------------------------------------
// Scores
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ScoresQuery {
    /// Only return snapshots of this source.
    pub source: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ScoreResponse {
    pub source: String,
    pub category: i32,
    /// Age bucket: `current`, `y1_2` or `y5_10`.
    pub bucket: String,
    pub health: f64,
    pub health_samples: u64,
    pub search: f64,
    pub search_samples: u64,
    pub final_score: f64,
    pub confidence: f64,
    /// `final_score` shrunk toward 0.5 by the lack of confidence.
    pub ranking_value: f64,
    pub updated_at: DateTime<Utc>,
}

impl From<PluginScoreSnapshot> for ScoreResponse {
    fn from(snapshot: PluginScoreSnapshot) -> Self {
        Self {
            ranking_value: snapshot.ranking_value(),
            bucket: snapshot.bucket.to_string(),
            health: snapshot.health.value,
            health_samples: snapshot.health.sample_count,
            search: snapshot.search.value,
            search_samples: snapshot.search.sample_count,
            final_score: snapshot.final_score,
            confidence: snapshot.confidence,
            updated_at: snapshot.updated_at,
            category: snapshot.category,
            source: snapshot.source,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ScoreListResponse {
    pub scores: Vec<ScoreResponse>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Circuits
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CircuitResponse {
    pub source: String,
    /// `closed`, `open` or `half_open`.
    pub state: String,
    pub failures: u32,
    /// Remaining cooldown of an open circuit.
    pub retry_after_seconds: Option<f64>,
}

impl CircuitResponse {
    pub fn new(
        source: String,
        snapshot: CircuitSnapshot,
        retry_after_seconds: Option<f64>,
    ) -> Self {
        Self {
            source,
            state: snapshot.state.to_string(),
            failures: snapshot.failures,
            retry_after_seconds,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CircuitListResponse {
    pub circuits: Vec<CircuitResponse>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Score store backend: `postgres` or `memory`.
    pub store: &'static str,
    pub database: &'static str,
    pub uptime_seconds: f64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
