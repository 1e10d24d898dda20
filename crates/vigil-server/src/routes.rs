use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use vigil_core::circuit_breaker::{CircuitSnapshot, CircuitState};

use crate::auth::require_admin_token;
use crate::dto::{
    CircuitListResponse, CircuitResponse, ErrorResponse, HealthResponse, ScoreListResponse,
    ScoreResponse, ScoresQuery, StatsResponse,
};
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/v1/circuits/{source}/reset", post(reset_circuit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .route("/v1/stats", get(stats))
        .route("/v1/scores", get(list_scores))
        .route("/v1/circuits", get(list_circuits))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(admin).with_state(state)
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/stats",
    responses(
        (status = 200, description = "Diagnostics document", body = StatsResponse),
    ),
    tag = "diagnostics"
)]
pub async fn stats(State(state): State<Arc<AppState>>) -> axum::Json<StatsResponse> {
    axum::Json(StatsResponse(state.metrics.report(&state.breaker)))
}

// ---------------------------------------------------------------------------
// Scores
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/scores",
    params(ScoresQuery),
    responses(
        (status = 200, description = "Score snapshots ordered by key", body = ScoreListResponse),
    ),
    tag = "scores"
)]
pub async fn list_scores(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScoresQuery>,
) -> axum::Json<ScoreListResponse> {
    let mut snapshots = state.scores.list(query.source.as_deref()).await;
    snapshots.sort_by_key(|s| s.key());

    let scores: Vec<ScoreResponse> = snapshots.into_iter().map(ScoreResponse::from).collect();
    let total = scores.len();
    axum::Json(ScoreListResponse { scores, total })
}

// ---------------------------------------------------------------------------
// Circuits
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/circuits",
    responses(
        (status = 200, description = "Every tracked circuit", body = CircuitListResponse),
    ),
    tag = "circuits"
)]
pub async fn list_circuits(State(state): State<Arc<AppState>>) -> axum::Json<CircuitListResponse> {
    let circuits = state
        .breaker
        .snapshot()
        .into_iter()
        .map(|(source, snapshot)| {
            let retry_after = state.breaker.retry_after(&source).map(|d| d.as_secs_f64());
            CircuitResponse::new(source, snapshot, retry_after)
        })
        .collect();

    axum::Json(CircuitListResponse { circuits })
}

#[utoipa::path(
    post,
    path = "/v1/circuits/{source}/reset",
    params(("source" = String, Path, description = "Source name")),
    responses(
        (status = 200, description = "Circuit reset to closed", body = CircuitResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Admin endpoints disabled"),
        (status = 404, description = "Source has no tracked circuit", body = ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "circuits"
)]
pub async fn reset_circuit(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
) -> Response {
    if !state.breaker.snapshot().contains_key(&source) {
        let body = ErrorResponse {
            error: "not_found".to_string(),
            message: format!("No circuit tracked for source '{source}'"),
        };
        return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
    }

    state.breaker.reset(&source);

    let snapshot = CircuitSnapshot {
        state: CircuitState::Closed,
        failures: 0,
    };
    axum::Json(CircuitResponse::new(source, snapshot, None)).into_response()
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backend = state.scores.store();
    let db_status = match backend.health_check().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "Score store health check failed");
            "error"
        }
    };

    let status = if db_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if db_status == "ok" {
            "healthy"
        } else {
            "unhealthy"
        },
        store: backend.kind(),
        database: db_status,
        uptime_seconds: state.metrics.uptime().as_secs_f64(),
    };

    (status, axum::Json(response))
}
