use std::sync::Arc;

use vigil_core::{CircuitBreakerRegistry, MetricsCollector, PluginScoreModel};

use crate::backend::ScoreBackend;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
///
/// The breaker, metrics and score model are the same instances the
/// background health monitor writes to.
pub struct AppState {
    pub metrics: Arc<MetricsCollector>,
    pub breaker: CircuitBreakerRegistry,
    pub scores: PluginScoreModel<ScoreBackend>,
    /// Admin API key for protecting write endpoints (None = admin endpoints disabled).
    pub admin_token: Option<String>,
}
