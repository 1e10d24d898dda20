use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Vigil API",
        version = "0.3.0",
        description = "Circuit breaking, rate limiting and health scoring for unreliable sources."
    ),
    paths(
        crate::routes::stats,
        crate::routes::list_scores,
        crate::routes::list_circuits,
        crate::routes::reset_circuit,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::StatsResponse,
        crate::dto::ScoreResponse,
        crate::dto::ScoreListResponse,
        crate::dto::CircuitResponse,
        crate::dto::CircuitListResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "diagnostics", description = "Search and probe counters"),
        (name = "scores", description = "Plugin score snapshots"),
        (name = "circuits", description = "Circuit breaker state and administration"),
        (name = "system", description = "Health and system status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds the Bearer token security scheme to the OpenAPI document.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "Admin API key. Set via VIGIL_ADMIN_TOKEN environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
