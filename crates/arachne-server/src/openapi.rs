use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Arachne API",
        version = "0.3.0",
        description = "Federated search and resolution over plugin-provided resolvers."
    ),
    paths(
        crate::routes::search,
        crate::routes::search_stream,
        crate::routes::home,
        crate::routes::category,
        crate::routes::detail,
        crate::routes::play,
        crate::routes::list_plugins,
        crate::routes::load_plugin,
        crate::routes::unload_plugin,
        crate::routes::check_update,
        crate::routes::apply_update,
        crate::routes::probe,
        crate::routes::status,
        crate::routes::sweep_cache,
        crate::routes::clear_cache,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::SearchResponse,
        crate::dto::SearchResultResponse,
        crate::dto::SearchProgressResponse,
        crate::dto::ListingResponse,
        crate::dto::VodItemResponse,
        crate::dto::CategoryResponse,
        crate::dto::DetailRequest,
        crate::dto::DetailListResponse,
        crate::dto::DetailResponse,
        crate::dto::PlaylistResponse,
        crate::dto::EpisodeResponse,
        crate::dto::PlayRequest,
        crate::dto::PlayableResponse,
        crate::dto::LoadPluginRequest,
        crate::dto::PluginResponse,
        crate::dto::PluginListResponse,
        crate::dto::UpdateInfoResponse,
        crate::dto::ProbeResponse,
        crate::dto::ProbeCheckResponse,
        crate::dto::StatusResponse,
        crate::dto::PoolStatusResponse,
        crate::dto::CacheStatsResponse,
        crate::dto::SweepResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "search", description = "Federated search across resolvers"),
        (name = "resolvers", description = "Single-resolver browsing and playback"),
        (name = "plugins", description = "Plugin lifecycle management"),
        (name = "system", description = "Health, status and cache maintenance"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
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
                            "Admin token. Set via ARACHNE_ADMIN_TOKEN environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
