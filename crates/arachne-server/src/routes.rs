use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde::Serialize;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use arachne_core::error::AppError;
use arachne_core::plugin::PluginState;
use arachne_core::search::{SearchHandle, SearchRequest, SearchSummary, SearchUpdate};

use crate::auth::require_admin_token;
use crate::dto::{
    DetailListResponse, DetailRequest, ErrorResponse, HealthResponse, HomeQuery, ListingResponse,
    LoadPluginRequest, PlayRequest, PlayableResponse, PluginListResponse, PluginResponse,
    ProbeQuery, ProbeResponse, SearchQuery, SearchResponse, StatusResponse, SweepResponse,
    UpdateInfoResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/v1/plugins", post(load_plugin))
        .route("/v1/plugins/{key}", delete(unload_plugin))
        .route("/v1/plugins/{key}/update", get(check_update))
        .route("/v1/plugins/{key}/update", post(apply_update))
        .route("/v1/plugins/{key}/probe", get(probe))
        .route("/v1/admin/status", get(status))
        .route("/v1/admin/cache/sweep", post(sweep_cache))
        .route("/v1/admin/cache", delete(clear_cache))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .route("/v1/plugins", get(list_plugins))
        .route("/v1/search", get(search))
        .route("/v1/search/stream", get(search_stream))
        .route("/v1/resolvers/{key}/home", get(home))
        .route("/v1/resolvers/{key}/category/{type_id}", get(category))
        .route("/v1/resolvers/{key}/detail", post(detail))
        .route("/v1/resolvers/{key}/play", post(play))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(admin).with_state(state)
}

fn not_found(message: String) -> Response {
    let body = ErrorResponse {
        error: "not_found".to_string(),
        message,
    };
    (StatusCode::NOT_FOUND, axum::Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

fn search_request(query: &SearchQuery) -> Result<SearchRequest, ApiError> {
    if query.keyword.trim().is_empty() {
        return Err(AppError::Generic("keyword must not be empty".to_string()).into());
    }
    let mut request = SearchRequest::new(query.keyword.trim())
        .with_resolvers(query.resolver_keys())
        .quick(query.quick.unwrap_or(false));
    if let Some(n) = query.concurrency {
        request = request.with_concurrency(n);
    }
    if let Some(ms) = query.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    if let Some(retries) = query.retries {
        request = request.with_retries(retries);
    }
    Ok(request)
}

#[utoipa::path(
    get,
    path = "/v1/search",
    params(SearchQuery),
    responses(
        (status = 200, description = "Aggregated results of every resolver", body = SearchResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
    ),
    tag = "search"
)]
pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let request = search_request(&query)?;
    let summary = state.hub.search(request).finish().await;
    Ok(axum::Json(SearchResponse::from(summary)))
}

/// One line of the NDJSON search stream.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StreamLine {
    Result(SearchUpdate),
    Summary(SearchSummary),
}

fn ndjson(line: &StreamLine) -> String {
    match serde_json::to_string(line) {
        Ok(mut json) => {
            json.push('\n');
            json
        }
        Err(e) => format!("{{\"type\":\"error\",\"message\":\"{e}\"}}\n"),
    }
}

#[utoipa::path(
    get,
    path = "/v1/search/stream",
    params(SearchQuery),
    responses(
        (status = 200, description = "One JSON line per resolver as it completes, then a summary line", content_type = "application/x-ndjson", body = String),
        (status = 400, description = "Bad request", body = ErrorResponse),
    ),
    tag = "search"
)]
pub async fn search_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Response, ApiError> {
    let request = search_request(&query)?;
    let handle = state.hub.search(request);

    // Dropping the stream (client gone) drops the handle, which cancels the search.
    let lines = futures::stream::unfold(Some(handle), |handle: Option<SearchHandle>| async move {
        let mut handle = handle?;
        match handle.next().await {
            Some(update) => Some((
                Ok::<_, Infallible>(ndjson(&StreamLine::Result(update))),
                Some(handle),
            )),
            None => {
                let summary = handle.finish().await;
                Some((Ok(ndjson(&StreamLine::Summary(summary))), None))
            }
        }
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/resolvers/{key}/home",
    params(("key" = String, Path, description = "Resolver key"), HomeQuery),
    responses(
        (status = 200, description = "Home listing", body = ListingResponse),
        (status = 404, description = "Resolver not loaded", body = ErrorResponse),
    ),
    tag = "resolvers"
)]
pub async fn home(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<HomeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let listing = state
        .hub
        .home(&key, query.refresh.unwrap_or(false))
        .await?;
    Ok(axum::Json(ListingResponse::from(listing)))
}

/// `page` and `refresh` are reserved; every other query parameter is a filter.
#[utoipa::path(
    get,
    path = "/v1/resolvers/{key}/category/{type_id}",
    params(
        ("key" = String, Path, description = "Resolver key"),
        ("type_id" = String, Path, description = "Category id"),
        ("page" = Option<u32>, Query, description = "Page number, from 1"),
        ("refresh" = Option<bool>, Query, description = "Bypass the cache"),
    ),
    responses(
        (status = 200, description = "One page of the category", body = ListingResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 404, description = "Resolver not loaded", body = ErrorResponse),
    ),
    tag = "resolvers"
)]
pub async fn category(
    State(state): State<Arc<AppState>>,
    Path((key, type_id)): Path<(String, String)>,
    Query(mut params): Query<BTreeMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let page = match params.remove("page") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| AppError::Generic(format!("invalid page '{raw}'")))?,
        None => 1,
    };
    let refresh = params.remove("refresh").is_some_and(|v| v == "true");

    let listing = state
        .hub
        .category(&key, &type_id, page, params, refresh)
        .await?;
    Ok(axum::Json(ListingResponse::from(listing)))
}

#[utoipa::path(
    post,
    path = "/v1/resolvers/{key}/detail",
    params(("key" = String, Path, description = "Resolver key")),
    request_body = DetailRequest,
    responses(
        (status = 200, description = "Detail records", body = DetailListResponse),
        (status = 404, description = "Resolver not loaded", body = ErrorResponse),
    ),
    tag = "resolvers"
)]
pub async fn detail(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    axum::Json(body): axum::Json<DetailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let details = state.hub.detail(&key, body.ids).await?;
    Ok(axum::Json(DetailListResponse {
        details: details.into_iter().map(Into::into).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/v1/resolvers/{key}/play",
    params(("key" = String, Path, description = "Resolver key")),
    request_body = PlayRequest,
    responses(
        (status = 200, description = "Playable source", body = PlayableResponse),
        (status = 404, description = "Resolver not loaded", body = ErrorResponse),
    ),
    tag = "resolvers"
)]
pub async fn play(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    axum::Json(body): axum::Json<PlayRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let source = state
        .hub
        .player(&key, &body.flag, &body.id, body.extra.unwrap_or_default())
        .await?;
    Ok(axum::Json(PlayableResponse::from(source)))
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/plugins",
    responses(
        (status = 200, description = "Loaded plugins", body = PluginListResponse),
    ),
    tag = "plugins"
)]
pub async fn list_plugins(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let plugins: Vec<PluginResponse> = state.hub.plugins().into_iter().map(Into::into).collect();
    let total = plugins.len();
    axum::Json(PluginListResponse { plugins, total })
}

#[utoipa::path(
    post,
    path = "/v1/plugins",
    request_body = LoadPluginRequest,
    responses(
        (status = 201, description = "Plugin loaded", body = PluginResponse),
        (status = 409, description = "Load already in flight", body = ErrorResponse),
        (status = 422, description = "Package rejected", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "plugins"
)]
pub async fn load_plugin(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<LoadPluginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = body.into_spec()?;
    let descriptor = state.hub.load_plugin(spec).await?;
    Ok((StatusCode::CREATED, axum::Json(PluginResponse::from(descriptor))))
}

#[utoipa::path(
    delete,
    path = "/v1/plugins/{key}",
    params(("key" = String, Path, description = "Plugin key")),
    responses(
        (status = 204, description = "Plugin unloaded"),
        (status = 404, description = "Not loaded", body = ErrorResponse),
        (status = 409, description = "Load or update in flight", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "plugins"
)]
pub async fn unload_plugin(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    if state.hub.unload_plugin(&key).await {
        return StatusCode::NO_CONTENT.into_response();
    }
    match state.hub.registry().state(&key) {
        PluginState::Unloaded => not_found(format!("Plugin not loaded: {key}")),
        current => {
            let body = ErrorResponse {
                error: "conflict".to_string(),
                message: format!("Plugin {key} is {current}; try again later"),
            };
            (StatusCode::CONFLICT, axum::Json(body)).into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/plugins/{key}/update",
    params(("key" = String, Path, description = "Plugin key")),
    responses(
        (status = 200, description = "Update check result", body = UpdateInfoResponse),
        (status = 404, description = "Not loaded", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "plugins"
)]
pub async fn check_update(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state.hub.check_for_update(&key).await?;
    Ok(axum::Json(UpdateInfoResponse::from(info)))
}

#[utoipa::path(
    post,
    path = "/v1/plugins/{key}/update",
    params(("key" = String, Path, description = "Plugin key")),
    responses(
        (status = 200, description = "Active plugin after the update", body = PluginResponse),
        (status = 404, description = "Not loaded", body = ErrorResponse),
        (status = 422, description = "Update rejected, previous version kept", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "plugins"
)]
pub async fn apply_update(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = state.hub.apply_update(&key).await?;
    Ok(axum::Json(PluginResponse::from(descriptor)))
}

#[utoipa::path(
    get,
    path = "/v1/plugins/{key}/probe",
    params(("key" = String, Path, description = "Plugin key"), ProbeQuery),
    responses(
        (status = 200, description = "Per-capability probe outcome", body = ProbeResponse),
        (status = 404, description = "Not loaded", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "plugins"
)]
pub async fn probe(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<ProbeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let keyword = query.keyword.unwrap_or_else(|| "test".to_string());
    let report = state.hub.probe(&key, &keyword).await?;
    Ok(axum::Json(ProbeResponse::from(report)))
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/admin/status",
    responses(
        (status = 200, description = "Registry, pool and cache status", body = StatusResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.hub.registry_status();
    axum::Json(StatusResponse {
        loaded: registry.loaded,
        in_flight: registry.in_flight,
        pool: state.hub.pool_status().into(),
        cache: state.hub.cache_stats().await.into(),
    })
}

#[utoipa::path(
    post,
    path = "/v1/admin/cache/sweep",
    responses(
        (status = 200, description = "Entries purged", body = SweepResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn sweep_cache(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.hub.sweep_cache().await?;
    Ok(axum::Json(SweepResponse::from(report)))
}

#[utoipa::path(
    delete,
    path = "/v1/admin/cache",
    responses(
        (status = 204, description = "Cache cleared"),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn clear_cache(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.hub.clear_cache().await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Engine pool is shut down", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pool = state.hub.pool_status();
    let (status, label) = if pool.shut_down {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else {
        (StatusCode::OK, "healthy")
    };

    let response = HealthResponse {
        status: label,
        plugins: state.hub.plugins().len(),
        engines: pool.total,
    };

    (status, axum::Json(response))
}
