use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use arachne_core::error::{AppError, LoadError, UpdateError};

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `AppError`.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn classify(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            AppError::PluginNotLoaded(_) | AppError::Update(UpdateError::NotLoaded(_)) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            AppError::UnsupportedCapability { .. } => {
                (StatusCode::BAD_REQUEST, "unsupported_capability")
            }
            AppError::SerializationError(_) | AppError::Generic(_) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            AppError::PluginLoad(LoadError::Busy(_))
            | AppError::Update(UpdateError::Validation(LoadError::Busy(_)))
            | AppError::Update(UpdateError::InvalidState { .. }) => {
                (StatusCode::CONFLICT, "conflict")
            }
            AppError::PluginLoad(_) => (StatusCode::UNPROCESSABLE_ENTITY, "load_error"),
            AppError::Update(_) => (StatusCode::UNPROCESSABLE_ENTITY, "update_error"),
            AppError::Timeout(_) | AppError::ResolverCallTimeout { .. } => {
                (StatusCode::GATEWAY_TIMEOUT, "timeout")
            }
            AppError::EngineUnavailable(_) | AppError::PoolShutdown => {
                (StatusCode::SERVICE_UNAVAILABLE, "engine_unavailable")
            }
            AppError::ResolverCallFailure { .. }
            | AppError::ResolverOutputMismatch { .. }
            | AppError::HttpError(_)
            | AppError::NetworkError(_)
            | AppError::InterceptorError { .. } => (StatusCode::BAD_GATEWAY, "resolver_error"),
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::CacheError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "cache_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.classify();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, status = status.as_u16(), "Request failed");
        }

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.0.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}
