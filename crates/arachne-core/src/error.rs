use thiserror::Error;

/// Application-wide error types for Arachne.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed with a non-success status or a malformed request.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// An interceptor in the network hook chain failed.
    #[error("Interceptor '{name}' failed: {message}")]
    InterceptorError { name: String, message: String },

    /// No engine could be leased in time. A "try again later" signal.
    #[error("No engine available for resolver '{0}'")]
    EngineUnavailable(String),

    /// The engine pool has been shut down.
    #[error("Engine pool is shut down")]
    PoolShutdown,

    /// The requested resolver is not loaded.
    #[error("Plugin '{0}' is not loaded")]
    PluginNotLoaded(String),

    /// The resolver does not expose the requested capability.
    #[error("Resolver '{key}' does not support {capability}")]
    UnsupportedCapability { key: String, capability: String },

    /// The resolver raised a typed failure.
    #[error("Resolver '{key}' failed: {message}")]
    ResolverCallFailure { key: String, message: String },

    /// The resolver call exceeded its per-call timeout.
    #[error("Resolver '{key}' timed out after {timeout_ms} ms")]
    ResolverCallTimeout { key: String, timeout_ms: u64 },

    /// The resolver returned a payload of the wrong shape for the call.
    #[error("Resolver '{key}' returned {actual}, expected {expected}")]
    ResolverOutputMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Cache I/O failed.
    #[error("Cache error: {0}")]
    CacheError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Loading a plugin package failed.
    #[error(transparent)]
    PluginLoad(#[from] LoadError),

    /// Updating a plugin failed.
    #[error(transparent)]
    Update(#[from] UpdateError),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::EngineUnavailable(_)
            | AppError::ResolverCallTimeout { .. }
            | AppError::ResolverCallFailure { .. } => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }
}

/// Failure loading or validating a single plugin package.
///
/// Always fatal to that package only; the registry keeps serving the rest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Unsafe content detected: {}", findings.join(", "))]
    UnsafeContentDetected { findings: Vec<String> },

    #[error("Package '{0}' exposes no resolver entry points")]
    EntryPointNotFound(String),

    #[error("Package is {size} bytes, limit is {limit}")]
    SizeLimitExceeded { size: u64, limit: u64 },

    #[error("Package source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Invalid package: {0}")]
    InvalidPackage(String),

    #[error("Plugin '{0}' is already being loaded or updated")]
    Busy(String),
}

/// Failure checking or applying a plugin update.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Plugin '{0}' is not loaded")]
    NotLoaded(String),

    #[error("Update validation failed: {0}")]
    Validation(#[from] LoadError),

    #[error("Update drops capabilities: {}", lost.join(", "))]
    CapabilityRegression { lost: Vec<String> },

    #[error("Plugin '{key}' cannot move from {from} to {to}")]
    InvalidState {
        key: String,
        from: String,
        to: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::EngineUnavailable("a".into()).is_retryable());
        assert!(
            AppError::ResolverCallTimeout {
                key: "a".into(),
                timeout_ms: 100,
            }
            .is_retryable()
        );
        assert!(AppError::HttpError("connect refused".into()).is_retryable());
        assert!(!AppError::HttpError("HTTP 404".into()).is_retryable());
        assert!(!AppError::PluginNotLoaded("a".into()).is_retryable());
        assert!(!AppError::PoolShutdown.is_retryable());
    }

    #[test]
    fn test_load_error_converts_transparently() {
        let err: AppError = LoadError::EntryPointNotFound("demo".into()).into();
        assert_eq!(
            err.to_string(),
            "Package 'demo' exposes no resolver entry points"
        );
    }

    #[test]
    fn test_unsafe_content_lists_findings() {
        let err = LoadError::UnsafeContentDetected {
            findings: vec!["Runtime.exec".into(), "System.exit".into()],
        };
        assert_eq!(
            err.to_string(),
            "Unsafe content detected: Runtime.exec, System.exit"
        );
    }
}
