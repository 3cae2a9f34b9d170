use http::StatusCode;
use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur while registering rules or evaluating requests.
///
/// Rejections (exceeded or banned callers) are not errors: they are returned as
/// [`crate::limiter::Outcome::Rejected`] so that a store failure can never be
/// mistaken for a 429 and a 429 can never turn into a generic failure.
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Settings error: {0}")]
    Settings(#[from] ::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RateLimitError {
    /// Whether the error came from the counter backend.
    ///
    /// Only these errors are eligible for `skip_on_error`.
    pub fn is_store_error(&self) -> bool {
        matches!(self, RateLimitError::Redis(_) | RateLimitError::Store(_))
    }

    /// Status code a host should answer with when it surfaces this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RateLimitError::Redis(_) | RateLimitError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
