//! Error types for rate limiting operations.

use thiserror::Error;

/// Main error type for rate limiter construction and calls.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// A limiter was built with a non-positive limit, capacity or interval.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A call received an argument it cannot act on. No state was touched.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The state store could not be reached or the transaction failed to run.
    ///
    /// Callers decide whether this means allow or deny.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        RateLimitError::BackendUnavailable(err.to_string())
    }
}

impl From<::config::ConfigError> for RateLimitError {
    fn from(err: ::config::ConfigError) -> Self {
        RateLimitError::Configuration(err.to_string())
    }
}

impl RateLimitError {
    /// Whether the error came from the state store rather than the caller.
    pub fn is_backend(&self) -> bool {
        matches!(self, RateLimitError::BackendUnavailable(_))
    }
}

/// Result type alias for rate limiting operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_error_maps_to_backend_unavailable() {
        let err: RateLimitError =
            redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into();
        assert!(err.is_backend());
        assert!(err.to_string().starts_with("Backend unavailable"));
    }

    #[test]
    fn test_configuration_error_display() {
        let err = RateLimitError::Configuration("limit must be positive".to_string());
        assert_eq!(err.to_string(), "Configuration error: limit must be positive");
        assert!(!err.is_backend());
    }
}
