//! Error types for Interceptor

use thiserror::Error;

/// Main error type for Interceptor operations
#[derive(Error, Debug)]
pub enum InterceptorError {
    /// Configuration errors (missing pools, invalid URLs, bad values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Proxy/HTTP server errors
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Upstream client construction or transport errors
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Interceptor operations
pub type Result<T> = std::result::Result<T, InterceptorError>;
