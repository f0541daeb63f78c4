use thiserror::Error;

/// Main error type for rangecache operations
#[derive(Debug, Error)]
pub enum RangeCacheError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Base64 decode error: {0}")]
    Decode(#[from] base64::DecodeError),
}

impl RangeCacheError {
    /// Whether the error originated in the cache store rather than the backing source
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Redis(_))
    }
}

/// Result type alias for rangecache operations
pub type Result<T> = std::result::Result<T, RangeCacheError>;
