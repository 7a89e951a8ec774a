use thiserror::Error;

#[derive(Error, Debug)]
pub enum AliasError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Message parse error: {0}")]
    Parse(String),

    #[error("Message too large: {size} bytes (limit {limit})")]
    MessageTooLarge { size: u64, limit: u64 },

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload encryption error: {0}")]
    Crypto(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Failed to build outbound message: {0}")]
    Build(String),
}

impl From<::config::ConfigError> for AliasError {
    fn from(err: ::config::ConfigError) -> Self {
        AliasError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AliasError>;
