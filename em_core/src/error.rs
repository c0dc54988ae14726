use std::time::Duration;

/// Core error type for enmon
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection pool not initialized. Call initialize() first.")]
    NotInitialized,

    #[error("Circuit breaker is OPEN - connections unavailable")]
    CircuitOpen,

    #[error("Timeout acquiring connection after {0:?}")]
    AcquireTimeout(Duration),

    #[error("Failed to acquire connection: {0}")]
    Acquire(String),

    #[error("Query execution error: {0}")]
    Query(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether callers should surface this as "service unavailable" (503 class)
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::NotInitialized
                | Error::CircuitOpen
                | Error::AcquireTimeout(_)
                | Error::Acquire(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
