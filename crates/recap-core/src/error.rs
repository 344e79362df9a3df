//! Error types for recap.

use thiserror::Error;

/// Result type alias using recap's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for recap operations.
///
/// The first group of variants mirrors the failure shapes the retry engine
/// tells apart; domain collaborators should pick the closest one so that
/// classification does not have to rely on message text alone.
#[derive(Error, Debug)]
pub enum Error {
    /// The content source has nothing usable (no transcript, private item, ...)
    #[error("Content unavailable: {0}")]
    ContentUnavailable(String),

    /// Upstream service is throttling requests
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Upstream account quota or billing limit reached
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Network/connection failure talking to an upstream service
    #[error("Network error: {0}")]
    Network(String),

    /// Summary generation or model invocation failed
    #[error("Model error: {0}")]
    Model(String),

    /// Local infrastructure failure (disk, memory, cache store)
    #[error("System error: {0}")]
    System(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation exceeded its time budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Maximum concurrent streaming connections reached
    #[error("Connection limit reached: {0}")]
    ConnectionLimit(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
