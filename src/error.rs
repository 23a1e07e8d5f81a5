//! Error types for the load sharing agent.

use thiserror::Error;

/// Result type for load sharing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in load sharing operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// mDNS error
    #[error("mDNS error: {0}")]
    Mdns(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistence error
    #[error("Persistence error: {0}")]
    Persist(String),
}
