//! Crate error types

use thiserror::Error;

/// Pocketclaw error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Relay error
    #[error("Relay error: {0}")]
    Relay(String),

    /// Working-copy error. The message is surfaced verbatim to the mobile
    /// session, so it carries no prefix.
    #[error("{0}")]
    Workspace(String),

    /// Code-tool invocation error. Surfaced verbatim to the mobile session.
    #[error("{0}")]
    Tool(String),

    /// Task pipeline error. Surfaced verbatim to the mobile session.
    #[error("{0}")]
    Task(String),

    /// Forge API error
    #[error("Forge error: {0}")]
    Forge(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Result type alias for pocketclaw operations
pub type Result<T> = std::result::Result<T, Error>;
