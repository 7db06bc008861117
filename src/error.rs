//! Crate-level error types
//!
//! Pipeline failures never surface through this type; they are recovered
//! locally and reported as [`ProcessEvent::Error`](crate::process::ProcessEvent).
//! `Error` covers the fallible edges: loading configuration, binding the
//! live-view listener and talking to a viewer socket.

use thiserror::Error;

/// Error type for camrelay operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure (bind, accept, reading config)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration missing or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Result alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;
