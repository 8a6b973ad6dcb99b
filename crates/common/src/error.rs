//! Transport error types for the upstream connection.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Heartbeat timed out")]
    HeartbeatTimeout,
}

pub type Result<T> = std::result::Result<T, Error>;
