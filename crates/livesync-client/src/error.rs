//! Error types for livesync-client.

use thiserror::Error;

/// Failures of the live channel itself.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("channel received a non-text frame of {len} bytes")]
    UnexpectedFrame { len: usize },
}

/// Errors returned by the subscription manager.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscription already open: {id}")]
    AlreadyOpen { id: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors fetching a snapshot over HTTP.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("failed to decode snapshot: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<SnapshotError>,
    },
}

/// Invalid client configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} must not be empty")]
    Empty { var: &'static str },
}
