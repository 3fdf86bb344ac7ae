use std::time::Duration;

use xiaozhi_transport::TransportError;

/// Session-level errors. Transport failures pass through transparently.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The server never answered the client hello.
    #[error("no server hello within {0:?}")]
    HelloTimeout(Duration),

    /// The caller cancelled an open in flight.
    #[error("cancelled")]
    Cancelled,

    /// Outbound operation before a session was established.
    #[error("no active session")]
    NoSession,

    /// Outbound operation with no channel bound.
    #[error("no transport bound")]
    NoTransport,

    /// OTA bootstrap request failed.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("message encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
