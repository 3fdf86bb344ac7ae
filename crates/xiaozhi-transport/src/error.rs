/// Channel-level errors, surfaced both as return values from channel
/// operations and inside [`crate::ChannelEvent::Error`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Required endpoint missing or unparseable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Audio key failed hex decoding or is not 16 bytes.
    #[error("invalid audio key: {0}")]
    InvalidKey(String),

    /// Audio nonce failed hex decoding or is not 16 bytes.
    #[error("invalid audio nonce: {0}")]
    InvalidNonce(String),

    /// Remote resolution or local socket setup failed.
    #[error("resolve/bind failed: {0}")]
    DnsOrBind(#[source] std::io::Error),

    /// The opening handshake was refused or timed out. `body_prefix` holds at
    /// most 4096 bytes of the HTTP response body, when one exists.
    #[error("handshake failed: status={status} body={body_prefix:?}")]
    Handshake { status: u16, body_prefix: String },

    /// Operation on a channel whose close flag is already set, or whose read
    /// side has exited.
    #[error("channel closed")]
    Closed,

    /// Malformed inbound data: bad packet type, length mismatch, oversized
    /// frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer stopped answering pings.
    #[error("keepalive timeout: last_ping_ms={last_ping_ms} last_pong_ms={last_pong_ms}")]
    KeepaliveTimeout { last_ping_ms: i64, last_pong_ms: i64 },

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
