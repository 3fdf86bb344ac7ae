use tokio::sync::mpsc;

use crate::error::TransportError;

/// One inbound event from a channel, in transport order.
///
/// `Closed` is emitted exactly once per channel lifetime, after which no
/// further events follow from that channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A text message (WebSocket text frame or MQTT publish payload).
    Text(Vec<u8>),
    /// A binary message (WebSocket binary frame or a decrypted UDP Opus frame).
    Binary(Vec<u8>),
    /// A background failure. The channel may keep running (UDP parse errors,
    /// MQTT reconnects) or follow up with `Closed`.
    Error(TransportError),
    /// The channel is gone. Terminal.
    Closed,
}

pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;
