//! Transport channels for the Xiaozhi session protocol.
//!
//! Three channel flavours share one event surface: the full-duplex
//! [`websocket::WebsocketChannel`] carrying JSON text and inline Opus binary,
//! the [`mqtt::MqttControlChannel`] carrying JSON only, and the
//! [`udp::UdpAudioChannel`] carrying AES-CTR framed Opus datagrams. Each
//! channel pushes [`ChannelEvent`]s into an unbounded sender supplied at open
//! time; the session layer owns the receive loop.

pub mod error;
pub mod event;
pub mod mqtt;
pub mod udp;
pub mod websocket;

pub use error::TransportError;
pub use event::{ChannelEvent, EventSender};
