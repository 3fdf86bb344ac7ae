//! Session client for the Xiaozhi voice-assistant protocol.
//!
//! The client speaks two transport dialects carrying the same session
//! protocol: a full-duplex WebSocket (JSON text + inline Opus binary), and
//! MQTT control plus an encrypted UDP audio path announced by the server's
//! hello response. [`SessionClient`] negotiates the session, routes inbound
//! messages onto a single [`ClientEvent`] stream and exposes the outbound
//! control and audio operations.

pub mod audio;
pub mod config;
pub mod device_id;
pub mod error;
pub mod ota;
pub mod protocol;
pub mod session;

pub use config::{ClientConfig, TokenMethod};
pub use error::ClientError;
pub use protocol::{AudioParams, ListenMode};
pub use session::{ClientEvent, Protocol, SessionClient};
