//! JSON wire messages of the session protocol.
//!
//! Unknown fields are ignored everywhere. Numeric audio parameters tolerate
//! both integer and float encodings because some config frontends emit
//! `16000.0` where the server docs say `16000`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

/// Negotiated audio framing, advertised in the client hello and echoed (or
/// replaced) by server hellos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    #[serde(deserialize_with = "lenient_u32")]
    pub sample_rate: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub channels: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate: 16_000,
            channels: 1,
            frame_duration: 60,
        }
    }
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let n = f64::deserialize(deserializer)?;
    Ok(n as u32)
}

fn lenient_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let n = f64::deserialize(deserializer)?;
    Ok(n as u16)
}

/// Which plane carries audio for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioPlane {
    /// Audio flows inline over the WebSocket as binary frames.
    Websocket,
    /// The server must answer with a UDP endpoint and keys.
    Udp,
}

/// Client hello, the first message on any freshly opened control channel.
#[derive(Debug, Clone, Serialize)]
pub struct HelloMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub version: u32,
    pub transport: AudioPlane,
    pub audio_params: AudioParams,
    pub features: Value,
}

impl HelloMessage {
    pub fn new(version: u32, transport: AudioPlane, audio_params: AudioParams) -> Self {
        Self {
            kind: "hello",
            version,
            transport,
            audio_params,
            features: json!({"mcp": true}),
        }
    }
}

/// Server hello on the MQTT path, announcing the session id and the UDP
/// audio endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttHelloResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub transport: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub audio_params: Option<AudioParams>,
    #[serde(default)]
    pub udp: Option<UdpEndpoint>,
}

impl MqttHelloResponse {
    /// True when this is a hello that binds a UDP audio plane.
    pub fn announces_udp(&self) -> bool {
        self.kind == "hello" && self.transport == "udp" && self.udp.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UdpEndpoint {
    pub server: String,
    #[serde(deserialize_with = "lenient_u16")]
    pub port: u16,
    #[serde(rename = "key")]
    pub key_hex: String,
    #[serde(rename = "nonce")]
    pub nonce_hex: String,
}

/// Listening mode carried on `listen` control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    Manual,
    Ptt,
    Auto,
}

impl ListenMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Ptt => "ptt",
            Self::Auto => "auto",
        }
    }
}

pub fn listen_start(session_id: &str, mode: ListenMode) -> Value {
    json!({"session_id": session_id, "type": "listen", "state": "start", "mode": mode.as_str()})
}

pub fn listen_stop(session_id: &str, mode: ListenMode) -> Value {
    json!({"session_id": session_id, "type": "listen", "state": "stop", "mode": mode.as_str()})
}

pub fn detect_text(session_id: &str, text: &str) -> Value {
    json!({"session_id": session_id, "type": "listen", "state": "detect", "text": text, "source": "text"})
}

pub fn abort(session_id: &str, reason: &str) -> Value {
    json!({"session_id": session_id, "type": "abort", "reason": reason})
}

pub fn goodbye(session_id: &str) -> Value {
    json!({"session_id": session_id, "type": "goodbye"})
}
