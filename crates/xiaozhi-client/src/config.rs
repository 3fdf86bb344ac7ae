use std::time::Duration;

use xiaozhi_transport::mqtt::MqttChannelConfig;

use crate::device_id;
use crate::ota::WebsocketBootstrap;
use crate::protocol::AudioParams;

/// Where the bearer token rides on the WebSocket handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenMethod {
    /// `Authorization: Bearer <token>` header. Also the fallback for any
    /// unrecognised method name.
    #[default]
    Header,
    /// `?access_token=<token>` query parameter.
    QueryAccessToken,
    /// `?token=<token>` query parameter.
    QueryToken,
}

impl TokenMethod {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "query_access_token" => Self::QueryAccessToken,
            "query_token" => Self::QueryToken,
            _ => Self::Header,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::QueryAccessToken => "query_access_token",
            Self::QueryToken => "query_token",
        }
    }
}

/// Everything a [`crate::SessionClient`] needs, for either protocol.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    /// Lowercased MAC of the preferred physical interface by default; see
    /// [`ClientConfig::with_default_device_id`].
    pub device_id: String,
    pub auth_token: String,
    pub enable_token: bool,
    pub token_method: TokenMethod,
    pub protocol_version: u32,
    pub audio_params: AudioParams,
    pub hello_timeout: Duration,
    pub websocket_url: String,
    pub mqtt: MqttChannelConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            device_id: String::new(),
            auth_token: String::new(),
            enable_token: false,
            token_method: TokenMethod::Header,
            protocol_version: 3,
            audio_params: AudioParams::default(),
            hello_timeout: Duration::from_secs(10),
            websocket_url: String::new(),
            mqtt: MqttChannelConfig {
                publish_topic: "devices/+/tx".to_string(),
                subscribe_topic: "devices/+/rx".to_string(),
                ..Default::default()
            },
        }
    }
}

impl ClientConfig {
    /// Fills an empty `device_id` from the system: the MAC of the first
    /// physical interface that owns the default route. Leaves an explicit id
    /// untouched. Performs a UDP dial, so call it once at setup, not per
    /// connection.
    pub fn with_default_device_id(mut self) -> Self {
        if self.device_id.is_empty() {
            if let Some(id) = device_id::default_device_id() {
                self.device_id = id;
            }
        }
        self
    }

    /// Adopts the WebSocket endpoint handed out by the OTA bootstrap. Only
    /// `url` and `token` are consumed.
    pub fn apply_bootstrap(&mut self, bootstrap: &WebsocketBootstrap) {
        if !bootstrap.url.is_empty() {
            self.websocket_url = bootstrap.url.clone();
        }
        if !bootstrap.token.is_empty() {
            self.auth_token = bootstrap.token.clone();
            self.enable_token = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_expectations() {
        let config = ClientConfig::default();
        assert_eq!(config.protocol_version, 3);
        assert_eq!(config.hello_timeout, Duration::from_secs(10));
        assert_eq!(config.audio_params, AudioParams::default());
        assert_eq!(config.mqtt.keepalive_secs, 240);
        assert_eq!(config.mqtt.publish_topic, "devices/+/tx");
        assert_eq!(config.mqtt.subscribe_topic, "devices/+/rx");
        assert!(!config.enable_token);
    }

    #[test]
    fn unknown_token_method_falls_back_to_header() {
        assert_eq!(TokenMethod::parse("header"), TokenMethod::Header);
        assert_eq!(TokenMethod::parse("query_access_token"), TokenMethod::QueryAccessToken);
        assert_eq!(TokenMethod::parse("query_token"), TokenMethod::QueryToken);
        assert_eq!(TokenMethod::parse("basic-auth"), TokenMethod::Header);
        assert_eq!(TokenMethod::parse(""), TokenMethod::Header);
    }

    #[test]
    fn bootstrap_overlays_url_and_token() {
        let mut config = ClientConfig::default();
        config.apply_bootstrap(&WebsocketBootstrap {
            url: "wss://gw.example.com/xiaozhi/v1/".to_string(),
            token: "tok".to_string(),
        });
        assert_eq!(config.websocket_url, "wss://gw.example.com/xiaozhi/v1/");
        assert_eq!(config.auth_token, "tok");
        assert!(config.enable_token);

        // Empty fields leave existing values alone.
        config.apply_bootstrap(&WebsocketBootstrap {
            url: String::new(),
            token: String::new(),
        });
        assert_eq!(config.websocket_url, "wss://gw.example.com/xiaozhi/v1/");
        assert_eq!(config.auth_token, "tok");
    }
}
