//! Dual-mode session orchestrator.
//!
//! Owns either a WebSocket channel, or an MQTT control channel plus the UDP
//! audio channel its hello response announces. Performs the hello exchange,
//! tracks `session_id`, routes every inbound message onto one ordered
//! [`ClientEvent`] stream and exposes the outbound control/audio operations.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use xiaozhi_transport::event::{ChannelEvent, EventSender};
use xiaozhi_transport::mqtt::MqttControlChannel;
use xiaozhi_transport::udp::UdpAudioChannel;
use xiaozhi_transport::websocket::WebsocketChannel;
use xiaozhi_transport::TransportError;

use crate::audio::AudioParamsListener;
use crate::config::{ClientConfig, TokenMethod};
use crate::error::ClientError;
use crate::protocol::{self, AudioParams, AudioPlane, HelloMessage, ListenMode, MqttHelloResponse};

/// Which transport dialect to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Websocket,
    Mqtt,
}

impl FromStr for Protocol {
    type Err = ClientError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "ws" | "websocket" => Ok(Self::Websocket),
            "mqtt" => Ok(Self::Mqtt),
            other => Err(ClientError::InvalidConfig(format!("unknown protocol: {other}"))),
        }
    }
}

/// One inbound event from the session, in arrival order.
#[derive(Debug)]
pub enum ClientEvent {
    /// A parsed server JSON message (hello included).
    Json(Value),
    /// Opus audio: a WebSocket binary frame or a decrypted UDP frame.
    Binary(Vec<u8>),
    /// A background failure; the session may or may not survive it.
    Error(ClientError),
    /// A channel went away.
    Closed,
}

/// Exactly one audio channel is bound at a time: either the WebSocket's
/// binary side or the UDP channel — never both.
enum ActiveTransport {
    Websocket(WebsocketChannel),
    Mqtt {
        control: MqttControlChannel,
        audio: Option<UdpAudioChannel>,
    },
}

struct ClientInner {
    config: ClientConfig,
    session_id: std::sync::RwLock<String>,
    transport: tokio::sync::RwLock<Option<ActiveTransport>>,
    /// Armed before the hello is sent, fired by the pump on the first server
    /// hello, dropped on close.
    hello_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    /// Sender feeding the current pump; cloned into the UDP channel when an
    /// MQTT hello binds one.
    channel_events: std::sync::Mutex<Option<EventSender>>,
    params_listener: std::sync::RwLock<Option<Arc<dyn AudioParamsListener>>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

pub struct SessionClient {
    inner: Arc<ClientInner>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

impl SessionClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ClientInner {
                config,
                session_id: std::sync::RwLock::new(String::new()),
                transport: tokio::sync::RwLock::new(None),
                hello_tx: std::sync::Mutex::new(None),
                channel_events: std::sync::Mutex::new(None),
                params_listener: std::sync::RwLock::new(None),
                events: events_tx,
            }),
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        }
    }

    /// The session's event stream. Yields once; the caller owns the loop.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events_rx.lock().expect("events slot").take()
    }

    pub fn set_audio_params_listener(&self, listener: Arc<dyn AudioParamsListener>) {
        *self.inner.params_listener.write().expect("listener lock") = Some(listener);
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Server-assigned session id; empty until the hello exchange completes.
    pub fn session_id(&self) -> String {
        self.inner.session_id.read().expect("session id lock").clone()
    }

    pub async fn is_connected(&self) -> bool {
        match self.inner.transport.read().await.as_ref() {
            Some(ActiveTransport::Websocket(ws)) => ws.is_open(),
            Some(ActiveTransport::Mqtt { control, .. }) => control.is_open(),
            None => false,
        }
    }

    /// Opens the session over the chosen dialect. A flipped `cancel` flag
    /// aborts the dial or hello wait and returns [`ClientError::Cancelled`].
    pub async fn open(
        &self,
        protocol: Protocol,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<(), ClientError> {
        match protocol {
            Protocol::Websocket => self.open_websocket(cancel).await,
            Protocol::Mqtt => self.open_mqtt(cancel).await,
        }
    }

    /// Closes whatever is open, then opens the new dialect.
    pub async fn switch_protocol(
        &self,
        protocol: Protocol,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<(), ClientError> {
        self.close().await;
        self.open(protocol, cancel).await
    }

    pub async fn open_websocket(
        &self,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<(), ClientError> {
        if self.inner.config.websocket_url.is_empty() {
            return Err(ClientError::InvalidConfig("websocket url required".to_string()));
        }
        tokio::select! {
            result = self.open_websocket_inner() => result,
            _ = wait_cancelled(cancel) => {
                self.close().await;
                Err(ClientError::Cancelled)
            }
        }
    }

    async fn open_websocket_inner(&self) -> Result<(), ClientError> {
        // A fresh open supersedes any session still standing.
        self.close().await;

        let config = &self.inner.config;
        let (url, headers) = build_ws_request(config)?;
        info!(
            url = %sanitize_url(&url),
            token = config.token_method.as_str(),
            "opening websocket session"
        );

        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        *self.inner.channel_events.lock().expect("sender slot") = Some(channel_tx.clone());
        let (hello_tx, hello_rx) = oneshot::channel();
        *self.inner.hello_tx.lock().expect("hello slot") = Some(hello_tx);

        let ws = match WebsocketChannel::open(&url, &headers, channel_tx).await {
            Ok(ws) => ws,
            Err(err) => {
                self.clear_wait_state();
                return Err(err.into());
            }
        };
        *self.inner.transport.write().await = Some(ActiveTransport::Websocket(ws.clone()));
        tokio::spawn(pump(channel_rx, Arc::clone(&self.inner)));

        let hello = HelloMessage::new(
            config.protocol_version,
            AudioPlane::Websocket,
            config.audio_params.clone(),
        );
        let payload = serde_json::to_string(&hello)?;
        debug!(payload = %payload, "sending client hello");
        if let Err(err) = ws.send_text(payload).await {
            ws.close().await;
            *self.inner.transport.write().await = None;
            self.clear_wait_state();
            return Err(err.into());
        }

        match tokio::time::timeout(config.hello_timeout, hello_rx).await {
            Ok(Ok(())) => {
                info!(session_id = %self.session_id(), "session established");
                Ok(())
            }
            Ok(Err(_)) => {
                // Waiter dropped: the channel died under us mid-handshake.
                ws.close().await;
                *self.inner.transport.write().await = None;
                self.clear_wait_state();
                Err(ClientError::Transport(TransportError::Closed))
            }
            Err(_) => {
                warn!(timeout = ?config.hello_timeout, "server hello never arrived");
                ws.close().await;
                *self.inner.transport.write().await = None;
                self.clear_wait_state();
                Err(ClientError::HelloTimeout(config.hello_timeout))
            }
        }
    }

    pub async fn open_mqtt(&self, cancel: Option<watch::Receiver<bool>>) -> Result<(), ClientError> {
        if self.inner.config.mqtt.broker_url.is_empty() {
            return Err(ClientError::InvalidConfig("mqtt broker url required".to_string()));
        }
        tokio::select! {
            result = self.open_mqtt_inner() => result,
            _ = wait_cancelled(cancel) => {
                self.close().await;
                Err(ClientError::Cancelled)
            }
        }
    }

    async fn open_mqtt_inner(&self) -> Result<(), ClientError> {
        // A fresh open supersedes any session still standing.
        self.close().await;

        let config = &self.inner.config;
        let mut mqtt_config = config.mqtt.clone();
        mqtt_config.client_id = if config.client_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };
        info!(broker = %mqtt_config.broker_url, client_id = %mqtt_config.client_id, "opening mqtt session");

        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        *self.inner.channel_events.lock().expect("sender slot") = Some(channel_tx.clone());

        let control = match MqttControlChannel::open(mqtt_config, channel_tx).await {
            Ok(control) => control,
            Err(err) => {
                self.clear_wait_state();
                return Err(err.into());
            }
        };
        *self.inner.transport.write().await = Some(ActiveTransport::Mqtt {
            control: control.clone(),
            audio: None,
        });
        tokio::spawn(pump(channel_rx, Arc::clone(&self.inner)));

        let hello = HelloMessage::new(
            config.protocol_version,
            AudioPlane::Udp,
            config.audio_params.clone(),
        );
        let payload = serde_json::to_string(&hello)?;
        debug!(payload = %payload, "publishing client hello");
        if let Err(err) = control.send_text(payload.into_bytes()).await {
            control.close().await;
            *self.inner.transport.write().await = None;
            self.clear_wait_state();
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn listen_start(&self, mode: ListenMode) -> Result<(), ClientError> {
        let session_id = self.require_session()?;
        self.send_control(protocol::listen_start(&session_id, mode)).await
    }

    pub async fn listen_stop(&self, mode: ListenMode) -> Result<(), ClientError> {
        let session_id = self.require_session()?;
        self.send_control(protocol::listen_stop(&session_id, mode)).await
    }

    pub async fn detect_text(&self, text: &str) -> Result<(), ClientError> {
        let session_id = self.require_session()?;
        self.send_control(protocol::detect_text(&session_id, text)).await
    }

    /// No-op without a session.
    pub async fn abort(&self, reason: &str) -> Result<(), ClientError> {
        let session_id = self.session_id();
        if session_id.is_empty() {
            return Ok(());
        }
        self.send_control(protocol::abort(&session_id, reason)).await
    }

    /// No-op without a session.
    pub async fn goodbye(&self) -> Result<(), ClientError> {
        let session_id = self.session_id();
        if session_id.is_empty() {
            return Ok(());
        }
        self.send_control(protocol::goodbye(&session_id)).await
    }

    /// One Opus frame upstream: over UDP when bound, inline over the
    /// WebSocket otherwise.
    pub async fn send_audio(&self, opus: &[u8]) -> Result<(), ClientError> {
        let guard = self.inner.transport.read().await;
        match guard.as_ref() {
            Some(ActiveTransport::Websocket(ws)) => Ok(ws.send_binary(opus.to_vec()).await?),
            Some(ActiveTransport::Mqtt { audio: Some(udp), .. }) => Ok(udp.send(opus).await?),
            Some(ActiveTransport::Mqtt { audio: None, .. }) | None => Err(ClientError::NoTransport),
        }
    }

    /// Idempotent teardown: best-effort goodbye, close the audio channel,
    /// close the control channel, forget the session.
    pub async fn close(&self) {
        let session_id = self.session_id();
        if !session_id.is_empty() {
            if let Err(err) = self.send_control(protocol::goodbye(&session_id)).await {
                debug!(error = %err, "goodbye on close failed");
            }
        }

        let taken = self.inner.transport.write().await.take();
        match taken {
            Some(ActiveTransport::Websocket(ws)) => ws.close().await,
            Some(ActiveTransport::Mqtt { control, audio }) => {
                if let Some(udp) = audio {
                    udp.close();
                }
                control.close().await;
            }
            None => {}
        }

        self.inner.session_id.write().expect("session id lock").clear();
        self.clear_wait_state();
    }

    /// Drops the hello waiter and the pump's parked sender so the pump task
    /// can drain and exit once the channels are gone.
    fn clear_wait_state(&self) {
        self.inner.hello_tx.lock().expect("hello slot").take();
        self.inner.channel_events.lock().expect("sender slot").take();
    }

    fn require_session(&self) -> Result<String, ClientError> {
        let session_id = self.session_id();
        if session_id.is_empty() {
            return Err(ClientError::NoSession);
        }
        Ok(session_id)
    }

    async fn send_control(&self, body: Value) -> Result<(), ClientError> {
        let guard = self.inner.transport.read().await;
        match guard.as_ref() {
            Some(ActiveTransport::Websocket(ws)) => Ok(ws.send_text(body.to_string()).await?),
            Some(ActiveTransport::Mqtt { control, .. }) => {
                Ok(control.send_text(body.to_string().into_bytes()).await?)
            }
            None => Err(ClientError::NoTransport),
        }
    }
}

async fn wait_cancelled(cancel: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without flipping the flag: never cancel.
            return std::future::pending().await;
        }
    }
}

/// Translates channel events into client events, handling hello capture,
/// decoder reconfiguration and UDP channel binding along the way.
async fn pump(mut rx: mpsc::UnboundedReceiver<ChannelEvent>, inner: Arc<ClientInner>) {
    while let Some(event) = rx.recv().await {
        match event {
            ChannelEvent::Text(bytes) => handle_text(&inner, &bytes).await,
            ChannelEvent::Binary(data) => {
                let _ = inner.events.send(ClientEvent::Binary(data));
            }
            ChannelEvent::Error(err) => {
                let _ = inner.events.send(ClientEvent::Error(err.into()));
            }
            ChannelEvent::Closed => {
                let _ = inner.events.send(ClientEvent::Closed);
            }
        }
    }
}

async fn handle_text(inner: &Arc<ClientInner>, bytes: &[u8]) {
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(err) => {
            // Individual parse failures never tear the channel down.
            warn!(error = %err, "dropping unparseable server message");
            return;
        }
    };

    if value.get("type").and_then(Value::as_str) == Some("hello") {
        if let Some(session_id) = value.get("session_id").and_then(Value::as_str) {
            if !session_id.is_empty() {
                *inner.session_id.write().expect("session id lock") = session_id.to_string();
            }
        }
        if let Some(waiter) = inner.hello_tx.lock().expect("hello slot").take() {
            let _ = waiter.send(());
        }
        if let Ok(response) = serde_json::from_value::<MqttHelloResponse>(value.clone()) {
            if response.announces_udp() {
                bind_udp_audio(inner, response).await;
            }
        }
    }

    if let Some(params_value) = value.get("audio_params") {
        if !params_value.is_null() {
            match serde_json::from_value::<AudioParams>(params_value.clone()) {
                Ok(params) => {
                    let listener = inner.params_listener.read().expect("listener lock").clone();
                    if let Some(listener) = listener {
                        listener.audio_params_changed(&params);
                    }
                }
                Err(err) => warn!(error = %err, "ignoring malformed audio_params"),
            }
        }
    }

    let _ = inner.events.send(ClientEvent::Json(value));
}

/// Opens the UDP audio channel a hello response announced, replacing any
/// existing one.
async fn bind_udp_audio(inner: &Arc<ClientInner>, response: MqttHelloResponse) {
    let Some(endpoint) = response.udp else { return };
    // Only the MQTT shape binds UDP; over WebSocket audio stays inline.
    if !matches!(
        inner.transport.read().await.as_ref(),
        Some(ActiveTransport::Mqtt { .. })
    ) {
        return;
    }
    let Some(channel_tx) = inner.channel_events.lock().expect("sender slot").clone() else {
        return;
    };

    {
        let mut guard = inner.transport.write().await;
        if let Some(ActiveTransport::Mqtt { audio, .. }) = guard.as_mut() {
            if let Some(old) = audio.take() {
                old.close();
            }
        }
    }

    match UdpAudioChannel::open(
        &endpoint.server,
        endpoint.port,
        &endpoint.key_hex,
        &endpoint.nonce_hex,
        channel_tx,
    )
    .await
    {
        Ok(channel) => {
            info!(server = %endpoint.server, port = endpoint.port, "udp audio channel bound");
            let mut guard = inner.transport.write().await;
            if let Some(ActiveTransport::Mqtt { audio, .. }) = guard.as_mut() {
                *audio = Some(channel);
            } else {
                // The session moved on while we were dialling.
                channel.close();
            }
        }
        Err(err) => {
            let _ = inner.events.send(ClientEvent::Error(err.into()));
        }
    }
}

/// Applies the identity headers and the configured token placement.
fn build_ws_request(config: &ClientConfig) -> Result<(String, Vec<(String, String)>), ClientError> {
    let mut headers = vec![("Protocol-Version".to_string(), "1".to_string())];
    if !config.device_id.is_empty() {
        headers.push(("Device-Id".to_string(), config.device_id.clone()));
    }
    if !config.client_id.is_empty() {
        headers.push(("Client-Id".to_string(), config.client_id.clone()));
    }

    let mut url = config.websocket_url.clone();
    if config.enable_token && !config.auth_token.is_empty() {
        match config.token_method {
            TokenMethod::Header => {
                headers.push(("Authorization".to_string(), format!("Bearer {}", config.auth_token)));
            }
            TokenMethod::QueryAccessToken => {
                url = append_query(&url, "access_token", &config.auth_token)?;
            }
            TokenMethod::QueryToken => {
                url = append_query(&url, "token", &config.auth_token)?;
            }
        }
    }
    Ok((url, headers))
}

fn append_query(url: &str, key: &str, value: &str) -> Result<String, ClientError> {
    let mut parsed = url::Url::parse(url)
        .map_err(|e| ClientError::InvalidConfig(format!("websocket url: {e}")))?;
    parsed.query_pairs_mut().append_pair(key, value);
    Ok(parsed.to_string())
}

/// Masks token query values so URLs are loggable.
fn sanitize_url(raw: &str) -> String {
    let Ok(parsed) = url::Url::parse(raw) else {
        return raw.to_string();
    };
    if !parsed.query_pairs().any(|(k, _)| k == "access_token" || k == "token") {
        return parsed.to_string();
    }
    let mut masked = parsed.clone();
    masked.query_pairs_mut().clear();
    for (key, value) in parsed.query_pairs() {
        if key == "access_token" || key == "token" {
            masked.query_pairs_mut().append_pair(&key, "***");
        } else {
            masked.query_pairs_mut().append_pair(&key, &value);
        }
    }
    masked.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_token(method: TokenMethod) -> ClientConfig {
        ClientConfig {
            websocket_url: "ws://h/p?x=1".to_string(),
            auth_token: "T".to_string(),
            enable_token: true,
            token_method: method,
            device_id: "aa:bb:cc:dd:ee:ff".to_string(),
            client_id: "cid".to_string(),
            ..Default::default()
        }
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    #[test]
    fn header_token_method_sets_authorization() {
        let (url, headers) = build_ws_request(&config_with_token(TokenMethod::Header)).expect("build");
        assert_eq!(url, "ws://h/p?x=1");
        assert_eq!(header(&headers, "Authorization"), Some("Bearer T"));
        assert_eq!(header(&headers, "Protocol-Version"), Some("1"));
        assert_eq!(header(&headers, "Device-Id"), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(header(&headers, "Client-Id"), Some("cid"));
    }

    #[test]
    fn query_token_methods_rewrite_the_url() {
        let (url, headers) =
            build_ws_request(&config_with_token(TokenMethod::QueryAccessToken)).expect("build");
        assert_eq!(url, "ws://h/p?x=1&access_token=T");
        assert_eq!(header(&headers, "Authorization"), None);

        let (url, _) = build_ws_request(&config_with_token(TokenMethod::QueryToken)).expect("build");
        assert_eq!(url, "ws://h/p?x=1&token=T");
    }

    #[test]
    fn disabled_token_sends_no_credentials() {
        let mut config = config_with_token(TokenMethod::Header);
        config.enable_token = false;
        let (url, headers) = build_ws_request(&config).expect("build");
        assert_eq!(url, "ws://h/p?x=1");
        assert_eq!(header(&headers, "Authorization"), None);
    }

    #[test]
    fn empty_identity_headers_are_omitted() {
        let config = ClientConfig {
            websocket_url: "ws://h/".to_string(),
            ..Default::default()
        };
        let (_, headers) = build_ws_request(&config).expect("build");
        assert_eq!(header(&headers, "Device-Id"), None);
        assert_eq!(header(&headers, "Client-Id"), None);
        assert_eq!(header(&headers, "Protocol-Version"), Some("1"));
    }

    #[test]
    fn sanitize_masks_token_values_only() {
        assert_eq!(
            sanitize_url("ws://h/p?x=1&access_token=secret"),
            "ws://h/p?x=1&access_token=***"
        );
        assert_eq!(sanitize_url("ws://h/p?token=secret"), "ws://h/p?token=***");
        assert_eq!(sanitize_url("ws://h/p?x=1"), "ws://h/p?x=1");
    }

    #[test]
    fn protocol_names_parse() {
        assert_eq!("ws".parse::<Protocol>().expect("ws"), Protocol::Websocket);
        assert_eq!("websocket".parse::<Protocol>().expect("websocket"), Protocol::Websocket);
        assert_eq!("mqtt".parse::<Protocol>().expect("mqtt"), Protocol::Mqtt);
        assert!(matches!(
            "xmpp".parse::<Protocol>(),
            Err(ClientError::InvalidConfig(_))
        ));
    }
}
