//! MQTT control plane. JSON control messages ride publish/subscribe at QoS 1;
//! audio never does — the hello response names a UDP endpoint for that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::event::{ChannelEvent, EventSender};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(100);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_KEEPALIVE_SECS: u64 = 240;

/// Everything needed to reach the broker.
#[derive(Debug, Clone)]
pub struct MqttChannelConfig {
    pub broker_url: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub publish_topic: String,
    /// The literal string `"null"` means "do not subscribe".
    pub subscribe_topic: String,
    pub keepalive_secs: u64,
}

impl Default for MqttChannelConfig {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
            publish_topic: String::new(),
            subscribe_topic: String::new(),
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
        }
    }
}

/// Splits a broker URL into host, port and TLS flag. `tcp://`/`mqtt://` are
/// plain (default port 1883), `ssl://`/`mqtts://` are TLS (default 8883).
fn parse_broker_url(broker_url: &str) -> Result<(String, u16, bool), TransportError> {
    let url = url::Url::parse(broker_url)
        .map_err(|e| TransportError::InvalidConfig(format!("mqtt broker url: {e}")))?;
    let tls = match url.scheme() {
        "tcp" | "mqtt" => false,
        "ssl" | "mqtts" => true,
        other => {
            return Err(TransportError::InvalidConfig(format!(
                "unsupported mqtt scheme: {other}"
            )))
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidConfig("mqtt broker url has no host".to_string()))?
        .to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });
    Ok((host, port, tls))
}

/// `"null"` is the wire-level sentinel for a publish-only session.
fn effective_subscription(topic: &str) -> Option<&str> {
    (topic != "null" && !topic.is_empty()).then_some(topic)
}

struct MqttInner {
    client: AsyncClient,
    publish_topic: String,
    closed: AtomicBool,
    closed_emitted: AtomicBool,
    events: EventSender,
    poll_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MqttInner {
    fn emit_closed_once(&self) {
        if !self.closed_emitted.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Closed);
        }
    }
}

/// Publish/subscribe control channel over MQTT v3.1.1.
#[derive(Clone)]
pub struct MqttControlChannel {
    inner: Arc<MqttInner>,
}

impl MqttControlChannel {
    /// Connects (bounded at 20 s), subscribes at QoS 1 unless the subscribe
    /// topic is `"null"`, then keeps polling in the background with
    /// auto-reconnect and re-subscribe.
    pub async fn open(config: MqttChannelConfig, events: EventSender) -> Result<Self, TransportError> {
        if config.broker_url.is_empty() {
            return Err(TransportError::InvalidConfig("mqtt broker url required".to_string()));
        }
        let (host, port, tls) = parse_broker_url(&config.broker_url)?;

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs.max(1)));
        if tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        if !config.username.is_empty() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        wait_for_connack(&mut eventloop).await?;

        let subscription = effective_subscription(&config.subscribe_topic).map(str::to_string);
        if let Some(topic) = &subscription {
            client
                .subscribe(topic.clone(), QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::Mqtt(e.to_string()))?;
        }

        let inner = Arc::new(MqttInner {
            client,
            publish_topic: config.publish_topic,
            closed: AtomicBool::new(false),
            closed_emitted: AtomicBool::new(false),
            events,
            poll_task: std::sync::Mutex::new(None),
        });

        let task = tokio::spawn(poll_loop(eventloop, Arc::clone(&inner), subscription));
        *inner.poll_task.lock().expect("poll slot") = Some(task);

        Ok(Self { inner })
    }

    /// Publishes one control payload at QoS 1, bounded at 10 s.
    pub async fn send_text(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        timeout(
            PUBLISH_TIMEOUT,
            self.inner
                .client
                .publish(self.inner.publish_topic.clone(), QoS::AtLeastOnce, false, data),
        )
        .await
        .map_err(|_| TransportError::Mqtt("publish timeout".to_string()))?
        .map_err(|e| TransportError::Mqtt(e.to_string()))
    }

    /// Audio is never carried on the control plane.
    pub async fn send_binary(&self, _data: Vec<u8>) -> Result<(), TransportError> {
        Err(TransportError::Protocol(
            "mqtt control channel does not carry binary; route audio over udp".to_string(),
        ))
    }

    /// Idempotent; disconnects with a 100 ms bound and emits `Closed` once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = timeout(DISCONNECT_TIMEOUT, self.inner.client.disconnect()).await;
        if let Some(handle) = self.inner.poll_task.lock().expect("poll slot").take() {
            handle.abort();
        }
        self.inner.emit_closed_once();
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, eventloop.poll())
            .await
            .map_err(|_| TransportError::Handshake {
                status: 0,
                body_prefix: "mqtt connect timeout".to_string(),
            })?;
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(TransportError::Handshake {
                    status: 0,
                    body_prefix: format!("mqtt connection refused: {:?}", ack.code),
                });
            }
            Ok(_) => continue,
            Err(err) => {
                return Err(TransportError::Handshake {
                    status: 0,
                    body_prefix: err.to_string(),
                })
            }
        }
    }
}

async fn poll_loop(mut eventloop: EventLoop, inner: Arc<MqttInner>, subscription: Option<String>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = inner.events.send(ChannelEvent::Text(publish.payload.to_vec()));
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Reconnected; the broker forgot our subscription.
                debug!("mqtt reconnected");
                if let Some(topic) = &subscription {
                    if let Err(err) = inner.client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                        warn!(error = %err, "mqtt re-subscribe failed");
                        let _ = inner
                            .events
                            .send(ChannelEvent::Error(TransportError::Mqtt(err.to_string())));
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                let _ = inner
                    .events
                    .send(ChannelEvent::Error(TransportError::Mqtt(err.to_string())));
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
    inner.emit_closed_once();
}
