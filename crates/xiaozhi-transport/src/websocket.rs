//! Full-duplex WebSocket channel: JSON text frames plus inline binary audio,
//! with ping/pong keepalive and a pong-timeout watchdog.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::TransportError;
use crate::event::{ChannelEvent, EventSender};

const USER_AGENT: &str = "XiaozhiClient/1.0";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(20);
const PING_WRITE_DEADLINE: Duration = Duration::from_secs(5);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
const PONG_TIMEOUT_MS: i64 = 10_000;
const CLOSE_WRITE_DEADLINE: Duration = Duration::from_secs(1);
const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;
const HANDSHAKE_BODY_PREFIX: usize = 4096;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Pong-timeout rule: a ping was sent, no pong has answered it, and the ping
/// is older than the allowance.
fn pong_timed_out(last_ping_ms: i64, last_pong_ms: i64, now_ms: i64) -> bool {
    last_ping_ms > 0 && last_pong_ms < last_ping_ms && now_ms - last_ping_ms > PONG_TIMEOUT_MS
}

fn handshake_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            let body_prefix = response
                .body()
                .as_deref()
                .map(|b| String::from_utf8_lossy(&b[..b.len().min(HANDSHAKE_BODY_PREFIX)]).into_owned())
                .unwrap_or_default();
            TransportError::Handshake { status, body_prefix }
        }
        other => TransportError::Handshake {
            status: 0,
            body_prefix: other.to_string(),
        },
    }
}

fn ws_error(err: WsError) -> TransportError {
    match err {
        WsError::Capacity(detail) => TransportError::Protocol(format!("frame over limit: {detail}")),
        other => TransportError::WebSocket(other.to_string()),
    }
}

struct WsInner {
    /// Write half. `close` swaps it to `None`; every sender checks the closed
    /// flag first so a `None` here only races benignly.
    writer: Mutex<Option<WsSink>>,
    closed: AtomicBool,
    closed_emitted: AtomicBool,
    last_ping_ms: AtomicI64,
    last_pong_ms: AtomicI64,
    events: EventSender,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    keepalive_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WsInner {
    fn emit_closed_once(&self) {
        if !self.closed_emitted.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Closed);
        }
    }
}

/// Tears the connection down: best-effort normal-closure frame, then drop the
/// writer and stop the background tasks. Safe to call from any task,
/// including the ones it aborts.
async fn shutdown(inner: &Arc<WsInner>) {
    if inner.closed.swap(true, Ordering::SeqCst) {
        inner.emit_closed_once();
        return;
    }
    {
        let mut guard = inner.writer.lock().await;
        if let Some(mut sink) = guard.take() {
            let frame = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }));
            let _ = timeout(CLOSE_WRITE_DEADLINE, sink.send(frame)).await;
        }
    }
    if let Some(handle) = inner.reader_task.lock().expect("reader slot").take() {
        handle.abort();
    }
    for handle in inner.keepalive_tasks.lock().expect("keepalive slots").drain(..) {
        handle.abort();
    }
    inner.emit_closed_once();
}

/// Client side of the WebSocket dialect. Text and binary frames arrive as
/// [`ChannelEvent`]s; sends go through [`send_text`](Self::send_text) and
/// [`send_binary`](Self::send_binary).
#[derive(Clone)]
pub struct WebsocketChannel {
    inner: Arc<WsInner>,
}

impl WebsocketChannel {
    /// Dials `url` with the given extra headers. The handshake is bounded at
    /// 15 s, compression stays off and read frames are capped at 10 MiB.
    pub async fn open(
        url: &str,
        headers: &[(String, String)],
        events: EventSender,
    ) -> Result<Self, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidConfig(format!("websocket url: {e}")))?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidConfig(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidConfig(format!("header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }
        request
            .headers_mut()
            .insert("User-Agent", HeaderValue::from_static(USER_AGENT));

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_FRAME_BYTES);
        config.max_frame_size = Some(MAX_FRAME_BYTES);
        let (stream, _response) = timeout(
            HANDSHAKE_TIMEOUT,
            connect_async_with_config(request, Some(config), true),
        )
        .await
        .map_err(|_| TransportError::Handshake {
            status: 0,
            body_prefix: "handshake timeout".to_string(),
        })?
        .map_err(handshake_error)?;

        let (sink, source) = stream.split();
        let inner = Arc::new(WsInner {
            writer: Mutex::new(Some(sink)),
            closed: AtomicBool::new(false),
            closed_emitted: AtomicBool::new(false),
            last_ping_ms: AtomicI64::new(0),
            last_pong_ms: AtomicI64::new(0),
            events,
            reader_task: std::sync::Mutex::new(None),
            keepalive_tasks: std::sync::Mutex::new(Vec::new()),
        });

        let reader = tokio::spawn(read_loop(source, Arc::clone(&inner)));
        *inner.reader_task.lock().expect("reader slot") = Some(reader);
        let pinger = tokio::spawn(ping_loop(Arc::clone(&inner)));
        let watchdog = tokio::spawn(watchdog_loop(Arc::clone(&inner)));
        inner
            .keepalive_tasks
            .lock()
            .expect("keepalive slots")
            .extend([pinger, watchdog]);

        Ok(Self { inner })
    }

    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.send_message(Message::Text(text)).await
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.send_message(Message::Binary(data)).await
    }

    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut guard = self.inner.writer.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;
        sink.send(message).await.map_err(ws_error)
    }

    /// Idempotent; the first call emits a single `Closed` event.
    pub async fn close(&self) {
        shutdown(&self.inner).await;
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }
}

async fn read_loop(mut source: SplitStream<WsStream>, inner: Arc<WsInner>) {
    loop {
        let next = match timeout(READ_DEADLINE, source.next()).await {
            Err(_) => {
                if !inner.closed.load(Ordering::SeqCst) {
                    let _ = inner.events.send(ChannelEvent::Error(TransportError::Io(
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "read deadline exceeded"),
                    )));
                }
                break;
            }
            Ok(next) => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                let _ = inner.events.send(ChannelEvent::Text(text.into_bytes()));
            }
            Some(Ok(Message::Binary(data))) => {
                let _ = inner.events.send(ChannelEvent::Binary(data));
            }
            Some(Ok(Message::Pong(_))) => {
                inner.last_pong_ms.store(now_ms(), Ordering::SeqCst);
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "server closed websocket");
                break;
            }
            Some(Err(err)) => {
                if !inner.closed.load(Ordering::SeqCst) {
                    let _ = inner.events.send(ChannelEvent::Error(ws_error(err)));
                }
                break;
            }
            None => break,
        }
    }
    shutdown(&inner).await;
}

async fn ping_loop(inner: Arc<WsInner>) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        inner.last_ping_ms.store(now_ms(), Ordering::SeqCst);
        let sent = {
            let mut guard = inner.writer.lock().await;
            match guard.as_mut() {
                Some(sink) => timeout(
                    PING_WRITE_DEADLINE,
                    sink.send(Message::Ping(b"ping".to_vec())),
                )
                .await
                .map_err(|_| TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "ping write deadline exceeded",
                )))
                .and_then(|r| r.map_err(ws_error)),
                None => return,
            }
        };
        if let Err(err) = sent {
            let _ = inner.events.send(ChannelEvent::Error(err));
            shutdown(&inner).await;
            return;
        }
    }
}

async fn watchdog_loop(inner: Arc<WsInner>) {
    let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let last_ping_ms = inner.last_ping_ms.load(Ordering::SeqCst);
        let last_pong_ms = inner.last_pong_ms.load(Ordering::SeqCst);
        if pong_timed_out(last_ping_ms, last_pong_ms, now_ms()) {
            let _ = inner.events.send(ChannelEvent::Error(TransportError::KeepaliveTimeout {
                last_ping_ms,
                last_pong_ms,
            }));
            shutdown(&inner).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;

    /// Minimal loopback server: accepts one connection and echoes every
    /// text/binary message back.
    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws accept");
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(_) | Message::Binary(_) => {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });
        format!("ws://{addr}")
    }

    #[test]
    fn pong_timeout_rule() {
        // Never pinged.
        assert!(!pong_timed_out(0, 0, 100_000));
        // Ping answered.
        assert!(!pong_timed_out(50_000, 51_000, 70_000));
        // Ping unanswered but still within the allowance.
        assert!(!pong_timed_out(50_000, 0, 55_000));
        // Ping unanswered past the allowance.
        assert!(pong_timed_out(50_000, 0, 61_000));
        // A pong older than the latest ping does not count.
        assert!(pong_timed_out(50_000, 40_000, 61_000));
    }

    #[tokio::test]
    async fn text_and_binary_roundtrip() {
        let url = spawn_echo_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = WebsocketChannel::open(&url, &[], tx).await.expect("open");

        channel.send_text("{\"type\":\"ping\"}".to_string()).await.expect("send text");
        channel.send_binary(vec![1, 2, 3]).await.expect("send binary");

        let first = rx.recv().await.expect("text event");
        match first {
            ChannelEvent::Text(text) => assert_eq!(text, b"{\"type\":\"ping\"}"),
            other => panic!("expected text, got {other:?}"),
        }
        let second = rx.recv().await.expect("binary event");
        match second {
            ChannelEvent::Binary(data) => assert_eq!(data, vec![1, 2, 3]),
            other => panic!("expected binary, got {other:?}"),
        }
        channel.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_sends() {
        let url = spawn_echo_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = WebsocketChannel::open(&url, &[], tx).await.expect("open");

        channel.close().await;
        channel.close().await;
        assert!(!channel.is_open());

        let err = channel
            .send_text("late".to_string())
            .await
            .expect_err("send after close");
        assert!(matches!(err, TransportError::Closed));

        let ev = rx.recv().await.expect("closed event");
        assert!(matches!(ev, ChannelEvent::Closed));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "exactly one closed event");
    }

    #[tokio::test]
    async fn server_close_emits_single_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws accept");
            ws.close(None).await.expect("server close");
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _channel = WebsocketChannel::open(&format!("ws://{addr}"), &[], tx)
            .await
            .expect("open");

        let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert!(matches!(ev, ChannelEvent::Closed), "got {ev:?}");
    }

    #[tokio::test]
    async fn dial_failure_reports_handshake() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = WebsocketChannel::open("ws://127.0.0.1:1/unreachable", &[], tx).await;
        assert!(matches!(result, Err(TransportError::Handshake { .. })));
    }
}
