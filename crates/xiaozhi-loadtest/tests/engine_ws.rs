//! Engine tests against an in-process auto-responding WebSocket server.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use xiaozhi_client::{ClientConfig, Protocol};
use xiaozhi_loadtest::{LoadTestEngine, LoadTestError, LoadTestEvent, LoadTestOptions};

/// Accepts any number of connections; answers hellos with a session id and
/// every detect with a tts response. `respond_to_detect = false` makes
/// requests time out.
async fn spawn_auto_server(respond_to_detect: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Text(text) => {
                            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                                continue;
                            };
                            match value.get("type").and_then(Value::as_str) {
                                Some("hello") => {
                                    let reply = r#"{"type":"hello","session_id":"LT1","transport":"websocket"}"#;
                                    if ws.send(Message::Text(reply.to_string())).await.is_err() {
                                        return;
                                    }
                                }
                                Some("listen") if value["state"] == "detect" => {
                                    if !respond_to_detect {
                                        continue;
                                    }
                                    let reply = r#"{"type":"tts","text":"ok"}"#;
                                    if ws.send(Message::Text(reply.to_string())).await.is_err() {
                                        return;
                                    }
                                }
                                _ => {}
                            }
                        }
                        Message::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });
    addr
}

fn options(addr: SocketAddr, concurrency: usize, per_conn: usize) -> LoadTestOptions {
    LoadTestOptions {
        protocol: Protocol::Websocket,
        config: ClientConfig {
            websocket_url: format!("ws://{addr}/"),
            ..Default::default()
        },
        concurrency,
        requests_per_conn: per_conn,
        message: "hello".to_string(),
        resp_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn full_run_produces_a_complete_summary() {
    let addr = spawn_auto_server(true).await;
    let engine = LoadTestEngine::new();
    let mut events = engine.start(options(addr, 2, 3)).expect("start");

    let summary = loop {
        match tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("event in time")
            .expect("event")
        {
            LoadTestEvent::Progress(_) => continue,
            LoadTestEvent::Done(summary) => break summary,
        }
    };

    assert_eq!(summary.protocol, "ws");
    assert_eq!(summary.concurrency, 2);
    assert_eq!(summary.requests_per_conn, 3);
    assert_eq!(summary.total_requests, 6);
    assert_eq!(summary.connect_ok, 2);
    assert_eq!(summary.connect_fail, 0);
    assert_eq!(summary.req_ok, 6);
    assert_eq!(summary.req_timeout, 0);
    assert!(summary.done);

    assert_eq!(summary.hello_latency_ms.count, 2);
    assert_eq!(summary.resp_latency_ms.count, 6);
    assert!(summary.resp_latency_ms.min <= summary.resp_latency_ms.p50);
    assert!(summary.resp_latency_ms.p50 <= summary.resp_latency_ms.max);
    assert!(summary.duration_ms >= 0);

    assert!(!engine.is_running(), "engine idle after completion");
}

#[tokio::test]
async fn refuses_a_second_concurrent_run() {
    let addr = spawn_auto_server(true).await;
    let engine = LoadTestEngine::new();
    let mut events = engine.start(options(addr, 1, 2)).expect("start");

    let second = engine.start(options(addr, 1, 1));
    assert!(matches!(second, Err(LoadTestError::AlreadyRunning)));

    // Drain to completion; afterwards a new run is accepted.
    loop {
        match tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("event in time")
            .expect("event")
        {
            LoadTestEvent::Done(_) => break,
            LoadTestEvent::Progress(_) => continue,
        }
    }
    let mut events = engine.start(options(addr, 1, 1)).expect("restart");
    loop {
        match tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("event in time")
            .expect("event")
        {
            LoadTestEvent::Done(_) => break,
            LoadTestEvent::Progress(_) => continue,
        }
    }
}

#[tokio::test]
async fn stop_interrupts_waiting_workers() {
    let addr = spawn_auto_server(false).await;
    let engine = LoadTestEngine::new();
    let mut options = options(addr, 2, 5);
    options.resp_timeout = Duration::from_secs(60);
    let mut events = engine.start(options).expect("start");

    let stopper = engine.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        stopper.stop();
    });

    let summary = loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("event in time")
            .expect("event")
        {
            LoadTestEvent::Progress(_) => continue,
            LoadTestEvent::Done(summary) => break summary,
        }
    };

    assert!(summary.done);
    assert_eq!(summary.connect_ok, 2);
    assert!(summary.req_ok == 0, "no responses were ever sent");
    assert!(summary.duration_ms < 10_000, "stop cut the run short");
    assert!(!engine.is_running());
}

#[tokio::test]
async fn rejects_missing_endpoint() {
    let engine = LoadTestEngine::new();
    let result = engine.start(LoadTestOptions {
        protocol: Protocol::Websocket,
        config: ClientConfig::default(),
        concurrency: 1,
        requests_per_conn: 1,
        message: "hello".to_string(),
        resp_timeout: Duration::from_secs(1),
    });
    assert!(matches!(result, Err(LoadTestError::InvalidOptions(_))));
}
