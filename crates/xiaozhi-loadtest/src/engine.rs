//! The load-test engine: N concurrent session clients, M request/response
//! cycles each, shared atomic counters, one progress snapshot per second and
//! a final percentile summary.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use xiaozhi_client::{ClientConfig, ClientEvent, ListenMode, Protocol, SessionClient};

use crate::stats::LatencyStats;

/// Per-request response channel depth; late extra responses are dropped.
const RESPONSE_CHANNEL_CAPACITY: usize = 16;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LoadTestOptions {
    pub protocol: Protocol,
    pub config: ClientConfig,
    /// Number of concurrent connections.
    pub concurrency: usize,
    /// Request/response cycles per connection.
    pub requests_per_conn: usize,
    /// Text template; each request appends ` #<worker>.<cycle>`.
    pub message: String,
    pub resp_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub protocol: String,
    pub connect_ok: i64,
    pub connect_fail: i64,
    pub req_ok: i64,
    pub req_timeout: i64,
    pub errors: i64,
    pub closed: i64,
    pub done: i64,
    pub total: usize,
    pub elapsed_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadTestSummary {
    pub protocol: String,
    pub concurrency: usize,
    pub requests_per_conn: usize,
    pub total_requests: usize,
    pub connect_ok: i64,
    pub connect_fail: i64,
    pub req_ok: i64,
    pub req_timeout: i64,
    pub errors: i64,
    pub closed: i64,
    pub hello_latency_ms: LatencyStats,
    pub resp_latency_ms: LatencyStats,
    pub duration_ms: i64,
    pub done: bool,
}

#[derive(Debug)]
pub enum LoadTestEvent {
    Progress(ProgressSnapshot),
    Done(LoadTestSummary),
}

#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    #[error("a load test is already running")]
    AlreadyRunning,
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

#[derive(Default)]
struct Counters {
    connect_ok: AtomicI64,
    connect_fail: AtomicI64,
    req_ok: AtomicI64,
    req_timeout: AtomicI64,
    errors: AtomicI64,
    closed: AtomicI64,
    done_req: AtomicI64,
}

struct SharedRun {
    options: LoadTestOptions,
    protocol_name: String,
    counters: Counters,
    hello_samples: Mutex<Vec<f64>>,
    resp_samples: Mutex<Vec<f64>>,
    started: Instant,
    total_requests: usize,
}

/// Single-run engine: `start` refuses while a run is in flight.
#[derive(Clone, Default)]
pub struct LoadTestEngine {
    stop: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl LoadTestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.stop.lock().expect("engine state").is_some()
    }

    /// Kicks off a run and returns its event stream: one progress snapshot
    /// per second, then the final summary.
    pub fn start(
        &self,
        options: LoadTestOptions,
    ) -> Result<mpsc::UnboundedReceiver<LoadTestEvent>, LoadTestError> {
        if options.concurrency == 0 {
            return Err(LoadTestError::InvalidOptions("concurrency must be >= 1".to_string()));
        }
        match options.protocol {
            Protocol::Websocket if options.config.websocket_url.is_empty() => {
                return Err(LoadTestError::InvalidOptions("websocket url required".to_string()))
            }
            Protocol::Mqtt if options.config.mqtt.broker_url.is_empty() => {
                return Err(LoadTestError::InvalidOptions("mqtt broker url required".to_string()))
            }
            _ => {}
        }

        let stop_rx = {
            let mut guard = self.stop.lock().expect("engine state");
            if guard.is_some() {
                return Err(LoadTestError::AlreadyRunning);
            }
            let (stop_tx, stop_rx) = watch::channel(false);
            *guard = Some(stop_tx);
            stop_rx
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedRun {
            protocol_name: match options.protocol {
                Protocol::Websocket => "ws".to_string(),
                Protocol::Mqtt => "mqtt".to_string(),
            },
            total_requests: options.concurrency * options.requests_per_conn,
            counters: Counters::default(),
            hello_samples: Mutex::new(Vec::new()),
            resp_samples: Mutex::new(Vec::new()),
            started: Instant::now(),
            options,
        });
        tokio::spawn(run(shared, stop_rx, event_tx, Arc::clone(&self.stop)));
        Ok(event_rx)
    }

    /// Cancels the run in flight, if any. Workers stop at their next
    /// suspension point and close their clients; the summary still arrives.
    pub fn stop(&self) {
        if let Some(stop_tx) = self.stop.lock().expect("engine state").as_ref() {
            let _ = stop_tx.send(true);
        }
    }
}

fn snapshot(shared: &SharedRun) -> ProgressSnapshot {
    ProgressSnapshot {
        protocol: shared.protocol_name.clone(),
        connect_ok: shared.counters.connect_ok.load(Ordering::Relaxed),
        connect_fail: shared.counters.connect_fail.load(Ordering::Relaxed),
        req_ok: shared.counters.req_ok.load(Ordering::Relaxed),
        req_timeout: shared.counters.req_timeout.load(Ordering::Relaxed),
        errors: shared.counters.errors.load(Ordering::Relaxed),
        closed: shared.counters.closed.load(Ordering::Relaxed),
        done: shared.counters.done_req.load(Ordering::Relaxed),
        total: shared.total_requests,
        elapsed_ms: shared.started.elapsed().as_millis() as i64,
    }
}

async fn run(
    shared: Arc<SharedRun>,
    stop_rx: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<LoadTestEvent>,
    engine_state: Arc<Mutex<Option<watch::Sender<bool>>>>,
) {
    let progress = tokio::spawn({
        let shared = Arc::clone(&shared);
        let events = events.clone();
        let mut stop = stop_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = events.send(LoadTestEvent::Progress(snapshot(&shared)));
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    });

    let mut workers = JoinSet::new();
    for worker in 0..shared.options.concurrency {
        workers.spawn(run_worker(worker, Arc::clone(&shared), stop_rx.clone()));
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "load-test worker panicked");
        }
    }

    // All workers finished (or bailed on stop): cancel the scope.
    if let Some(stop_tx) = engine_state.lock().expect("engine state").as_ref() {
        let _ = stop_tx.send(true);
    }
    progress.abort();

    let hello_samples = std::mem::take(&mut *shared.hello_samples.lock().expect("hello samples"));
    let resp_samples = std::mem::take(&mut *shared.resp_samples.lock().expect("resp samples"));
    let summary = LoadTestSummary {
        protocol: shared.protocol_name.clone(),
        concurrency: shared.options.concurrency,
        requests_per_conn: shared.options.requests_per_conn,
        total_requests: shared.total_requests,
        connect_ok: shared.counters.connect_ok.load(Ordering::Relaxed),
        connect_fail: shared.counters.connect_fail.load(Ordering::Relaxed),
        req_ok: shared.counters.req_ok.load(Ordering::Relaxed),
        req_timeout: shared.counters.req_timeout.load(Ordering::Relaxed),
        errors: shared.counters.errors.load(Ordering::Relaxed),
        closed: shared.counters.closed.load(Ordering::Relaxed),
        hello_latency_ms: LatencyStats::from_samples(hello_samples),
        resp_latency_ms: LatencyStats::from_samples(resp_samples),
        duration_ms: shared.started.elapsed().as_millis() as i64,
        done: true,
    };
    // Clear the running flag before announcing completion so a caller who
    // sees `Done` can immediately start the next run.
    engine_state.lock().expect("engine state").take();
    let _ = events.send(LoadTestEvent::Done(summary));
}

/// Resolves when the stop flag flips to true; pends forever otherwise.
async fn stopped(mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        if stop.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

async fn run_worker(worker: usize, shared: Arc<SharedRun>, stop: watch::Receiver<bool>) {
    let mut config = shared.options.config.clone();
    if config.client_id.is_empty() {
        config.client_id = format!("loadtest-{}-{}", unix_nanos(), worker);
    }

    let client = SessionClient::new(config);
    let mut client_events = client.take_events().expect("fresh client events");
    let (resp_tx, mut resp_rx) = mpsc::channel::<()>(RESPONSE_CHANNEL_CAPACITY);

    // Classifies inbound traffic: hellos are handshake noise, anything else
    // with a type or a text/content field counts as a response.
    let classifier = tokio::spawn({
        let shared = Arc::clone(&shared);
        async move {
            while let Some(event) = client_events.recv().await {
                match event {
                    ClientEvent::Json(value) => {
                        if value.get("type").and_then(Value::as_str) == Some("hello") {
                            continue;
                        }
                        if value.get("type").is_some()
                            || value.get("text").is_some()
                            || value.get("content").is_some()
                        {
                            let _ = resp_tx.try_send(());
                        }
                    }
                    ClientEvent::Binary(_) => {}
                    ClientEvent::Error(err) => {
                        debug!(worker, error = %err, "client error");
                        shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                    }
                    ClientEvent::Closed => {
                        shared.counters.closed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    let connect_started = Instant::now();
    if let Err(err) = client.open(shared.options.protocol, Some(stop.clone())).await {
        debug!(worker, error = %err, "connect failed");
        shared.counters.connect_fail.fetch_add(1, Ordering::Relaxed);
        drop(client);
        let _ = classifier.await;
        return;
    }
    let hello_ms = connect_started.elapsed().as_millis() as f64;
    shared
        .hello_samples
        .lock()
        .expect("hello samples")
        .push(hello_ms);
    shared.counters.connect_ok.fetch_add(1, Ordering::Relaxed);

    for cycle in 0..shared.options.requests_per_conn {
        if *stop.borrow() {
            break;
        }
        // Drop responses left over from the previous cycle.
        while resp_rx.try_recv().is_ok() {}

        let request_started = Instant::now();
        let _ = client.listen_start(ListenMode::Ptt).await;
        let text = format!("{} #{}.{}", shared.options.message, worker, cycle);
        if let Err(err) = client.detect_text(&text).await {
            debug!(worker, cycle, error = %err, "detect failed");
            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
        }

        tokio::select! {
            response = resp_rx.recv() => {
                if response.is_some() {
                    let ms = request_started.elapsed().as_millis() as f64;
                    shared.resp_samples.lock().expect("resp samples").push(ms);
                    shared.counters.req_ok.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ = tokio::time::sleep(shared.options.resp_timeout) => {
                shared.counters.req_timeout.fetch_add(1, Ordering::Relaxed);
            }
            _ = stopped(stop.clone()) => {
                break;
            }
        }

        let _ = client.listen_stop(ListenMode::Ptt).await;
        shared.counters.done_req.fetch_add(1, Ordering::Relaxed);
    }

    client.close().await;
    drop(client);
    let _ = classifier.await;
}
