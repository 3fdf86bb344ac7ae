use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::info;

use xiaozhi_client::{ClientConfig, Protocol, TokenMethod};
use xiaozhi_loadtest::{LoadTestEngine, LoadTestEvent, LoadTestOptions, LoadTestSummary};

#[derive(Debug, Parser)]
#[command(name = "xiaozhi-loadtest")]
#[command(about = "Concurrent connect/response latency harness for the Xiaozhi protocol")]
struct Cli {
    /// Protocol: ws|mqtt
    #[arg(long, default_value = "ws")]
    protocol: String,

    /// WebSocket URL, e.g. ws://127.0.0.1:8000
    #[arg(long)]
    ws: Option<String>,

    /// MQTT broker URL, e.g. ssl://host:8883
    #[arg(long)]
    broker: Option<String>,

    /// MQTT username
    #[arg(long, default_value = "")]
    username: String,

    /// MQTT password
    #[arg(long, default_value = "")]
    password: String,

    /// MQTT publish topic
    #[arg(long = "pub", default_value = "device-server")]
    publish_topic: String,

    /// MQTT subscribe topic ('null' to not subscribe)
    #[arg(long = "sub", default_value = "null")]
    subscribe_topic: String,

    /// MQTT keepalive seconds
    #[arg(long, default_value_t = 240)]
    keepalive: u64,

    /// Auth token (if any)
    #[arg(long, default_value = "")]
    token: String,

    /// Token method: header|query_access_token|query_token
    #[arg(long = "token-method", default_value = "header")]
    token_method: String,

    /// Client ID (generated per worker when empty)
    #[arg(long = "client-id", default_value = "")]
    client_id: String,

    /// Device ID (defaults to the system MAC when empty)
    #[arg(long = "device-id", default_value = "")]
    device_id: String,

    /// Concurrency (number of connections)
    #[arg(short = 'c', long, default_value_t = 10)]
    concurrency: usize,

    /// Requests per connection
    #[arg(short = 'n', long = "per-conn", default_value_t = 10)]
    per_conn: usize,

    /// Text to send for each request
    #[arg(long, default_value = "hello")]
    message: String,

    /// Hello wait timeout in milliseconds
    #[arg(long = "hello-timeout-ms", default_value_t = 10_000)]
    hello_timeout_ms: u64,

    /// Response wait timeout per request in milliseconds
    #[arg(long = "resp-timeout-ms", default_value_t = 10_000)]
    resp_timeout_ms: u64,

    /// Output the summary as JSON
    #[arg(long)]
    json: bool,

    /// Log level: debug|info|warn|error
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn build_config(cli: &Cli, protocol: Protocol) -> anyhow::Result<ClientConfig> {
    let mut config = ClientConfig {
        client_id: cli.client_id.clone(),
        device_id: cli.device_id.to_lowercase(),
        auth_token: cli.token.clone(),
        enable_token: !cli.token.is_empty(),
        token_method: TokenMethod::parse(&cli.token_method),
        hello_timeout: Duration::from_millis(cli.hello_timeout_ms),
        ..Default::default()
    };
    match protocol {
        Protocol::Websocket => {
            config.websocket_url = cli
                .ws
                .clone()
                .ok_or_else(|| anyhow!("--ws is required for protocol=ws"))?;
        }
        Protocol::Mqtt => {
            config.mqtt.broker_url = cli
                .broker
                .clone()
                .ok_or_else(|| anyhow!("--broker is required for protocol=mqtt"))?;
            config.mqtt.username = cli.username.clone();
            config.mqtt.password = cli.password.clone();
            config.mqtt.publish_topic = cli.publish_topic.clone();
            config.mqtt.subscribe_topic = cli.subscribe_topic.clone();
            config.mqtt.keepalive_secs = cli.keepalive;
        }
    }
    if config.device_id.is_empty() {
        config = config.with_default_device_id();
    }
    Ok(config)
}

fn print_summary(summary: &LoadTestSummary) {
    println!("Load Test Summary:");
    println!("  Protocol:          {}", summary.protocol);
    println!("  Concurrency:       {}", summary.concurrency);
    println!("  Requests/Conn:     {}", summary.requests_per_conn);
    println!("  Total Requests:    {}", summary.total_requests);
    println!("  Connect OK/Fail:   {} / {}", summary.connect_ok, summary.connect_fail);
    println!("  Req OK/Timeout:    {} / {}", summary.req_ok, summary.req_timeout);
    println!("  Errors:            {}", summary.errors);
    println!("  Closed events:     {}", summary.closed);
    println!("  Duration:          {} ms", summary.duration_ms);
    let h = &summary.hello_latency_ms;
    println!(
        "  Hello Latency (ms): n={} min={:.0} avg={:.1} p50={:.0} p90={:.0} p95={:.0} p99={:.0} max={:.0}",
        h.count, h.min, h.avg, h.p50, h.p90, h.p95, h.p99, h.max
    );
    let r = &summary.resp_latency_ms;
    println!(
        "  Resp Latency  (ms): n={} min={:.0} avg={:.1} p50={:.0} p90={:.0} p95={:.0} p99={:.0} max={:.0}",
        r.count, r.min, r.avg, r.p50, r.p90, r.p95, r.p99, r.max
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let protocol: Protocol = cli.protocol.to_lowercase().parse()?;
    let config = build_config(&cli, protocol)?;

    let engine = LoadTestEngine::new();
    let mut events = engine.start(LoadTestOptions {
        protocol,
        config,
        concurrency: cli.concurrency,
        requests_per_conn: cli.per_conn,
        message: cli.message.clone(),
        resp_timeout: Duration::from_millis(cli.resp_timeout_ms),
    })?;

    // Ctrl-C cancels the run; the partial summary still prints.
    tokio::spawn({
        let engine = engine.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, stopping load test");
                engine.stop();
            }
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            LoadTestEvent::Progress(progress) => {
                info!(
                    done = progress.done,
                    total = progress.total,
                    connect_ok = progress.connect_ok,
                    connect_fail = progress.connect_fail,
                    req_ok = progress.req_ok,
                    req_timeout = progress.req_timeout,
                    errors = progress.errors,
                    elapsed_ms = progress.elapsed_ms,
                    "load test progress"
                );
            }
            LoadTestEvent::Done(summary) => {
                if cli.json {
                    let rendered = serde_json::to_string_pretty(&summary)
                        .context("serialize summary")?;
                    println!("{rendered}");
                } else {
                    print_summary(&summary);
                }
                break;
            }
        }
    }
    Ok(())
}
