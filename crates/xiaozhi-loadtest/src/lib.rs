//! Load-test harness: multiplies the session client to measure connect and
//! response latency under concurrency, with bounded-memory statistics.

pub mod engine;
pub mod stats;

pub use engine::{
    LoadTestEngine, LoadTestError, LoadTestEvent, LoadTestOptions, LoadTestSummary,
    ProgressSnapshot,
};
pub use stats::LatencyStats;
