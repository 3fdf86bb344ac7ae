use serde::Serialize;

/// Summary statistics over latency samples in milliseconds. Percentiles use
/// the nearest-rank method: the value at 1-based rank `ceil(p/100 * n)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub min: f64,
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

impl LatencyStats {
    /// All-zero for an empty sample vector.
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let sum: f64 = samples.iter().sum();
        let pick = |p: f64| {
            let idx = ((p / 100.0 * samples.len() as f64).ceil() as usize)
                .saturating_sub(1)
                .min(samples.len() - 1);
            samples[idx]
        };
        Self {
            count: samples.len(),
            min: samples[0],
            avg: sum / samples.len() as f64,
            p50: pick(50.0),
            p90: pick(90.0),
            p95: pick(95.0),
            p99: pick(99.0),
            max: samples[samples.len() - 1],
        }
    }
}
