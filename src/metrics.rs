//! Prometheus metrics of the supervising process

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use prometheus::{self, register_gauge, Encoder, Gauge, TextEncoder};
use std::time::Instant;

lazy_static! {
    static ref START: Instant = Instant::now();
    static ref UPTIME: Gauge = register_gauge!(
        "kstress_uptime",
        "Time in milliseconds how long the supervisor is running"
    )
    .unwrap();
}

/// Start the uptime clock
pub fn init() {
    lazy_static::initialize(&START);
}

/// All registered metrics in the prometheus text format
pub fn encode_metrics() -> Result<String> {
    UPTIME.set(START.elapsed().as_millis() as f64);

    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics are not valid UTF-8")
}

#[test]
fn test_encode_metrics() {
    let _guard = crate::run_state::FORK_TESTS
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    init();
    let text = encode_metrics().unwrap();
    assert!(text.contains("kstress_uptime"));
}
