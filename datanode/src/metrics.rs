//! Metrics collection module for the container state machine
//!
//! This module provides functionality for collecting and exposing replica metrics
//! using Prometheus.

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Applied entries by replica and outcome
    pub static ref APPLY_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("applied_entries", "applied log entries"),
        &["replica", "outcome"]
    )
    .unwrap();

    /// Time spent applying one entry, storage writes included
    pub static ref APPLY_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("apply_cost", "apply cost"),
        &["replica"]
    )
    .unwrap();

    /// Snapshot captures by result
    pub static ref SNAPSHOT_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("snapshot_captures", "snapshot captures"),
        &["replica", "result"]
    )
    .unwrap();

    /// Window during which a capture holds the applied state
    pub static ref SNAPSHOT_PAUSE_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("snapshot_pause", "snapshot quiesce window")
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        &["replica"]
    )
    .unwrap();

    /// End to end capture time, serialization and fsync included
    pub static ref SNAPSHOT_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("snapshot_cost", "snapshot cost"),
        &["replica"]
    )
    .unwrap();

    pub static ref LAST_APPLIED_GAUGE_VEC: IntGaugeVec = IntGaugeVec::new(
        Opts::new("last_applied_index", "last applied log index"),
        &["replica"]
    )
    .unwrap();

    /// 1 once a replica stopped applying entries
    pub static ref HALTED_GAUGE_VEC: IntGaugeVec = IntGaugeVec::new(
        Opts::new("halted", "replica halted"),
        &["replica"]
    )
    .unwrap();
}

/// Initializes the metrics registry
///
/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLY_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLY_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOT_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOT_PAUSE_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOT_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(LAST_APPLIED_GAUGE_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(HALTED_GAUGE_VEC.clone()));
}

/// Renders the registry in the Prometheus text format
pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY_INSTANCE.gather(), &mut buffer) {
        log::error!("failed to encode metrics: {}", e);
    }
    buffer
}

/// Records the duration of a synchronous operation
///
/// # Arguments
///
/// * `histogram` - Histogram to observe into
/// * `replica` - Replica label value
/// * `handler` - Operation to execute and measure
///
/// # Returns
///
/// Returns the result of the handler function
pub fn record_duration<F, T>(histogram: &HistogramVec, replica: &str, handler: F) -> T
where
    F: FnOnce() -> T,
{
    let start = Instant::now();
    let result = handler();
    histogram
        .with_label_values(&[replica])
        .observe(start.elapsed().as_secs_f64());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_renders_recorded_metrics() {
        init_registry();
        let value = record_duration(&APPLY_HISTOGRAM_VEC, "metrics-test", || 41 + 1);
        assert_eq!(value, 42);
        LAST_APPLIED_GAUGE_VEC
            .with_label_values(&["metrics-test"])
            .set(7);
        let text = String::from_utf8(gather()).unwrap();
        assert!(text.contains("last_applied_index"));
        assert!(text.contains("apply_cost"));
    }
}
