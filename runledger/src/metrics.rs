//! Prometheus metrics for the ledger.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `runledger_writes_total` - Ledger writes by operation and outcome
//! - `runledger_write_retries_total` - Writes retried after lock contention
//! - `runledger_jobs_reaped_total` - Jobs failed by the liveness sweep
//! - `runledger_jobs_cancelled_total` - Jobs cancelled by an interrupt drain
//! - `runledger_pool_errors_total` - Failed operations counted against the pool
//!
//! ## Gauges
//! - `runledger_pool_connections` - Pool connections by state
//!
//! ## Histograms
//! - `runledger_write_duration_seconds` - Wall time of a write including retries
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, GaugeVec, HistogramVec, IntCounter, Opts, Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for ledger metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `op`: The ledger operation (create, update_status, ...)
/// - `outcome`: ok, or the error kind
pub static WRITES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("runledger_writes_total", "Total number of ledger writes");
    CounterVec::new(opts, &["op", "outcome"])
        .expect("runledger_writes_total metric creation failed")
});

/// Labels:
/// - `op`: The ledger operation
pub static WRITE_RETRIES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runledger_write_retries_total",
        "Total number of ledger writes retried after contention",
    );
    CounterVec::new(opts, &["op"]).expect("runledger_write_retries_total metric creation failed")
});

/// Labels:
/// - `reason`: dead_process, stale_heartbeat, stale_row
pub static JOBS_REAPED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runledger_jobs_reaped_total",
        "Total number of jobs failed by the liveness sweep",
    );
    CounterVec::new(opts, &["reason"]).expect("runledger_jobs_reaped_total metric creation failed")
});

pub static JOBS_CANCELLED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "runledger_jobs_cancelled_total",
        "Total number of jobs cancelled by an interrupt drain",
    )
    .expect("runledger_jobs_cancelled_total metric creation failed")
});

/// Labels:
/// - `backend`: sqlite or postgres
/// - `state`: idle, checked_out, overflow
pub static POOL_CONNECTIONS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("runledger_pool_connections", "Pool connections by state");
    GaugeVec::new(opts, &["backend", "state"])
        .expect("runledger_pool_connections metric creation failed")
});

/// Labels:
/// - `backend`: sqlite or postgres
/// - `kind`: The error kind
pub static POOL_ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runledger_pool_errors_total",
        "Total number of failed operations counted against the pool",
    );
    CounterVec::new(opts, &["backend", "kind"])
        .expect("runledger_pool_errors_total metric creation failed")
});

/// Labels:
/// - `op`: The ledger operation
pub static WRITE_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.0005, 2.0, 14).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "runledger_write_duration_seconds",
        "Ledger write duration in seconds, including retries",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["op"])
        .expect("runledger_write_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Idempotent: duplicate registrations are ignored.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(WRITES_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(WRITE_RETRIES_TOTAL.clone()),
        Box::new(JOBS_REAPED_TOTAL.clone()),
        Box::new(JOBS_CANCELLED_TOTAL.clone()),
        Box::new(POOL_CONNECTIONS.clone()),
        Box::new(POOL_ERRORS_TOTAL.clone()),
        Box::new(WRITE_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_write(op: &str, outcome: &str, duration_secs: f64) {
    WRITES_TOTAL.with_label_values(&[op, outcome]).inc();
    WRITE_DURATION_SECONDS
        .with_label_values(&[op])
        .observe(duration_secs);
}

pub fn record_write_retry(op: &str) {
    WRITE_RETRIES_TOTAL.with_label_values(&[op]).inc();
}

pub fn record_reaped(reason: &str) {
    JOBS_REAPED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_cancelled(count: u64) {
    JOBS_CANCELLED_TOTAL.inc_by(count);
}

pub fn record_pool_error(backend: &str, kind: &str) {
    POOL_ERRORS_TOTAL.with_label_values(&[backend, kind]).inc();
}

pub fn set_pool_connections(backend: &str, idle: u32, checked_out: u32, overflow: u32) {
    for (state, value) in [
        ("idle", idle),
        ("checked_out", checked_out),
        ("overflow", overflow),
    ] {
        POOL_CONNECTIONS
            .with_label_values(&[backend, state])
            .set(f64::from(value));
    }
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
