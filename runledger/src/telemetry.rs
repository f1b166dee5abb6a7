//! Tracing and telemetry instrumentation for the ledger.
//!
//! Helpers for creating tracing spans and recording metrics around ledger
//! writes, liveness sweeps and interrupt drains. All functions work both with
//! and without the `metrics` feature flag.
//!
//! # Example
//!
//! ```ignore
//! use runledger::telemetry::{instrument_write, WriteTimer};
//!
//! let timer = WriteTimer::start("update_status");
//! let result = instrument_write("update_status", job_id, async { ... }).await;
//! timer.finish(&result);
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info_span, Instrument, Span};

use crate::error::LedgerError;
use crate::pool::PoolStats;

/// Span covering one ledger write, retries included.
#[must_use]
pub fn write_span(op: &'static str, job_id: impl AsRef<str>) -> Span {
    info_span!(
        "runledger.write",
        op = op,
        job_id = %job_id.as_ref(),
    )
}

/// Span covering one liveness sweep.
#[must_use]
pub fn sweep_span(watched: usize) -> Span {
    info_span!("runledger.sweep", watched = watched)
}

/// Span covering one interrupt drain.
#[must_use]
pub fn shutdown_span(active_jobs: usize, processes: usize) -> Span {
    info_span!(
        "runledger.shutdown",
        active_jobs = active_jobs,
        processes = processes,
    )
}

/// Attach a write span to a future.
pub fn instrument_write<F>(
    op: &'static str,
    job_id: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(write_span(op, job_id))
}

/// Measures a write from first attempt to final outcome.
#[derive(Debug)]
pub struct WriteTimer {
    op: &'static str,
    start: Instant,
}

impl WriteTimer {
    pub fn start(op: &'static str) -> Self {
        Self {
            op,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the outcome and duration of the write.
    pub fn finish<T>(self, outcome: &Result<T, LedgerError>) {
        let label = match outcome {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        record_write(self.op, label, self.start.elapsed());
    }
}

pub fn record_write(op: &str, outcome: &str, elapsed: Duration) {
    tracing::debug!(
        op = op,
        outcome = outcome,
        elapsed_ms = elapsed.as_millis() as u64,
        "ledger write finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_write(op, outcome, elapsed.as_secs_f64());
}

/// Record a write that hit contention and will be retried after `delay`.
pub fn record_write_retry(op: &str, attempt: u32, delay: Duration, err: &LedgerError) {
    tracing::warn!(
        op = op,
        attempt = attempt,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "ledger write contended; retrying"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_write_retry(op);
}

/// Record a job forced to FAILED by the liveness sweep.
pub fn record_reaped(job_id: impl AsRef<str>, reason: &str, message: &str) {
    tracing::warn!(
        job_id = %job_id.as_ref(),
        reason = reason,
        message = message,
        "job reaped"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_reaped(reason);
}

/// Record jobs cancelled by an interrupt drain.
pub fn record_cancelled(count: u64, reason: &str) {
    tracing::info!(count = count, reason = reason, "unfinished jobs cancelled");

    #[cfg(feature = "metrics")]
    crate::metrics::record_cancelled(count);
}

pub fn record_pool_error(backend: &str, err: &LedgerError) {
    tracing::debug!(backend = backend, kind = err.kind(), error = %err, "pool operation failed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_pool_error(backend, err.kind());
}

pub fn record_pool_stats(stats: &PoolStats) {
    tracing::debug!(
        backend = %stats.backend,
        size = stats.size,
        idle = stats.idle,
        checked_out = stats.checked_out,
        overflow = stats.overflow,
        "pool stats"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_pool_connections(
        stats.backend.as_str(),
        stats.idle,
        stats.checked_out,
        stats.overflow,
    );
}
