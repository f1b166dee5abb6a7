//! runledger - job execution ledger and process supervision for training runs.
//!
//! Tracks every training run and variation in a transactional SQL table,
//! keeps a denormalized summary projection with a TTL cache in front of it,
//! reaps jobs whose worker process died, and drains in-flight work on an
//! operator interrupt.
//!
//! # Core Concepts
//!
//! - **Ledger**: [`Ledger`] is the façade over `ledger_jobs`. Every write runs
//!   in its own transaction, retried with backoff on lock contention, and
//!   every status change follows one transition table.
//!
//! - **Dialect**: [`Dialect`] hides the differences between SQLite (single
//!   file-locked writer) and PostgreSQL (MVCC row locks) behind one enum.
//!
//! - **Versions**: each row's `updated_at` doubles as an optimistic-lock
//!   token; [`Ledger::update_if_version`] refuses stale tokens.
//!
//! - **Summary**: [`SummaryCache`] serves aggregate statistics from an
//!   in-process TTL cache, invalidated by key prefix after each commit.
//!
//! - **Runtime**: [`LedgerRuntime`] ties the ledger, the
//!   [`ProcessSupervisor`] and the [`ShutdownCoordinator`] together.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use runledger::*;
//!
//! let ledger = Ledger::open(&LedgerConfig::default()).await?;
//! let job = ledger
//!     .create(NewJob::new(JobId::parse("abc12345")?, "train_only", "faces", "default"))
//!     .await?;
//! ledger.update_status(&job.id, JobStatus::Training, None, None).await?;
//! ```

/// Typed configuration with TOML loading and environment overrides.
pub mod config;

/// Backend detection, tuning and error classification.
pub mod dialect;

/// The [`LedgerError`] taxonomy.
pub mod error;

/// In-process broadcast of committed ledger changes.
pub mod events;

/// Job identifiers, statuses, records and patches.
pub mod job;

/// Subscriber installation.
pub mod logging;

/// Per-job PID and heartbeat side files.
pub mod markers;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Connection pool lifecycle and health accounting.
pub mod pool;

/// Exponential backoff for contended writes.
pub mod retry;

/// The [`Ledger`] façade and schema management.
pub mod store;

/// Summary projection and aggregate cache.
pub mod summary;

/// Spans and recording helpers shared by every component.
pub mod telemetry;

/// Atomic transaction scopes.
pub mod tx;

/// Supervisor, shutdown coordinator and runtime builder.
pub mod runtime;

pub use config::*;
pub use dialect::Dialect;
pub use error::{LedgerError, LedgerResult};
pub use events::*;
pub use job::*;
pub use markers::{MarkerStore, Markers};
pub use pool::{PoolEvent, PoolManager, PoolStats};
pub use retry::RetryPolicy;
pub use runtime::*;
pub use store::Ledger;
pub use summary::{CachedAggregate, LedgerStats, SummaryCache, SummaryRow};
pub use tx::{LedgerTx, TxCoordinator};
