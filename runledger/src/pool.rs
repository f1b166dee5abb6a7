//! Connection pool ownership, health accounting and recovery.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use tokio::sync::broadcast;

use crate::config::PersistenceConfig;
use crate::dialect::Dialect;
use crate::error::LedgerError;
use crate::telemetry;

/// Point-in-time pool counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolStats {
    pub backend: Dialect,
    /// Open connections, idle or checked out.
    pub size: u32,
    pub idle: u32,
    pub checked_out: u32,
    /// Hard upper bound on open connections.
    pub capacity: u32,
    /// Connections open above the steady-state pool size.
    pub overflow: u32,
    pub errors_total: u64,
    pub consecutive_errors: u32,
    pub resets: u64,
}

/// Health transitions published by the [`PoolManager`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum PoolEvent {
    Connected { backend: Dialect },
    OperationFailed { error: String, consecutive: u32 },
    Recovered,
    Reset { generation: u64 },
    Disposed,
}

/// Owns the connection pool for one backend.
///
/// The pool is swapped wholesale on [`reset`](Self::reset); callers clone the
/// handle per operation and never hold it across a reset.
pub struct PoolManager {
    dialect: Dialect,
    config: PersistenceConfig,
    pool: RwLock<AnyPool>,
    errors_total: AtomicU64,
    consecutive_errors: AtomicU32,
    resets: AtomicU64,
    events: broadcast::Sender<PoolEvent>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("dialect", &self.dialect)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolManager {
    /// Build the pool and open the first connection.
    pub async fn connect(config: PersistenceConfig) -> Result<Self, LedgerError> {
        let dialect = config
            .dialect()
            .map_err(|e| LedgerError::Validation(e.to_string()))?;
        let pool = build_pool(dialect, &config).await?;
        let (events, _) = broadcast::channel(64);

        tracing::info!(
            backend = %dialect,
            capacity = dialect.max_pool_size(&config),
            "ledger pool connected"
        );
        let _ = events.send(PoolEvent::Connected { backend: dialect });

        Ok(Self {
            dialect,
            config,
            pool: RwLock::new(pool),
            errors_total: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            resets: AtomicU64::new(0),
            events,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// A handle to the current pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> PoolStats {
        let pool = self.pool();
        let size = pool.size();
        let idle = u32::try_from(pool.num_idle()).unwrap_or(u32::MAX).min(size);
        let steady = self.dialect.min_pool_size(&self.config);

        PoolStats {
            backend: self.dialect,
            size,
            idle,
            checked_out: size - idle,
            capacity: self.dialect.max_pool_size(&self.config),
            overflow: size.saturating_sub(steady),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }

    /// Clear the consecutive-failure streak.
    pub fn record_success(&self) {
        if self.consecutive_errors.swap(0, Ordering::Relaxed) > 0 {
            tracing::info!(backend = %self.dialect, "ledger pool recovered");
            let _ = self.events.send(PoolEvent::Recovered);
        }
    }

    /// Count a failed operation. Returns true once the streak reaches
    /// `reset_after_errors`.
    ///
    /// Caller errors (conflicts, invalid transitions) say nothing about pool
    /// health and are ignored.
    pub fn record_error(&self, err: &LedgerError) -> bool {
        if !matches!(err, LedgerError::Database(_) | LedgerError::Contention(_)) {
            return false;
        }
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        telemetry::record_pool_error(self.dialect.as_str(), err);
        let _ = self.events.send(PoolEvent::OperationFailed {
            error: err.to_string(),
            consecutive,
        });

        let threshold = self.config.reset_after_errors;
        threshold > 0 && consecutive >= threshold
    }

    /// Account for the outcome of a ledger operation, rebuilding the pool
    /// after sustained failures.
    pub async fn record_outcome<T>(&self, outcome: &Result<T, LedgerError>) {
        match outcome {
            Ok(_) => self.record_success(),
            Err(err) => {
                if self.record_error(err) {
                    tracing::warn!(
                        backend = %self.dialect,
                        consecutive = self.consecutive_errors.load(Ordering::Relaxed),
                        "sustained ledger errors; resetting pool"
                    );
                    if let Err(reset_err) = self.reset().await {
                        tracing::error!(error = %reset_err, "ledger pool reset failed");
                    }
                }
            }
        }
    }

    /// Replace the pool with a freshly built one and close the old one.
    pub async fn reset(&self) -> Result<(), LedgerError> {
        let fresh = build_pool(self.dialect, &self.config).await?;
        let old = std::mem::replace(&mut *self.pool.write(), fresh);
        old.close().await;

        self.consecutive_errors.store(0, Ordering::Relaxed);
        let generation = self.resets.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(backend = %self.dialect, generation, "ledger pool reset");
        let _ = self.events.send(PoolEvent::Reset { generation });
        Ok(())
    }

    /// Close every connection. Subsequent checkouts fail.
    pub async fn dispose(&self) {
        let pool = self.pool();
        pool.close().await;
        tracing::info!(backend = %self.dialect, "ledger pool disposed");
        let _ = self.events.send(PoolEvent::Disposed);
    }

    pub fn is_disposed(&self) -> bool {
        self.pool.read().is_closed()
    }

    /// Round-trip a trivial query through a checked-out connection.
    pub async fn health_check(&self) -> Result<(), LedgerError> {
        let pool = self.pool();
        let outcome = sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map(|_| ())
            .map_err(|e| self.dialect.classify(e));
        telemetry::record_pool_stats(&self.stats());
        outcome
    }
}

async fn build_pool(dialect: Dialect, config: &PersistenceConfig) -> Result<AnyPool, LedgerError> {
    sqlx::any::install_default_drivers();

    let directives = dialect.session_directives(config);
    AnyPoolOptions::new()
        .max_connections(dialect.max_pool_size(config))
        .min_connections(dialect.min_pool_size(config))
        .acquire_timeout(config.acquire_timeout())
        .max_lifetime(Some(Duration::from_secs(config.max_lifetime_seconds)))
        .test_before_acquire(true)
        .after_connect(move |conn, _meta| {
            let directives = directives.clone();
            Box::pin(async move {
                for directive in &directives {
                    sqlx::query(directive.as_str()).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect(&config.connection_string)
        .await
        .map_err(|e| dialect.classify(e))
}
