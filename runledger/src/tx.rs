//! Atomic scopes over a pooled connection.

use std::future::Future;
use std::sync::Arc;

use sqlx::{Any, Transaction};

use crate::error::LedgerError;
use crate::pool::PoolManager;

/// Transaction handle passed through an atomic scope.
pub type LedgerTx = Transaction<'static, Any>;

/// Runs closures inside a transaction: commit on `Ok`, rollback on `Err`.
#[derive(Clone, Debug)]
pub struct TxCoordinator {
    pools: Arc<PoolManager>,
}

impl TxCoordinator {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Run `f` in a fresh transaction.
    ///
    /// The closure owns the transaction for its duration and hands it back
    /// together with its result. Begin and commit failures are classified the
    /// same way as statement failures, so a busy commit is retryable.
    pub async fn atomic<T, F, Fut>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(LedgerTx) -> Fut,
        Fut: Future<Output = (LedgerTx, Result<T, LedgerError>)>,
    {
        let dialect = self.pools.dialect();
        let tx = self
            .pools
            .pool()
            .begin()
            .await
            .map_err(|e| dialect.classify(e))?;

        let (tx, result) = f(tx).await;
        match result {
            Ok(value) => {
                tx.commit().await.map_err(|e| dialect.classify(e))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}
