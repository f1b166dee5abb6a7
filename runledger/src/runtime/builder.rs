use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::LedgerConfig;
use crate::store::Ledger;

use super::process::{OsProbe, ProcessProbe, ProcessRegistry};
use super::shutdown::{AuxiliaryService, Confirmation, ShutdownCoordinator, StdinConfirmation};
use super::supervisor::{ProcessSupervisor, ShutdownToken, SweepReport};

/// Builder for a [`LedgerRuntime`] with explicit dependencies.
///
/// Anything not supplied falls back to the production implementation: the
/// ledger is opened from the configuration, processes are probed through the
/// OS and confirmation is read from stdin.
///
/// # Example
///
/// ```ignore
/// let runtime = LedgerRuntimeBuilder::new(config)
///     .with_confirmation(Arc::new(StdinConfirmation::new()))
///     .build()
///     .await?;
/// runtime.start();
/// runtime.wait_for_shutdown().await;
/// ```
pub struct LedgerRuntimeBuilder {
    config: LedgerConfig,
    ledger: Option<Arc<Ledger>>,
    probe: Option<Arc<dyn ProcessProbe>>,
    confirmation: Option<Arc<dyn Confirmation>>,
    services: Vec<Arc<dyn AuxiliaryService>>,
}

impl fmt::Debug for LedgerRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerRuntimeBuilder")
            .field("config", &self.config)
            .field("ledger_set", &self.ledger.is_some())
            .field("probe_set", &self.probe.is_some())
            .field("confirmation_set", &self.confirmation.is_some())
            .field("services", &self.services.len())
            .finish()
    }
}

impl LedgerRuntimeBuilder {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            ledger: None,
            probe: None,
            confirmation: None,
            services: Vec::new(),
        }
    }

    /// Use an already opened ledger instead of connecting from the config.
    pub fn with_ledger(mut self, ledger: Arc<Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_confirmation(mut self, confirmation: Arc<dyn Confirmation>) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    pub fn with_service(mut self, service: Arc<dyn AuxiliaryService>) -> Self {
        self.services.push(service);
        self
    }

    /// Validate the configuration and assemble the runtime.
    pub async fn build(self) -> anyhow::Result<LedgerRuntime> {
        self.config.validate()?;

        #[cfg(feature = "metrics")]
        crate::metrics::init_metrics()?;

        let ledger = match self.ledger {
            Some(ledger) => ledger,
            None => Arc::new(Ledger::open(&self.config).await?),
        };
        let processes = Arc::new(ProcessRegistry::new());
        let probe = self.probe.unwrap_or_else(|| Arc::new(OsProbe));
        let confirmation = self
            .confirmation
            .unwrap_or_else(|| Arc::new(StdinConfirmation::new()));

        let supervisor = Arc::new(ProcessSupervisor::with_probe(
            Arc::clone(&ledger),
            self.config.supervisor.clone(),
            probe,
        ));
        let shutdown = self.services.into_iter().fold(
            ShutdownCoordinator::new(
                Arc::clone(&ledger),
                Arc::clone(&processes),
                self.config.shutdown.clone(),
                confirmation,
            ),
            ShutdownCoordinator::with_service,
        );

        tracing::info!(
            backend = ledger.dialect().as_str(),
            work_dir = %self.config.work_dir.display(),
            "ledger runtime ready"
        );

        Ok(LedgerRuntime {
            config: self.config,
            ledger,
            processes,
            supervisor,
            shutdown: Arc::new(shutdown),
            token: ShutdownToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }
}

/// The assembled ledger services, passed down from the entry point.
pub struct LedgerRuntime {
    config: LedgerConfig,
    ledger: Arc<Ledger>,
    processes: Arc<ProcessRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    shutdown: Arc<ShutdownCoordinator>,
    token: ShutdownToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for LedgerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerRuntime")
            .field("ledger", &self.ledger)
            .field("supervisor", &self.supervisor)
            .field("shutdown", &self.shutdown)
            .field("tasks", &self.handles.lock().len())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl LedgerRuntime {
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn processes(&self) -> &Arc<ProcessRegistry> {
        &self.processes
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }

    /// Start the supervisor loop (when enabled) and the interrupt listener.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if self.config.supervisor.enabled {
            handles.push(Arc::clone(&self.supervisor).spawn(self.token.clone()));
        }
        handles.push(Arc::clone(&self.shutdown).spawn_listener(self.token.clone()));
    }

    pub async fn sweep_once(&self) -> anyhow::Result<SweepReport> {
        Ok(self.supervisor.sweep().await?)
    }

    /// Apply the configured retention policy.
    pub async fn purge_expired(&self) -> anyhow::Result<u64> {
        let retention = &self.config.retention;
        Ok(self
            .ledger
            .purge(retention.max_age(), retention.keep_failed)
            .await?)
    }

    /// Resolve once a drain completed or [`stop`](Self::stop) was called.
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Cancel background tasks, wait for them and close the pool.
    pub async fn stop(&self) {
        self.token.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "runtime task panicked");
            }
        }
        self.ledger.close().await;
    }
}
