use std::path::{Path, PathBuf};
use std::sync::Arc;

use runledger::*;
use tempfile::TempDir;

use crate::fixtures::{new_job, path_to};

/// A ledger on a SQLite file inside a temporary directory.
///
/// Retries are tuned for tests: many attempts, millisecond backoff.
pub struct TestLedger {
    dir: TempDir,
    config: LedgerConfig,
    ledger: Arc<Ledger>,
}

impl TestLedger {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Open with a customized configuration. Installs the test log
    /// subscriber on first use.
    pub async fn with_config(customize: impl FnOnce(&mut LedgerConfig)) -> Self {
        runledger::logging::init_test_logging();
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut config = Self::config_for(dir.path());
        customize(&mut config);
        let ledger = Arc::new(Ledger::open(&config).await.expect("open test ledger"));
        Self { dir, config, ledger }
    }

    /// Default test configuration for a ledger stored under `dir`.
    pub fn config_for(dir: &Path) -> LedgerConfig {
        let mut config = LedgerConfig::default();
        config.persistence.connection_string =
            format!("sqlite://{}?mode=rwc", dir.join("ledger.db").display());
        config.retry = RetryConfig {
            max_attempts: 50,
            base_delay_ms: 2,
            max_backoff_ms: 50,
            jitter_ratio: 0.5,
        };
        config.work_dir = dir.join("work");
        config
    }

    /// A second, independent ledger on the same database file, as another
    /// process would open it.
    pub async fn open_peer(&self) -> Ledger {
        Ledger::open(&self.config).await.expect("open peer ledger")
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn work_dir(&self) -> PathBuf {
        self.config.work_dir.clone()
    }

    pub fn markers(&self) -> &MarkerStore {
        self.ledger.markers()
    }

    /// Create `id` and move it forward to `status`.
    pub async fn job_in(&self, id: &str, status: JobStatus) -> JobRecord {
        let job = self.ledger.create(new_job(id)).await.expect("create job");
        for step in path_to(status) {
            let error = (step == JobStatus::Failed).then(|| "fixture failure".to_string());
            self.ledger
                .update_status(&job.id, step, error, None)
                .await
                .expect("advance job");
        }
        self.get(&job.id).await
    }

    pub async fn get(&self, id: &JobId) -> JobRecord {
        self.ledger
            .get(id)
            .await
            .expect("read job")
            .expect("job exists")
    }

    pub async fn status_of(&self, id: &JobId) -> JobStatus {
        self.get(id).await.status
    }
}

impl std::ops::Deref for TestLedger {
    type Target = Ledger;

    fn deref(&self) -> &Ledger {
        &self.ledger
    }
}
