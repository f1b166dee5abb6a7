use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;

/// Configuration for database persistence connections.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Database connection string (`sqlite://runs.db` or `postgres://...`).
    pub connection_string: String,
    /// Backend override. Inferred from the connection string when unset.
    pub backend: Option<Dialect>,
    /// Steady-state pool size for server backends.
    pub pool_size: u32,
    /// Extra connections allowed above `pool_size` under load.
    pub max_overflow: u32,
    /// Timeout in seconds for checking a connection out of the pool.
    pub acquire_timeout_seconds: u64,
    /// SQLite busy timeout / PostgreSQL lock timeout, in milliseconds.
    pub busy_timeout_ms: u64,
    /// PostgreSQL statement timeout, in milliseconds.
    pub statement_timeout_ms: u64,
    /// Recycle connections older than this many seconds.
    pub max_lifetime_seconds: u64,
    /// Consecutive errors after which the pool is rebuilt.
    pub reset_after_errors: u32,
}

impl PersistenceConfig {
    /// The configured backend, falling back to the URL scheme.
    pub fn dialect(&self) -> anyhow::Result<Dialect> {
        match self.backend {
            Some(dialect) => Ok(dialect),
            None => Ok(Dialect::from_url(&self.connection_string)?),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            connection_string: "sqlite://runledger.db?mode=rwc".to_string(),
            backend: None,
            pool_size: 5,
            max_overflow: 10,
            acquire_timeout_seconds: 30,
            busy_timeout_ms: 30_000,
            statement_timeout_ms: 60_000,
            max_lifetime_seconds: 3600,
            reset_after_errors: 5,
        }
    }
}

/// Retry and backoff for writes that hit lock contention.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Ratio of random jitter added to each delay (0.0 - 1.0).
    pub jitter_ratio: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_backoff_ms: 5_000,
            jitter_ratio: 0.25,
        }
    }
}

/// Lifetimes of cached aggregates.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub overall_stats_ttl_seconds: u64,
    pub dataset_stats_ttl_seconds: u64,
    pub recent_jobs_ttl_seconds: u64,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            overall_stats_ttl_seconds: 300,
            dataset_stats_ttl_seconds: 600,
            recent_jobs_ttl_seconds: 60,
            max_entries: 1_000,
        }
    }
}

/// Liveness sweep settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub enabled: bool,
    /// Seconds between sweeps.
    pub interval_seconds: u64,
    /// A heartbeat older than this marks the worker stale.
    pub heartbeat_stale_seconds: u64,
    /// Without any marker, a row untouched for this long is presumed dead.
    pub row_stale_seconds: u64,
}

impl SupervisorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn heartbeat_stale(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_stale_seconds as i64)
    }

    pub fn row_stale(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.row_stale_seconds as i64)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
            heartbeat_stale_seconds: 300,
            row_stale_seconds: 600,
        }
    }
}

/// Interrupt handling settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long to wait for the operator before resuming.
    pub confirm_timeout_seconds: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_grace_seconds: u64,
    /// Error message recorded on jobs cancelled by the drain.
    pub cancel_reason: String,
}

impl ShutdownConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_seconds)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_seconds)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_seconds: 30,
            kill_grace_seconds: 10,
            cancel_reason: "Cancelled by user interrupt".to_string(),
        }
    }
}

/// Retention sweep settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_age_days: u32,
    /// Keep FAILED rows past the threshold for diagnostics.
    pub keep_failed: bool,
}

impl RetentionConfig {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_age_days as i64)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            keep_failed: true,
        }
    }
}

/// Log output settings for the daemon.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace.
    pub level: String,
    /// `compact` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub persistence: PersistenceConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub supervisor: SupervisorConfig,
    pub shutdown: ShutdownConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
    /// Directory holding `<id>.pid` and `<id>.heartbeat` markers.
    pub work_dir: PathBuf,
}

impl LedgerConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment overrides are applied separately via
    /// [`apply_env_overrides`](Self::apply_env_overrides).
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {}", path.as_ref().display(), e)
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
    }

    /// Apply `RUNLEDGER_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = std::env::var("RUNLEDGER_DATABASE_URL")
            .ok()
            .or_else(|| std::env::var("DATABASE_URL").ok())
        {
            self.persistence.connection_string = url;
        }
        if let Ok(dir) = std::env::var("RUNLEDGER_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("RUNLEDGER_LOG") {
            self.logging.level = level;
        }
    }

    /// Validate configuration settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        let dialect = self.persistence.dialect()?;
        if dialect == Dialect::Postgres && self.persistence.pool_size == 0 {
            return Err(anyhow::anyhow!("persistence.pool_size must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry.max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(anyhow::anyhow!(
                "retry.jitter_ratio must be within 0.0..=1.0, got {}",
                self.retry.jitter_ratio
            ));
        }
        if self.supervisor.interval_seconds == 0 {
            return Err(anyhow::anyhow!("supervisor.interval_seconds must be positive"));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        LedgerConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = LedgerConfig::from_toml_str(
            r#"
            work_dir = "/var/lib/runledger"

            [persistence]
            connection_string = "postgres://localhost/runs"
            pool_size = 8

            [supervisor]
            interval_seconds = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.persistence.dialect().unwrap(), Dialect::Postgres);
        assert_eq!(config.persistence.pool_size, 8);
        assert_eq!(config.persistence.max_overflow, 10);
        assert_eq!(config.supervisor.interval_seconds, 10);
        assert_eq!(config.supervisor.heartbeat_stale_seconds, 300);
        assert_eq!(config.work_dir, PathBuf::from("/var/lib/runledger"));
        config.validate().unwrap();
    }

    #[test]
    fn test_explicit_backend_wins() {
        let config = PersistenceConfig {
            connection_string: "sqlite://x.db".into(),
            backend: Some(Dialect::Sqlite),
            ..Default::default()
        };
        assert_eq!(config.dialect().unwrap(), Dialect::Sqlite);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = LedgerConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.logging.level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.persistence.connection_string = "mysql://db".into();
        assert!(config.validate().is_err());
    }
}
