//! Denormalized listing table and the in-process aggregate cache.
//!
//! Two layers:
//! 1. `ledger_job_summary`, upserted in the same transaction as every ledger
//!    write and rebuildable from `ledger_jobs` in bulk
//! 2. A moka cache of aggregates keyed `stats:overall`, `stats:dataset:<name>`
//!    and `recent:<limit>`, each with its own TTL and invalidated by key
//!    prefix after committed writes

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use moka::Expiry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, Row};

use crate::config::CacheConfig;
use crate::dialect::Dialect;
use crate::error::LedgerError;
use crate::job::{micros_to_datetime, JobId, JobKind, JobRecord, JobStatus};

pub const OVERALL_STATS_KEY: &str = "stats:overall";
pub const DATASET_STATS_PREFIX: &str = "stats:dataset:";
pub const RECENT_PREFIX: &str = "recent:";

pub fn dataset_stats_key(dataset: &str) -> String {
    format!("{DATASET_STATS_PREFIX}{dataset}")
}

pub fn recent_key(limit: u32) -> String {
    format!("{RECENT_PREFIX}{limit}")
}

/// Listing projection of a ledger row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub dataset_name: String,
    pub preset: String,
    pub pipeline_mode: String,
    pub experiment_name: Option<String>,
    pub parent_job_id: Option<JobId>,
    pub progress_pct: Option<f64>,
    pub duration_seconds: Option<f64>,
    pub success: Option<bool>,
    pub is_terminal: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&JobRecord> for SummaryRow {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id.clone(),
            kind: job.kind(),
            status: job.status,
            dataset_name: job.dataset_name.clone(),
            preset: job.preset.clone(),
            pipeline_mode: job.pipeline_mode.clone(),
            experiment_name: job.variation.as_ref().map(|v| v.experiment_name.clone()),
            parent_job_id: job.variation.as_ref().map(|v| v.parent_job_id.clone()),
            progress_pct: job.progress_pct(),
            duration_seconds: job.duration_seconds,
            success: job.success,
            is_terminal: job.status.is_terminal(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

const SUMMARY_COLUMNS: &str = "id, kind, status, dataset_name, preset, pipeline_mode, \
     experiment_name, parent_job_id, progress_pct, duration_seconds, success, is_terminal, \
     created_at, updated_at";

impl SummaryRow {
    pub(crate) fn from_row(row: &AnyRow, dialect: Dialect) -> Result<Self, LedgerError> {
        let get_err = |e| dialect.classify(e);
        let id: String = row.try_get("id").map_err(get_err)?;
        let kind: String = row.try_get("kind").map_err(get_err)?;
        let status: String = row.try_get("status").map_err(get_err)?;
        let parent: Option<String> = row.try_get("parent_job_id").map_err(get_err)?;
        let success: Option<i64> = row.try_get("success").map_err(get_err)?;
        let is_terminal: i64 = row.try_get("is_terminal").map_err(get_err)?;
        let created_at: i64 = row.try_get("created_at").map_err(get_err)?;
        let updated_at: i64 = row.try_get("updated_at").map_err(get_err)?;

        Ok(Self {
            id: JobId::parse(id).map_err(|e| LedgerError::Schema(e.to_string()))?,
            kind: kind.parse()?,
            status: status.parse()?,
            dataset_name: row.try_get("dataset_name").map_err(get_err)?,
            preset: row.try_get("preset").map_err(get_err)?,
            pipeline_mode: row.try_get("pipeline_mode").map_err(get_err)?,
            experiment_name: row.try_get("experiment_name").map_err(get_err)?,
            parent_job_id: parent
                .map(JobId::parse)
                .transpose()
                .map_err(|e| LedgerError::Schema(e.to_string()))?,
            progress_pct: row.try_get("progress_pct").map_err(get_err)?,
            duration_seconds: row.try_get("duration_seconds").map_err(get_err)?,
            success: success.map(|v| v != 0),
            is_terminal: is_terminal != 0,
            created_at: micros_to_datetime(created_at),
            updated_at: micros_to_datetime(updated_at),
        })
    }
}

/// Insert or replace the projection of `job`.
pub(crate) async fn upsert(
    conn: &mut AnyConnection,
    dialect: Dialect,
    job: &JobRecord,
) -> Result<(), LedgerError> {
    let row = SummaryRow::from(job);
    let sql = dialect.sql(
        "INSERT INTO ledger_job_summary (id, kind, status, dataset_name, preset, pipeline_mode, \
         experiment_name, parent_job_id, progress_pct, duration_seconds, success, is_terminal, \
         created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (id) DO UPDATE SET status = excluded.status, \
         progress_pct = excluded.progress_pct, duration_seconds = excluded.duration_seconds, \
         success = excluded.success, is_terminal = excluded.is_terminal, \
         updated_at = excluded.updated_at",
    );
    sqlx::query(&sql)
        .bind(row.id.as_str().to_string())
        .bind(row.kind.as_str())
        .bind(row.status.as_str())
        .bind(row.dataset_name)
        .bind(row.preset)
        .bind(row.pipeline_mode)
        .bind(row.experiment_name)
        .bind(row.parent_job_id.map(String::from))
        .bind(row.progress_pct)
        .bind(row.duration_seconds)
        .bind(row.success.map(i64::from))
        .bind(i64::from(row.is_terminal))
        .bind(row.created_at.timestamp_micros())
        .bind(row.updated_at.timestamp_micros())
        .execute(&mut *conn)
        .await
        .map_err(|e| dialect.classify(e))?;
    Ok(())
}

/// Replace the whole table with a projection of `ledger_jobs`.
pub(crate) async fn rebuild(conn: &mut AnyConnection, dialect: Dialect) -> Result<u64, LedgerError> {
    sqlx::query("DELETE FROM ledger_job_summary")
        .execute(&mut *conn)
        .await
        .map_err(|e| dialect.classify(e))?;

    let inserted = sqlx::query(
        "INSERT INTO ledger_job_summary (id, kind, status, dataset_name, preset, pipeline_mode, \
         experiment_name, parent_job_id, progress_pct, duration_seconds, success, is_terminal, \
         created_at, updated_at) \
         SELECT id, kind, status, dataset_name, preset, pipeline_mode, experiment_name, \
         parent_job_id, \
         CASE WHEN total_steps > 0 \
              THEN CAST(current_step AS DOUBLE PRECISION) * 100.0 / total_steps \
              ELSE NULL END, \
         duration_seconds, success, \
         CASE WHEN status IN ('DONE', 'FAILED', 'CANCELLED') THEN 1 ELSE 0 END, \
         created_at, updated_at \
         FROM ledger_jobs",
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| dialect.classify(e))?;

    Ok(inserted.rows_affected())
}

/// Aggregate counters over the summary table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total: i64,
    pub by_status: BTreeMap<JobStatus, i64>,
    /// Jobs in PREPARING through GENERATING_ARTIFACT.
    pub active: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub cancelled: i64,
    /// DONE over DONE + FAILED; `None` before anything finished.
    pub success_rate: Option<f64>,
    /// Mean duration of successful runs.
    pub avg_duration_seconds: Option<f64>,
}

impl LedgerStats {
    pub fn count(&self, status: JobStatus) -> i64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    fn from_counts(by_status: BTreeMap<JobStatus, i64>, avg_duration_seconds: Option<f64>) -> Self {
        let count = |s: JobStatus| by_status.get(&s).copied().unwrap_or(0);
        let succeeded = count(JobStatus::Done);
        let failed = count(JobStatus::Failed);
        let finished = succeeded + failed;

        Self {
            total: by_status.values().sum(),
            active: JobStatus::ACTIVE.iter().map(|s| count(*s)).sum(),
            succeeded,
            failed,
            cancelled: count(JobStatus::Cancelled),
            success_rate: (finished > 0).then(|| succeeded as f64 / finished as f64),
            avg_duration_seconds,
            by_status,
        }
    }
}

/// Compute statistics, optionally restricted to one dataset.
pub(crate) async fn load_stats(
    conn: &mut AnyConnection,
    dialect: Dialect,
    dataset: Option<&str>,
) -> Result<LedgerStats, LedgerError> {
    let filter = if dataset.is_some() {
        " WHERE dataset_name = ?"
    } else {
        ""
    };

    let count_sql = dialect.sql(&format!(
        "SELECT status, COUNT(*) AS n FROM ledger_job_summary{filter} GROUP BY status"
    ));
    let mut counts = sqlx::query(&count_sql);
    if let Some(name) = dataset {
        counts = counts.bind(name.to_string());
    }
    let rows = counts
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| dialect.classify(e))?;

    let mut by_status = BTreeMap::new();
    for row in rows {
        let status: String = row.try_get("status").map_err(|e| dialect.classify(e))?;
        let n: i64 = row.try_get("n").map_err(|e| dialect.classify(e))?;
        by_status.insert(status.parse::<JobStatus>()?, n);
    }

    let joiner = if dataset.is_some() { " AND" } else { " WHERE" };
    let avg_sql = dialect.sql(&format!(
        "SELECT AVG(duration_seconds) AS avg_duration FROM ledger_job_summary{filter}{joiner} \
         success = 1"
    ));
    let mut avg = sqlx::query(&avg_sql);
    if let Some(name) = dataset {
        avg = avg.bind(name.to_string());
    }
    let row = avg
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| dialect.classify(e))?;
    let avg_duration: Option<f64> = row
        .try_get("avg_duration")
        .map_err(|e| dialect.classify(e))?;

    Ok(LedgerStats::from_counts(by_status, avg_duration))
}

/// Most recently created rows, newest first.
pub(crate) async fn load_recent(
    conn: &mut AnyConnection,
    dialect: Dialect,
    limit: u32,
) -> Result<Vec<SummaryRow>, LedgerError> {
    let sql = dialect.sql(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM ledger_job_summary \
         ORDER BY created_at DESC, id DESC LIMIT ?"
    ));
    let rows = sqlx::query(&sql)
        .bind(i64::from(limit))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| dialect.classify(e))?;
    rows.iter().map(|row| SummaryRow::from_row(row, dialect)).collect()
}

/// Values held by the aggregate cache.
#[derive(Clone, Debug)]
pub enum CachedAggregate {
    Stats(Arc<LedgerStats>),
    Recent(Arc<Vec<SummaryRow>>),
}

/// Per-key TTLs chosen by key prefix.
struct PrefixExpiry {
    overall: Duration,
    dataset: Duration,
    recent: Duration,
}

impl PrefixExpiry {
    fn ttl_for(&self, key: &str) -> Duration {
        if key.starts_with(DATASET_STATS_PREFIX) {
            self.dataset
        } else if key.starts_with(RECENT_PREFIX) {
            self.recent
        } else {
            self.overall
        }
    }
}

impl Expiry<String, CachedAggregate> for PrefixExpiry {
    fn expire_after_create(
        &self,
        key: &String,
        _value: &CachedAggregate,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.ttl_for(key))
    }
}

/// In-process TTL cache for aggregate reads.
///
/// Fills and invalidations take the same lock, so a load that started before
/// an invalidation can never land after it.
pub struct SummaryCache {
    cache: Cache<String, CachedAggregate>,
    /// Bumped on every invalidation; loads that started before a bump are
    /// not inserted.
    generation: AtomicU64,
    fill: Mutex<()>,
}

impl std::fmt::Debug for SummaryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryCache")
            .field("entries", &self.cache.entry_count())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl SummaryCache {
    pub fn new(config: &CacheConfig) -> Self {
        let expiry = PrefixExpiry {
            overall: Duration::from_secs(config.overall_stats_ttl_seconds),
            dataset: Duration::from_secs(config.dataset_stats_ttl_seconds),
            recent: Duration::from_secs(config.recent_jobs_ttl_seconds),
        };
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(expiry)
            .build();

        Self {
            cache,
            generation: AtomicU64::new(0),
            fill: Mutex::new(()),
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedAggregate> {
        self.cache.get(key)
    }

    /// Token to pass back to [`insert`](Self::insert) after a load.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Store a loaded value unless an invalidation happened since `generation`.
    pub fn insert(&self, key: String, value: CachedAggregate, generation: u64) {
        let _fill = self.fill.lock();
        if self.generation() == generation {
            self.cache.insert(key, value);
        } else {
            tracing::trace!(key = %key, "skipping cache fill raced by invalidation");
        }
    }

    /// Drop every key starting with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let _fill = self.fill.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.drop_prefix(prefix);
    }

    /// Drop every key a write to a row of `dataset` can affect.
    pub fn invalidate_for_dataset(&self, dataset: &str) {
        let _fill = self.fill.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate(OVERALL_STATS_KEY);
        self.cache.invalidate(&dataset_stats_key(dataset));
        self.drop_prefix(RECENT_PREFIX);
    }

    pub fn invalidate_all(&self) {
        let _fill = self.fill.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate_all();
    }

    fn drop_prefix(&self, prefix: &str) {
        let stale: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect();
        for key in stale {
            self.cache.invalidate(key.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total: i64) -> CachedAggregate {
        CachedAggregate::Stats(Arc::new(LedgerStats {
            total,
            ..Default::default()
        }))
    }

    fn cached_total(cache: &SummaryCache, key: &str) -> Option<i64> {
        match cache.get(key) {
            Some(CachedAggregate::Stats(stats)) => Some(stats.total),
            _ => None,
        }
    }

    #[test]
    fn test_ttl_by_prefix() {
        let expiry = PrefixExpiry {
            overall: Duration::from_secs(300),
            dataset: Duration::from_secs(600),
            recent: Duration::from_secs(60),
        };
        assert_eq!(expiry.ttl_for(OVERALL_STATS_KEY), Duration::from_secs(300));
        assert_eq!(expiry.ttl_for(&dataset_stats_key("faces")), Duration::from_secs(600));
        assert_eq!(expiry.ttl_for(&recent_key(20)), Duration::from_secs(60));
    }

    #[test]
    fn test_dataset_invalidation_spares_other_datasets() {
        let cache = SummaryCache::new(&CacheConfig::default());
        let generation = cache.generation();
        cache.insert(OVERALL_STATS_KEY.into(), stats(10), generation);
        cache.insert(dataset_stats_key("faces"), stats(4), generation);
        cache.insert(dataset_stats_key("cars"), stats(6), generation);
        cache.insert(recent_key(5), CachedAggregate::Recent(Arc::new(vec![])), generation);

        cache.invalidate_for_dataset("faces");

        assert_eq!(cached_total(&cache, OVERALL_STATS_KEY), None);
        assert_eq!(cached_total(&cache, &dataset_stats_key("faces")), None);
        assert_eq!(cached_total(&cache, &dataset_stats_key("cars")), Some(6));
        assert!(cache.get(&recent_key(5)).is_none());
    }

    #[test]
    fn test_fill_raced_by_invalidation_is_dropped() {
        let cache = SummaryCache::new(&CacheConfig::default());
        let generation = cache.generation();
        cache.invalidate_all();
        cache.insert(OVERALL_STATS_KEY.into(), stats(1), generation);

        assert!(cache.get(OVERALL_STATS_KEY).is_none());
    }

    #[test]
    fn test_concurrent_fill_never_outlives_invalidation() {
        let cache = SummaryCache::new(&CacheConfig::default());
        let done = std::sync::atomic::AtomicBool::new(false);

        let stale = std::thread::scope(|scope| {
            scope.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    let generation = cache.generation();
                    cache.insert(OVERALL_STATS_KEY.into(), stats(generation as i64), generation);
                }
            });

            let mut stale = Vec::new();
            for _ in 0..2_000 {
                cache.invalidate_for_dataset("faces");
                // Only this thread invalidates, so the generation is stable here.
                let current = cache.generation() as i64;
                if let Some(total) = cached_total(&cache, OVERALL_STATS_KEY) {
                    if total != current {
                        stale.push((total, current));
                    }
                }
            }
            done.store(true, Ordering::Relaxed);
            stale
        });
        assert!(stale.is_empty(), "values loaded before an invalidation survived it: {stale:?}");
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let config = CacheConfig {
            recent_jobs_ttl_seconds: 0,
            ..Default::default()
        };
        let cache = SummaryCache::new(&config);
        cache.insert(
            recent_key(5),
            CachedAggregate::Recent(Arc::new(vec![])),
            cache.generation(),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&recent_key(5)).is_none());
    }

    #[test]
    fn test_stats_from_counts() {
        let mut by_status = BTreeMap::new();
        by_status.insert(JobStatus::Done, 3);
        by_status.insert(JobStatus::Failed, 1);
        by_status.insert(JobStatus::Training, 2);
        by_status.insert(JobStatus::Pending, 4);

        let stats = LedgerStats::from_counts(by_status, Some(12.5));
        assert_eq!(stats.total, 10);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.success_rate, Some(0.75));
        assert_eq!(stats.count(JobStatus::Cancelled), 0);
    }
}
