//! The ledger façade: CRUD and status transitions over `ledger_jobs`.
//!
//! Every write runs in its own transaction through the [`RetryPolicy`], so
//! lock contention is retried with backoff and only surfaces once retries are
//! exhausted. The summary projection is upserted inside the same transaction;
//! cache invalidation, marker cleanup and event publishing happen after
//! commit.

mod rows;
pub mod schema;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, Row};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::dialect::Dialect;
use crate::error::LedgerError;
use crate::events::{EventSubscriber, LedgerEvent, LedgerEventBus, LedgerEventPayload};
use crate::job::{
    JobFilter, JobId, JobKind, JobPatch, JobRecord, JobStatus, JobVersion, NewJob, NewVariation,
    StatusUpdate,
};
use crate::markers::MarkerStore;
use crate::pool::PoolManager;
use crate::retry::RetryPolicy;
use crate::summary::{
    self, dataset_stats_key, recent_key, CachedAggregate, LedgerStats, SummaryCache, SummaryRow,
    OVERALL_STATS_KEY,
};
use crate::telemetry::{self, WriteTimer};
use crate::tx::{LedgerTx, TxCoordinator};

use rows::BindValue;

/// A committed row change.
#[derive(Clone, Debug)]
struct Change {
    before: Option<JobRecord>,
    after: JobRecord,
}

/// Condition checked against the current row before a patch applies.
#[derive(Clone, Copy, Debug)]
enum Precondition<'a> {
    None,
    /// Fail with `VersionConflict` unless the row carries this version.
    Version(JobVersion),
    /// Skip the row unless its status is one of these.
    StatusIn(&'a [JobStatus]),
}

/// Transactional job ledger shared by every component.
pub struct Ledger {
    pools: Arc<PoolManager>,
    tx: TxCoordinator,
    retry: RetryPolicy,
    cache: SummaryCache,
    markers: MarkerStore,
    events: LedgerEventBus,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("dialect", &self.pools.dialect())
            .field("markers", &self.markers.dir())
            .field("cache", &self.cache)
            .field("events", &self.events)
            .finish()
    }
}

impl Ledger {
    /// Assemble a ledger from parts. The schema is not touched; see
    /// [`open`](Self::open).
    pub fn new(
        pools: Arc<PoolManager>,
        retry: RetryPolicy,
        cache: SummaryCache,
        markers: MarkerStore,
    ) -> Self {
        Self {
            tx: TxCoordinator::new(Arc::clone(&pools)),
            pools,
            retry,
            cache,
            markers,
            events: LedgerEventBus::default(),
        }
    }

    /// Connect, create or migrate the schema, and return a ready ledger.
    pub async fn open(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let pools = Arc::new(PoolManager::connect(config.persistence.clone()).await?);
        let ledger = Self::new(
            pools,
            RetryPolicy::new(config.retry.clone()),
            SummaryCache::new(&config.cache),
            MarkerStore::new(config.work_dir.clone()),
        );
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    /// Create missing tables and add missing columns. Returns the added
    /// columns as `table.column`.
    pub async fn ensure_schema(&self) -> Result<Vec<String>, LedgerError> {
        schema::ensure_schema(&self.pools.pool(), self.dialect()).await
    }

    /// Backend in use.
    pub fn dialect(&self) -> Dialect {
        self.pools.dialect()
    }

    /// Pool owner, for health checks and raw queries.
    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// PID and heartbeat side files under the work directory.
    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    /// Aggregate cache over the summary projection.
    pub fn cache(&self) -> &SummaryCache {
        &self.cache
    }

    /// Transaction scopes for multi-statement work outside the write helpers.
    pub fn tx(&self) -> &TxCoordinator {
        &self.tx
    }

    /// Receive events published after each commit from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Close the pool. Later calls fail.
    pub async fn close(&self) {
        self.pools.dispose().await;
    }

    // ----- writes -----

    /// Insert a PENDING job. Fails with `Conflict` if the id exists.
    pub async fn create(&self, request: NewJob) -> Result<JobRecord, LedgerError> {
        let record = rows::new_record(&request, None, Utc::now())?;
        self.insert("create", record, None).await
    }

    /// Insert a PENDING variation of an existing parent job.
    pub async fn create_variation(&self, request: NewVariation) -> Result<JobRecord, LedgerError> {
        let parent = request.variation.parent_job_id.clone();
        if parent == request.job.id {
            return Err(LedgerError::Validation(format!(
                "variation {} cannot be its own parent",
                request.job.id
            )));
        }
        let record = rows::new_record(&request.job, Some(request.variation), Utc::now())?;
        self.insert("create_variation", record, Some(parent)).await
    }

    /// Move a job to `status`. Returns false if the job does not exist.
    pub async fn update_status(
        &self,
        id: &JobId,
        status: JobStatus,
        error_message: Option<String>,
        output_path: Option<String>,
    ) -> Result<bool, LedgerError> {
        let patch = JobPatch {
            status: Some(status),
            error_message,
            output_path,
            ..Default::default()
        };
        let change = self
            .patch_one("update_status", id, &patch, Precondition::None)
            .await?;
        Ok(change.is_some())
    }

    /// Record step progress. Returns false if the job does not exist.
    pub async fn set_progress(
        &self,
        id: &JobId,
        current_step: i64,
        total_steps: Option<i64>,
    ) -> Result<bool, LedgerError> {
        let patch = JobPatch::default().with_progress(current_step, total_steps);
        let change = self
            .patch_one("set_progress", id, &patch, Precondition::None)
            .await?;
        Ok(change.is_some())
    }

    pub async fn set_output(
        &self,
        id: &JobId,
        output_path: impl Into<String>,
    ) -> Result<bool, LedgerError> {
        let patch = JobPatch::default().with_output(output_path);
        let change = self
            .patch_one("set_output", id, &patch, Precondition::None)
            .await?;
        Ok(change.is_some())
    }

    /// Apply a partial update. Returns false if the job does not exist.
    pub async fn update(&self, id: &JobId, patch: JobPatch) -> Result<bool, LedgerError> {
        let change = self
            .patch_one("update", id, &patch, Precondition::None)
            .await?;
        Ok(change.is_some())
    }

    /// Apply `patch` only if the row still carries `version`.
    ///
    /// Returns the updated record, `None` if the job does not exist, or
    /// `VersionConflict` (row untouched) if another writer got there first.
    pub async fn update_if_version(
        &self,
        id: &JobId,
        version: JobVersion,
        patch: JobPatch,
    ) -> Result<Option<JobRecord>, LedgerError> {
        self.patch_one("update_if_version", id, &patch, Precondition::Version(version))
            .await
    }

    /// Move a job to `to` only if its current status is in `allowed_from`.
    ///
    /// The status is re-checked inside the transaction, so concurrent callers
    /// forcing the same transition write it once.
    pub async fn transition_if(
        &self,
        id: &JobId,
        allowed_from: &[JobStatus],
        to: JobStatus,
        error_message: Option<String>,
    ) -> Result<bool, LedgerError> {
        let patch = JobPatch {
            status: Some(to),
            error_message,
            ..Default::default()
        };
        let change = self
            .patch_one("transition_if", id, &patch, Precondition::StatusIn(allowed_from))
            .await?;
        Ok(change.is_some())
    }

    /// Apply several status updates in one transaction.
    ///
    /// Missing ids are skipped. Any invalid transition rolls back the whole
    /// batch. Returns the number of rows updated.
    pub async fn batch_update(&self, updates: &[StatusUpdate]) -> Result<u64, LedgerError> {
        let patches: Vec<(JobId, JobPatch)> = updates
            .iter()
            .map(|update| (update.id.clone(), update.as_patch()))
            .collect();
        let patches = patches.as_slice();
        let dialect = self.dialect();

        let changes = self
            .write("batch_update", "batch", move |mut tx| async move {
                let result = patch_many(&mut tx, dialect, patches, Precondition::None).await;
                (tx, result)
            })
            .await?;

        self.after_commit(&changes).await;
        Ok(changes.len() as u64)
    }

    /// Mark every PENDING, queued and active job CANCELLED with `reason`.
    pub async fn cancel_unfinished(&self, reason: &str) -> Result<u64, LedgerError> {
        let unfinished = JobStatus::unfinished();
        let unfinished = unfinished.as_slice();
        let patch = JobPatch::status(JobStatus::Cancelled).with_error(reason);
        let patch = &patch;
        let dialect = self.dialect();

        let changes = self
            .write("cancel_unfinished", "*", move |mut tx| async move {
                let result = cancel_in_tx(&mut tx, dialect, unfinished, patch).await;
                (tx, result)
            })
            .await?;

        let commit = self.after_commit(&changes).await;
        let job_ids: Vec<JobId> = changes.iter().map(|c| c.after.id.clone()).collect();
        telemetry::record_cancelled(job_ids.len() as u64, reason);
        if !job_ids.is_empty() {
            self.events.emit_correlated(commit, LedgerEventPayload::Cancelled {
                job_ids: job_ids.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(job_ids.len() as u64)
    }

    /// Delete terminal jobs created more than `older_than` ago, with their
    /// summary rows and markers. FAILED rows survive when `keep_failed`.
    pub async fn purge(
        &self,
        older_than: chrono::Duration,
        keep_failed: bool,
    ) -> Result<u64, LedgerError> {
        let cutoff = Utc::now() - older_than;
        let mut statuses = vec![JobStatus::Done, JobStatus::Cancelled];
        if !keep_failed {
            statuses.push(JobStatus::Failed);
        }
        let statuses = statuses.as_slice();
        let dialect = self.dialect();

        let purged = self
            .write("purge", "*", move |mut tx| async move {
                let result = purge_in_tx(&mut tx, dialect, statuses, cutoff).await;
                (tx, result)
            })
            .await?;

        for id in &purged {
            self.markers.discard(id).await;
        }
        self.cache.invalidate_all();
        if !purged.is_empty() {
            tracing::info!(count = purged.len(), cutoff = %cutoff, "purged old jobs");
            self.events.emit(LedgerEventPayload::Purged {
                count: purged.len() as u64,
            });
        }
        Ok(purged.len() as u64)
    }

    /// Recreate `ledger_job_summary` from `ledger_jobs`.
    pub async fn rebuild_summary(&self) -> Result<u64, LedgerError> {
        let dialect = self.dialect();
        let count = self
            .write("rebuild_summary", "*", move |mut tx| async move {
                let result = summary::rebuild(&mut tx, dialect).await;
                (tx, result)
            })
            .await?;
        self.cache.invalidate_all();
        tracing::info!(rows = count, "summary table rebuilt");
        Ok(count)
    }

    // ----- reads -----

    /// Read one job. A missing id is `Ok(None)`.
    pub async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, LedgerError> {
        let dialect = self.dialect();
        self.read("get", move || async move {
            let mut conn = self.acquire().await?;
            rows::fetch_job(&mut conn, dialect, id).await
        })
        .await
    }

    /// Jobs matching `filter`, newest first.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, LedgerError> {
        let dialect = self.dialect();
        let (sql, binds) = list_query(filter);
        let sql = dialect.sql(&sql);
        let (sql, binds) = (&*sql, binds.as_slice());

        self.read("list", move || async move {
            let mut conn = self.acquire().await?;
            let found = rows::bind_all(sqlx::query(sql), binds)
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| dialect.classify(e))?;
            found
                .iter()
                .map(|row| rows::decode_job(row, dialect))
                .collect()
        })
        .await
    }

    /// Jobs a worker process should currently be running for.
    pub async fn active_jobs(&self) -> Result<Vec<JobRecord>, LedgerError> {
        self.list(&JobFilter::with_statuses(JobStatus::ACTIVE)).await
    }

    /// Jobs not yet in a terminal status.
    pub async fn unfinished_jobs(&self) -> Result<Vec<JobRecord>, LedgerError> {
        self.list(&JobFilter::with_statuses(JobStatus::unfinished()))
            .await
    }

    pub async fn variations_of(&self, parent: &JobId) -> Result<Vec<JobRecord>, LedgerError> {
        self.list(&JobFilter::default().kind(JobKind::Variation).parent(parent.clone()))
            .await
    }

    /// Counts over every job, served from the cache while fresh.
    pub async fn overall_stats(&self) -> Result<LedgerStats, LedgerError> {
        self.cached_stats(OVERALL_STATS_KEY.to_string(), None).await
    }

    pub async fn dataset_stats(&self, dataset: &str) -> Result<LedgerStats, LedgerError> {
        self.cached_stats(dataset_stats_key(dataset), Some(dataset))
            .await
    }

    /// Most recently created jobs from the summary table, newest first.
    pub async fn recent_jobs(&self, limit: u32) -> Result<Vec<SummaryRow>, LedgerError> {
        let key = recent_key(limit);
        if let Some(CachedAggregate::Recent(rows)) = self.cache.get(&key) {
            return Ok(rows.as_ref().clone());
        }

        let generation = self.cache.generation();
        let dialect = self.dialect();
        let recent = self
            .read("recent_jobs", move || async move {
                let mut conn = self.acquire().await?;
                summary::load_recent(&mut conn, dialect, limit).await
            })
            .await?;
        self.cache
            .insert(key, CachedAggregate::Recent(Arc::new(recent.clone())), generation);
        Ok(recent)
    }

    /// Number of rows in `ledger_jobs`.
    pub async fn count(&self) -> Result<i64, LedgerError> {
        let dialect = self.dialect();
        self.read("count", move || async move {
            let mut conn = self.acquire().await?;
            let row = sqlx::query("SELECT COUNT(*) AS n FROM ledger_jobs")
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| dialect.classify(e))?;
            row.try_get::<i64, _>("n").map_err(|e| dialect.classify(e))
        })
        .await
    }

    // ----- plumbing -----

    async fn cached_stats(
        &self,
        key: String,
        dataset: Option<&str>,
    ) -> Result<LedgerStats, LedgerError> {
        if let Some(CachedAggregate::Stats(stats)) = self.cache.get(&key) {
            return Ok(stats.as_ref().clone());
        }

        let generation = self.cache.generation();
        let dialect = self.dialect();
        let stats = self
            .read("stats", move || async move {
                let mut conn = self.acquire().await?;
                summary::load_stats(&mut conn, dialect, dataset).await
            })
            .await?;
        self.cache
            .insert(key, CachedAggregate::Stats(Arc::new(stats.clone())), generation);
        Ok(stats)
    }

    async fn insert(
        &self,
        op: &'static str,
        record: JobRecord,
        parent: Option<JobId>,
    ) -> Result<JobRecord, LedgerError> {
        let dialect = self.dialect();
        let (job, parent) = (&record, parent.as_ref());

        self.write(op, record.id.as_str(), move |mut tx| async move {
            let result = insert_in_tx(&mut tx, dialect, job, parent).await;
            (tx, result)
        })
        .await?;

        self.after_commit(&[Change {
            before: None,
            after: record.clone(),
        }])
        .await;
        Ok(record)
    }

    async fn patch_one(
        &self,
        op: &'static str,
        id: &JobId,
        patch: &JobPatch,
        precondition: Precondition<'_>,
    ) -> Result<Option<JobRecord>, LedgerError> {
        let dialect = self.dialect();
        let change = self
            .write(op, id.as_str(), move |mut tx| async move {
                let result = patch_in_tx(&mut tx, dialect, id, patch, precondition).await;
                (tx, result)
            })
            .await?;

        match change {
            Some(change) => {
                self.after_commit(std::slice::from_ref(&change)).await;
                Ok(Some(change.after))
            }
            None => Ok(None),
        }
    }

    /// Run `f` in a transaction under the retry policy.
    async fn write<T, F, Fut>(&self, op: &'static str, job: &str, f: F) -> Result<T, LedgerError>
    where
        F: Fn(LedgerTx) -> Fut,
        Fut: Future<Output = (LedgerTx, Result<T, LedgerError>)>,
    {
        let timer = WriteTimer::start(op);
        let result =
            telemetry::instrument_write(op, job, self.retry.run(op, || self.tx.atomic(&f))).await;
        self.pools.record_outcome(&result).await;
        timer.finish(&result);
        result
    }

    async fn read<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let result = self.retry.run(op, f).await;
        self.pools.record_outcome(&result).await;
        result
    }

    async fn acquire(&self) -> Result<PoolConnection<Any>, LedgerError> {
        self.pools
            .pool()
            .acquire()
            .await
            .map_err(|e| self.dialect().classify(e))
    }

    /// Invalidate caches, discard markers and publish events for a commit.
    /// Returns the correlation id shared by the published events.
    async fn after_commit(&self, changes: &[Change]) -> Uuid {
        let mut datasets: Vec<&str> = changes.iter().map(|c| c.after.dataset_name.as_str()).collect();
        datasets.sort_unstable();
        datasets.dedup();
        for dataset in datasets {
            self.cache.invalidate_for_dataset(dataset);
        }

        let commit = Uuid::now_v7();
        for change in changes {
            let after = &change.after;
            let Some(before) = &change.before else {
                self.events.emit_correlated(commit, LedgerEventPayload::Created {
                    job_id: after.id.clone(),
                    kind: after.kind(),
                });
                continue;
            };

            if after.status.is_terminal() && !before.status.is_terminal() {
                self.markers.discard(&after.id).await;
                self.events.emit_correlated(commit, LedgerEventPayload::Finished {
                    job_id: after.id.clone(),
                    status: after.status,
                    error_message: after.error_message.clone(),
                    output_path: after.output_path.clone(),
                });
                continue;
            }
            if after.status != before.status {
                self.events.emit_correlated(commit, LedgerEventPayload::StatusChanged {
                    job_id: after.id.clone(),
                    from: before.status,
                    to: after.status,
                });
            }
            if after.current_step != before.current_step || after.total_steps != before.total_steps
            {
                self.events.emit_correlated(commit, LedgerEventPayload::Progress {
                    job_id: after.id.clone(),
                    current_step: after.current_step,
                    total_steps: after.total_steps,
                });
            }
            if let Some(path) = &after.output_path {
                if before.output_path.as_ref() != Some(path) {
                    self.events.emit_correlated(commit, LedgerEventPayload::OutputRecorded {
                        job_id: after.id.clone(),
                        output_path: path.clone(),
                    });
                }
            }
        }
        commit
    }
}

async fn insert_in_tx(
    conn: &mut AnyConnection,
    dialect: Dialect,
    job: &JobRecord,
    parent: Option<&JobId>,
) -> Result<(), LedgerError> {
    if let Some(parent) = parent {
        if rows::fetch_job(conn, dialect, parent).await?.is_none() {
            return Err(LedgerError::Validation(format!(
                "parent job {parent} does not exist"
            )));
        }
    }
    rows::insert_job(conn, dialect, job).await?;
    summary::upsert(conn, dialect, job).await
}

/// Read, check, patch and write back one row.
///
/// A row that moved between the read and the conditional write is reported
/// as `Contention` so the retry loop re-reads it, unless the caller pinned a
/// version.
async fn patch_in_tx(
    conn: &mut AnyConnection,
    dialect: Dialect,
    id: &JobId,
    patch: &JobPatch,
    precondition: Precondition<'_>,
) -> Result<Option<Change>, LedgerError> {
    let Some(current) = rows::fetch_job(conn, dialect, id).await? else {
        return Ok(None);
    };

    match precondition {
        Precondition::Version(expected) if current.version() != expected => {
            return Err(LedgerError::VersionConflict {
                job_id: id.clone(),
                expected: expected.0,
            });
        }
        Precondition::StatusIn(allowed) if !allowed.contains(&current.status) => {
            tracing::debug!(job_id = %id, status = %current.status, "precondition not met; skipping");
            return Ok(None);
        }
        _ => {}
    }

    let next = rows::apply_patch(&current, patch, Utc::now())?;
    if !rows::update_job_if(conn, dialect, &next, current.version()).await? {
        return Err(match precondition {
            Precondition::Version(expected) => LedgerError::VersionConflict {
                job_id: id.clone(),
                expected: expected.0,
            },
            _ => LedgerError::Contention(format!("job {id} changed during update")),
        });
    }
    summary::upsert(conn, dialect, &next).await?;

    Ok(Some(Change {
        before: Some(current),
        after: next,
    }))
}

async fn patch_many(
    conn: &mut AnyConnection,
    dialect: Dialect,
    patches: &[(JobId, JobPatch)],
    precondition: Precondition<'_>,
) -> Result<Vec<Change>, LedgerError> {
    let mut changes = Vec::with_capacity(patches.len());
    for (id, patch) in patches {
        if let Some(change) = patch_in_tx(conn, dialect, id, patch, precondition).await? {
            changes.push(change);
        }
    }
    Ok(changes)
}

async fn cancel_in_tx(
    conn: &mut AnyConnection,
    dialect: Dialect,
    unfinished: &[JobStatus],
    patch: &JobPatch,
) -> Result<Vec<Change>, LedgerError> {
    let mut sql = String::from("SELECT id FROM ledger_jobs WHERE ");
    let mut binds = Vec::new();
    rows::push_in_clause(
        &mut sql,
        &mut binds,
        "status",
        unfinished.iter().map(|s| s.as_str().to_string()),
    );
    let sql = dialect.sql(&sql);
    let found = rows::bind_all(sqlx::query(&sql), &binds)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| dialect.classify(e))?;

    let mut changes = Vec::with_capacity(found.len());
    for row in &found {
        let id: String = row.try_get("id").map_err(|e| dialect.classify(e))?;
        let id = JobId::parse(id).map_err(|e| LedgerError::Schema(e.to_string()))?;
        if let Some(change) =
            patch_in_tx(conn, dialect, &id, patch, Precondition::StatusIn(unfinished)).await?
        {
            changes.push(change);
        }
    }
    Ok(changes)
}

async fn purge_in_tx(
    conn: &mut AnyConnection,
    dialect: Dialect,
    statuses: &[JobStatus],
    cutoff: DateTime<Utc>,
) -> Result<Vec<JobId>, LedgerError> {
    let mut condition = String::new();
    let mut binds = Vec::new();
    rows::push_in_clause(
        &mut condition,
        &mut binds,
        "status",
        statuses.iter().map(|s| s.as_str().to_string()),
    );
    condition.push_str(" AND created_at < ?");
    binds.push(BindValue::Int(cutoff.timestamp_micros()));

    let select = dialect.sql(&format!("SELECT id FROM ledger_jobs WHERE {condition}"));
    let found = rows::bind_all(sqlx::query(&select), &binds)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| dialect.classify(e))?;
    let ids = found
        .iter()
        .map(|row| {
            let id: String = row.try_get("id").map_err(|e| dialect.classify(e))?;
            JobId::parse(id).map_err(|e| LedgerError::Schema(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if ids.is_empty() {
        return Ok(ids);
    }

    delete_jobs(conn, dialect, &ids).await?;
    Ok(ids)
}

/// Delete exactly `ids` from both tables. Rows that started matching the purge
/// condition after the SELECT are left for the next purge.
async fn delete_jobs(
    conn: &mut AnyConnection,
    dialect: Dialect,
    ids: &[JobId],
) -> Result<(), LedgerError> {
    let mut by_id = String::new();
    let mut binds = Vec::new();
    rows::push_in_clause(
        &mut by_id,
        &mut binds,
        "id",
        ids.iter().map(|id| id.as_str().to_string()),
    );
    for table in ["ledger_job_summary", "ledger_jobs"] {
        let delete = dialect.sql(&format!("DELETE FROM {table} WHERE {by_id}"));
        rows::bind_all(sqlx::query(&delete), &binds)
            .execute(&mut *conn)
            .await
            .map_err(|e| dialect.classify(e))?;
    }
    Ok(())
}

fn list_query(filter: &JobFilter) -> (String, Vec<BindValue>) {
    let mut conditions = Vec::new();
    let mut binds = Vec::new();

    if !filter.statuses.is_empty() {
        let mut clause = String::new();
        rows::push_in_clause(
            &mut clause,
            &mut binds,
            "status",
            filter.statuses.iter().map(|s| s.as_str().to_string()),
        );
        conditions.push(clause);
    }
    if let Some(kind) = filter.kind {
        conditions.push("kind = ?".to_string());
        binds.push(BindValue::Text(kind.as_str().to_string()));
    }
    if let Some(dataset) = &filter.dataset_name {
        conditions.push("dataset_name = ?".to_string());
        binds.push(BindValue::Text(dataset.clone()));
    }
    if let Some(experiment) = &filter.experiment_name {
        conditions.push("experiment_name = ?".to_string());
        binds.push(BindValue::Text(experiment.clone()));
    }
    if let Some(parent) = &filter.parent_job_id {
        conditions.push("parent_job_id = ?".to_string());
        binds.push(BindValue::Text(parent.as_str().to_string()));
    }
    if let Some(before) = filter.created_before {
        conditions.push("created_at < ?".to_string());
        binds.push(BindValue::Int(before.timestamp_micros()));
    }

    let mut sql = format!("SELECT {} FROM ledger_jobs", rows::JOB_COLUMNS);
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, id DESC");

    match (filter.limit, filter.offset) {
        (Some(limit), offset) => {
            sql.push_str(" LIMIT ?");
            binds.push(BindValue::Int(i64::from(limit)));
            if let Some(offset) = offset {
                sql.push_str(" OFFSET ?");
                binds.push(BindValue::Int(i64::from(offset)));
            }
        }
        (None, Some(offset)) => {
            sql.push_str(" LIMIT ? OFFSET ?");
            binds.push(BindValue::Int(i64::MAX));
            binds.push(BindValue::Int(i64::from(offset)));
        }
        (None, None) => {}
    }

    (sql, binds)
}
