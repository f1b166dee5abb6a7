//! Table definitions and forward-only column migration.
//!
//! The DDL is valid on both engines: timestamps are BIGINT microseconds,
//! booleans are nullable 0/1 BIGINT and durations DOUBLE PRECISION.

use sqlx::{AnyPool, Row};

use crate::dialect::Dialect;
use crate::error::LedgerError;

pub const JOBS_TABLE: &str = "ledger_jobs";
pub const SUMMARY_TABLE: &str = "ledger_job_summary";

const CREATE_JOBS: &str = r#"
    CREATE TABLE IF NOT EXISTS ledger_jobs (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL DEFAULT 'job',
        status TEXT NOT NULL,
        pipeline_mode TEXT NOT NULL,
        dataset_name TEXT NOT NULL,
        preset TEXT NOT NULL,
        total_steps BIGINT,
        current_step BIGINT NOT NULL DEFAULT 0,
        start_time BIGINT,
        end_time BIGINT,
        duration_seconds DOUBLE PRECISION,
        success BIGINT,
        error_message TEXT,
        output_path TEXT,
        parent_job_id TEXT,
        experiment_name TEXT,
        variation_id TEXT,
        varied_parameters TEXT,
        parameter_values TEXT,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )
"#;

const CREATE_SUMMARY: &str = r#"
    CREATE TABLE IF NOT EXISTS ledger_job_summary (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        dataset_name TEXT NOT NULL,
        preset TEXT NOT NULL,
        pipeline_mode TEXT NOT NULL,
        experiment_name TEXT,
        parent_job_id TEXT,
        progress_pct DOUBLE PRECISION,
        duration_seconds DOUBLE PRECISION,
        success BIGINT,
        is_terminal BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )
"#;

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_ledger_jobs_status ON ledger_jobs (status)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_jobs_parent ON ledger_jobs (parent_job_id)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_jobs_created ON ledger_jobs (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_summary_status ON ledger_job_summary (status)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_summary_dataset ON ledger_job_summary (dataset_name)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_summary_created ON ledger_job_summary (created_at)",
];

/// Columns added after the first release, with the definition used to add
/// them to an older table.
const JOBS_LATE_COLUMNS: &[(&str, &str)] = &[
    ("kind", "TEXT NOT NULL DEFAULT 'job'"),
    ("total_steps", "BIGINT"),
    ("current_step", "BIGINT NOT NULL DEFAULT 0"),
    ("output_path", "TEXT"),
    ("parent_job_id", "TEXT"),
    ("experiment_name", "TEXT"),
    ("variation_id", "TEXT"),
    ("varied_parameters", "TEXT"),
    ("parameter_values", "TEXT"),
];

const SUMMARY_LATE_COLUMNS: &[(&str, &str)] = &[
    ("experiment_name", "TEXT"),
    ("parent_job_id", "TEXT"),
    ("progress_pct", "DOUBLE PRECISION"),
];

/// Create missing tables and indexes and add columns missing from tables
/// created by older versions. Returns the names of added columns.
pub async fn ensure_schema(pool: &AnyPool, dialect: Dialect) -> Result<Vec<String>, LedgerError> {
    let mut added = Vec::new();
    for (table, ddl, late) in [
        (JOBS_TABLE, CREATE_JOBS, JOBS_LATE_COLUMNS),
        (SUMMARY_TABLE, CREATE_SUMMARY, SUMMARY_LATE_COLUMNS),
    ] {
        if table_exists(pool, dialect, table).await? {
            let existing = columns(pool, dialect, table).await?;
            for (column, definition) in late {
                if existing.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                    continue;
                }
                let alter = format!("ALTER TABLE {table} ADD COLUMN {column} {definition}");
                sqlx::query(&alter)
                    .execute(pool)
                    .await
                    .map_err(|e| dialect.classify(e))?;
                tracing::info!(table, column, "added missing ledger column");
                added.push(format!("{table}.{column}"));
            }
        } else {
            sqlx::query(ddl)
                .execute(pool)
                .await
                .map_err(|e| dialect.classify(e))?;
            tracing::debug!(table, "created ledger table");
        }
    }

    for ddl in CREATE_INDEXES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| dialect.classify(e))?;
    }
    Ok(added)
}

async fn table_exists(pool: &AnyPool, dialect: Dialect, table: &str) -> Result<bool, LedgerError> {
    let row = sqlx::query(dialect.table_exists_query())
        .bind(table.to_string())
        .fetch_optional(pool)
        .await
        .map_err(|e| dialect.classify(e))?;
    Ok(row.is_some())
}

async fn columns(pool: &AnyPool, dialect: Dialect, table: &str) -> Result<Vec<String>, LedgerError> {
    let rows = sqlx::query(dialect.columns_query())
        .bind(table.to_string())
        .fetch_all(pool)
        .await
        .map_err(|e| dialect.classify(e))?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("name").map_err(|e| dialect.classify(e)))
        .collect()
}
