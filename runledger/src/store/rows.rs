//! Row encoding and the pure status-transition rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, Row};

use crate::dialect::Dialect;
use crate::error::LedgerError;
use crate::job::{
    micros_to_datetime, JobId, JobKind, JobPatch, JobRecord, JobStatus, JobVersion, NewJob,
    VariationInfo,
};

pub(crate) const JOB_COLUMNS: &str = "id, kind, status, pipeline_mode, dataset_name, preset, \
     total_steps, current_step, start_time, end_time, duration_seconds, success, error_message, \
     output_path, parent_job_id, experiment_name, variation_id, varied_parameters, \
     parameter_values, created_at, updated_at";

pub(crate) fn decode_job(row: &AnyRow, dialect: Dialect) -> Result<JobRecord, LedgerError> {
    let get_err = |e| dialect.classify(e);

    let id: String = row.try_get("id").map_err(get_err)?;
    let kind: String = row.try_get("kind").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let start_time: Option<i64> = row.try_get("start_time").map_err(get_err)?;
    let end_time: Option<i64> = row.try_get("end_time").map_err(get_err)?;
    let success: Option<i64> = row.try_get("success").map_err(get_err)?;
    let created_at: i64 = row.try_get("created_at").map_err(get_err)?;
    let updated_at: i64 = row.try_get("updated_at").map_err(get_err)?;

    let variation = match kind.parse::<JobKind>()? {
        JobKind::Job => None,
        JobKind::Variation => {
            let parent: Option<String> = row.try_get("parent_job_id").map_err(get_err)?;
            let varied: Option<String> = row.try_get("varied_parameters").map_err(get_err)?;
            let values: Option<String> = row.try_get("parameter_values").map_err(get_err)?;
            Some(VariationInfo {
                parent_job_id: JobId::parse(parent.unwrap_or_default())
                    .map_err(|e| LedgerError::Schema(format!("variation {id}: {e}")))?,
                experiment_name: row
                    .try_get::<Option<String>, _>("experiment_name")
                    .map_err(get_err)?
                    .unwrap_or_default(),
                variation_id: row
                    .try_get::<Option<String>, _>("variation_id")
                    .map_err(get_err)?
                    .unwrap_or_default(),
                varied_parameters: decode_map(varied.as_deref())?,
                parameter_values: decode_map(values.as_deref())?,
            })
        }
    };

    Ok(JobRecord {
        id: JobId::parse(id).map_err(|e| LedgerError::Schema(e.to_string()))?,
        status: status.parse()?,
        pipeline_mode: row.try_get("pipeline_mode").map_err(get_err)?,
        dataset_name: row.try_get("dataset_name").map_err(get_err)?,
        preset: row.try_get("preset").map_err(get_err)?,
        total_steps: row.try_get("total_steps").map_err(get_err)?,
        current_step: row.try_get("current_step").map_err(get_err)?,
        start_time: start_time.map(micros_to_datetime),
        end_time: end_time.map(micros_to_datetime),
        duration_seconds: row.try_get("duration_seconds").map_err(get_err)?,
        success: success.map(|v| v != 0),
        error_message: row.try_get("error_message").map_err(get_err)?,
        output_path: row.try_get("output_path").map_err(get_err)?,
        created_at: micros_to_datetime(created_at),
        updated_at: micros_to_datetime(updated_at),
        variation,
    })
}

fn decode_map(text: Option<&str>) -> Result<BTreeMap<String, serde_json::Value>, LedgerError> {
    match text {
        None | Some("") => Ok(BTreeMap::new()),
        Some(text) => Ok(serde_json::from_str(text)?),
    }
}

/// A fresh PENDING record.
pub(crate) fn new_record(
    request: &NewJob,
    variation: Option<VariationInfo>,
    now: DateTime<Utc>,
) -> Result<JobRecord, LedgerError> {
    if request.pipeline_mode.trim().is_empty() {
        return Err(LedgerError::Validation("pipeline_mode is required".into()));
    }
    if request.total_steps.is_some_and(|t| t < 0) {
        return Err(LedgerError::Validation("total_steps must not be negative".into()));
    }
    // Truncate to the stored precision so the returned record equals a re-read.
    let now = micros_to_datetime(now.timestamp_micros());

    Ok(JobRecord {
        id: request.id.clone(),
        status: JobStatus::Pending,
        pipeline_mode: request.pipeline_mode.clone(),
        dataset_name: request.dataset_name.clone(),
        preset: request.preset.clone(),
        total_steps: request.total_steps,
        current_step: 0,
        start_time: None,
        end_time: None,
        duration_seconds: None,
        success: None,
        error_message: None,
        output_path: None,
        created_at: now,
        updated_at: now,
        variation,
    })
}

/// Apply `patch` to `current` as a write happening at `now`.
///
/// Entering TRAINING from another status (re)sets `start_time`. Entering a
/// terminal status sets `end_time`, `success` and, when the job had started,
/// `duration_seconds`. FAILED must carry an error message.
pub(crate) fn apply_patch(
    current: &JobRecord,
    patch: &JobPatch,
    now: DateTime<Utc>,
) -> Result<JobRecord, LedgerError> {
    let mut next = current.clone();
    let version = current.version().next(now);
    let now = micros_to_datetime(version.0);

    if let Some(step) = patch.current_step {
        if step < 0 {
            return Err(LedgerError::Validation("current_step must not be negative".into()));
        }
        next.current_step = step;
    }
    if let Some(total) = patch.total_steps {
        if total < 0 {
            return Err(LedgerError::Validation("total_steps must not be negative".into()));
        }
        next.total_steps = Some(total);
    }
    if let Some(error) = &patch.error_message {
        next.error_message = Some(error.clone());
    }
    if let Some(path) = &patch.output_path {
        next.output_path = Some(path.clone());
    }

    if let Some(status) = patch.status {
        if !current.status.can_transition_to(status) {
            return Err(LedgerError::InvalidTransition {
                job_id: current.id.clone(),
                from: current.status,
                to: status,
            });
        }
        if status == JobStatus::Failed
            && next.error_message.as_deref().map_or(true, |m| m.trim().is_empty())
        {
            return Err(LedgerError::Validation(format!(
                "job {} cannot be marked FAILED without an error message",
                current.id
            )));
        }

        if status == JobStatus::Training && current.status != JobStatus::Training {
            next.start_time = Some(now);
        }
        if status.is_terminal() {
            next.end_time = Some(now);
            next.duration_seconds = next
                .start_time
                .map(|start| (now - start).num_microseconds().unwrap_or(0) as f64 / 1e6);
            next.success = Some(status == JobStatus::Done);
        }
        next.status = status;
    } else if current.status.is_terminal()
        && (patch.current_step.is_some() || patch.total_steps.is_some())
    {
        return Err(LedgerError::Validation(format!(
            "job {} is {} and no longer reports progress",
            current.id, current.status
        )));
    }

    next.updated_at = now;
    Ok(next)
}

pub(crate) async fn fetch_job(
    conn: &mut AnyConnection,
    dialect: Dialect,
    id: &JobId,
) -> Result<Option<JobRecord>, LedgerError> {
    let sql = dialect.sql(&format!("SELECT {JOB_COLUMNS} FROM ledger_jobs WHERE id = ?"));
    let row = sqlx::query(&sql)
        .bind(id.as_str().to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| dialect.classify(e))?;
    row.map(|row| decode_job(&row, dialect)).transpose()
}

pub(crate) async fn insert_job(
    conn: &mut AnyConnection,
    dialect: Dialect,
    job: &JobRecord,
) -> Result<(), LedgerError> {
    let variation = job.variation.as_ref();
    let varied = variation
        .map(|v| serde_json::to_string(&v.varied_parameters))
        .transpose()?;
    let values = variation
        .map(|v| serde_json::to_string(&v.parameter_values))
        .transpose()?;

    let sql = dialect.sql(&format!(
        "INSERT INTO ledger_jobs ({JOB_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ));
    sqlx::query(&sql)
        .bind(job.id.as_str().to_string())
        .bind(job.kind().as_str())
        .bind(job.status.as_str())
        .bind(job.pipeline_mode.clone())
        .bind(job.dataset_name.clone())
        .bind(job.preset.clone())
        .bind(job.total_steps)
        .bind(job.current_step)
        .bind(job.start_time.map(|t| t.timestamp_micros()))
        .bind(job.end_time.map(|t| t.timestamp_micros()))
        .bind(job.duration_seconds)
        .bind(job.success.map(i64::from))
        .bind(job.error_message.clone())
        .bind(job.output_path.clone())
        .bind(variation.map(|v| v.parent_job_id.as_str().to_string()))
        .bind(variation.map(|v| v.experiment_name.clone()))
        .bind(variation.map(|v| v.variation_id.clone()))
        .bind(varied)
        .bind(values)
        .bind(job.created_at.timestamp_micros())
        .bind(job.updated_at.timestamp_micros())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if dialect.is_unique_violation(&e) {
                LedgerError::Conflict(job.id.clone())
            } else {
                dialect.classify(e)
            }
        })?;
    Ok(())
}

/// Write the mutable columns of `next` if the row still carries `expected`.
///
/// Returns false when the row moved on (or vanished) since it was read.
pub(crate) async fn update_job_if(
    conn: &mut AnyConnection,
    dialect: Dialect,
    next: &JobRecord,
    expected: JobVersion,
) -> Result<bool, LedgerError> {
    let sql = dialect.sql(
        r#"
        UPDATE ledger_jobs
        SET status = ?,
            total_steps = ?,
            current_step = ?,
            start_time = ?,
            end_time = ?,
            duration_seconds = ?,
            success = ?,
            error_message = ?,
            output_path = ?,
            updated_at = ?
        WHERE id = ? AND updated_at = ?
        "#,
    );
    let result = sqlx::query(&sql)
        .bind(next.status.as_str())
        .bind(next.total_steps)
        .bind(next.current_step)
        .bind(next.start_time.map(|t| t.timestamp_micros()))
        .bind(next.end_time.map(|t| t.timestamp_micros()))
        .bind(next.duration_seconds)
        .bind(next.success.map(i64::from))
        .bind(next.error_message.clone())
        .bind(next.output_path.clone())
        .bind(next.updated_at.timestamp_micros())
        .bind(next.id.as_str().to_string())
        .bind(expected.0)
        .execute(&mut *conn)
        .await
        .map_err(|e| dialect.classify(e))?;
    Ok(result.rows_affected() == 1)
}

/// Values bound to a dynamically assembled query.
#[derive(Clone, Debug)]
pub(crate) enum BindValue {
    Text(String),
    Int(i64),
}

pub(crate) fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    values: &[BindValue],
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    for value in values {
        query = match value {
            BindValue::Text(text) => query.bind(text.clone()),
            BindValue::Int(n) => query.bind(*n),
        };
    }
    query
}

/// Append `column IN (?, ?, ...)` for `values`.
pub(crate) fn push_in_clause(
    sql: &mut String,
    binds: &mut Vec<BindValue>,
    column: &str,
    values: impl IntoIterator<Item = String>,
) {
    let values: Vec<String> = values.into_iter().collect();
    if values.is_empty() {
        sql.push_str("1 = 0");
        return;
    }
    let placeholders = vec!["?"; values.len()].join(", ");
    sql.push_str(&format!("{column} IN ({placeholders})"));
    binds.extend(values.into_iter().map(BindValue::Text));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pending() -> JobRecord {
        let request = NewJob::new(JobId::parse("abc12345").unwrap(), "train", "faces", "sdxl");
        new_record(&request, None, Utc::now() - Duration::minutes(5)).unwrap()
    }

    #[test]
    fn test_training_sets_start_time() {
        let job = pending();
        let now = Utc::now();
        let next = apply_patch(&job, &JobPatch::status(JobStatus::Training), now).unwrap();
        assert_eq!(next.status, JobStatus::Training);
        assert_eq!(next.start_time, Some(next.updated_at));
        assert!(next.end_time.is_none());
        assert!(next.version() > job.version());

        // Refreshing TRAINING keeps the original start.
        let again = apply_patch(&next, &JobPatch::status(JobStatus::Training), now).unwrap();
        assert_eq!(again.start_time, next.start_time);
        assert!(again.version() > next.version());
    }

    #[test]
    fn test_terminal_sets_end_time_and_duration() {
        let job = pending();
        let started = apply_patch(
            &job,
            &JobPatch::status(JobStatus::Training),
            Utc::now() - Duration::seconds(90),
        )
        .unwrap();
        let done = apply_patch(&started, &JobPatch::status(JobStatus::Done), Utc::now()).unwrap();

        let (start, end) = (done.start_time.unwrap(), done.end_time.unwrap());
        let expected = (end - start).num_microseconds().unwrap() as f64 / 1e6;
        assert_eq!(done.duration_seconds, Some(expected));
        assert!(expected >= 89.0);
        assert_eq!(done.success, Some(true));
    }

    #[test]
    fn test_cancel_before_start_has_no_duration() {
        let cancelled = apply_patch(
            &pending(),
            &JobPatch::status(JobStatus::Cancelled).with_error("interrupted"),
            Utc::now(),
        )
        .unwrap();
        assert!(cancelled.end_time.is_some());
        assert_eq!(cancelled.duration_seconds, None);
        assert_eq!(cancelled.success, Some(false));
    }

    #[test]
    fn test_failed_requires_message() {
        let err = apply_patch(&pending(), &JobPatch::status(JobStatus::Failed), Utc::now());
        assert!(matches!(err, Err(LedgerError::Validation(_))));

        let failed = apply_patch(
            &pending(),
            &JobPatch::status(JobStatus::Failed).with_error("out of memory"),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("out of memory"));
    }

    #[test]
    fn test_terminal_rejects_transitions_and_progress() {
        let done = apply_patch(&pending(), &JobPatch::status(JobStatus::Done), Utc::now()).unwrap();
        assert!(matches!(
            apply_patch(&done, &JobPatch::status(JobStatus::Training), Utc::now()),
            Err(LedgerError::InvalidTransition { .. })
        ));
        assert!(apply_patch(
            &done,
            &JobPatch::default().with_progress(3, None),
            Utc::now()
        )
        .is_err());

        // Recording an output path after the fact is allowed.
        let with_output = apply_patch(
            &done,
            &JobPatch::default().with_output("/out/a.safetensors"),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(with_output.status, JobStatus::Done);
        assert_eq!(with_output.end_time, done.end_time);
    }

    #[test]
    fn test_backward_transition_rejected() {
        let training =
            apply_patch(&pending(), &JobPatch::status(JobStatus::Training), Utc::now()).unwrap();
        assert!(matches!(
            apply_patch(&training, &JobPatch::status(JobStatus::Preparing), Utc::now()),
            Err(LedgerError::InvalidTransition {
                from: JobStatus::Training,
                to: JobStatus::Preparing,
                ..
            })
        ));
    }

    #[test]
    fn test_in_clause() {
        let mut sql = String::from("SELECT id FROM ledger_jobs WHERE ");
        let mut binds = Vec::new();
        push_in_clause(&mut sql, &mut binds, "status", ["DONE".into(), "FAILED".into()]);
        assert_eq!(sql, "SELECT id FROM ledger_jobs WHERE status IN (?, ?)");
        assert_eq!(binds.len(), 2);
    }
}
