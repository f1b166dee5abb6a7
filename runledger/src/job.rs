//! Job identity, lifecycle states and the records stored in the ledger.
//!
//! Status order encodes the forward path of a job; see
//! [`JobStatus::can_transition_to`].

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;

const MAX_ID_LEN: usize = 64;

/// Unique, immutable job identifier.
///
/// Ids double as side-file names, so only ASCII alphanumerics, `-` and `_`
/// are accepted.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh 8-character id.
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(simple[..8].to_string())
    }

    /// Validate and wrap an externally supplied id.
    pub fn parse(value: impl Into<String>) -> Result<Self, LedgerError> {
        let value = value.into();
        if value.is_empty() || value.len() > MAX_ID_LEN {
            return Err(LedgerError::Validation(format!(
                "job id must be 1..={MAX_ID_LEN} characters, got {}",
                value.len()
            )));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(LedgerError::Validation(format!(
                "job id {value:?} contains characters outside [A-Za-z0-9_-]"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobId {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

/// Lifecycle status of a job.
///
/// Declaration order is pipeline order; non-terminal statuses only move
/// forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InQueue,
    Preparing,
    Configuring,
    Ready,
    Training,
    GeneratingArtifact,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 10] = [
        JobStatus::Pending,
        JobStatus::InQueue,
        JobStatus::Preparing,
        JobStatus::Configuring,
        JobStatus::Ready,
        JobStatus::Training,
        JobStatus::GeneratingArtifact,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Statuses in which a worker process is expected to be running.
    pub const ACTIVE: [JobStatus; 5] = [
        JobStatus::Preparing,
        JobStatus::Configuring,
        JobStatus::Ready,
        JobStatus::Training,
        JobStatus::GeneratingArtifact,
    ];

    /// Statuses that have not started running yet.
    pub const QUEUED: [JobStatus; 2] = [JobStatus::Pending, JobStatus::InQueue];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InQueue => "IN_QUEUE",
            JobStatus::Preparing => "PREPARING",
            JobStatus::Configuring => "CONFIGURING",
            JobStatus::Ready => "READY",
            JobStatus::Training => "TRAINING",
            JobStatus::GeneratingArtifact => "GENERATING_ARTIFACT",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// Non-terminal statuses: active plus queued.
    pub fn unfinished() -> Vec<JobStatus> {
        Self::ALL.into_iter().filter(|s| !s.is_terminal()).collect()
    }

    /// Canonical transition table.
    ///
    /// Terminal statuses accept nothing. A non-terminal status may repeat
    /// itself, move to any later non-terminal status, or finish.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.is_terminal() || next >= *self
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| LedgerError::Schema(format!("unknown job status {s:?}")))
    }
}

/// Discriminates plain jobs from experiment variations in the shared table.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Job,
    Variation,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Job => "job",
            JobKind::Variation => "variation",
        }
    }
}

impl FromStr for JobKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job" => Ok(JobKind::Job),
            "variation" => Ok(JobKind::Variation),
            other => Err(LedgerError::Schema(format!("unknown job kind {other:?}"))),
        }
    }
}

/// Optimistic-lock token: the row's `updated_at` in microseconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct JobVersion(pub i64);

impl JobVersion {
    /// Token for a write happening now, strictly after `self`.
    pub fn next(&self, now: DateTime<Utc>) -> JobVersion {
        JobVersion(now.timestamp_micros().max(self.0 + 1))
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        micros_to_datetime(self.0)
    }
}

impl Display for JobVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// Experiment-sweep metadata carried by variation rows.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariationInfo {
    pub parent_job_id: JobId,
    pub experiment_name: String,
    pub variation_id: String,
    pub varied_parameters: BTreeMap<String, serde_json::Value>,
    pub parameter_values: BTreeMap<String, serde_json::Value>,
}

impl Default for JobId {
    fn default() -> Self {
        Self::generate()
    }
}

/// A ledger row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub pipeline_mode: String,
    pub dataset_name: String,
    pub preset: String,
    pub total_steps: Option<i64>,
    pub current_step: i64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub output_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub variation: Option<VariationInfo>,
}

impl JobRecord {
    pub fn kind(&self) -> JobKind {
        if self.variation.is_some() {
            JobKind::Variation
        } else {
            JobKind::Job
        }
    }

    pub fn version(&self) -> JobVersion {
        JobVersion(self.updated_at.timestamp_micros())
    }

    pub fn progress_pct(&self) -> Option<f64> {
        match self.total_steps {
            Some(total) if total > 0 => Some(self.current_step as f64 * 100.0 / total as f64),
            _ => None,
        }
    }
}

/// Caller-supplied description of a new job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewJob {
    pub id: JobId,
    pub pipeline_mode: String,
    pub dataset_name: String,
    pub preset: String,
    pub total_steps: Option<i64>,
}

impl NewJob {
    pub fn new(
        id: JobId,
        pipeline_mode: impl Into<String>,
        dataset_name: impl Into<String>,
        preset: impl Into<String>,
    ) -> Self {
        Self {
            id,
            pipeline_mode: pipeline_mode.into(),
            dataset_name: dataset_name.into(),
            preset: preset.into(),
            total_steps: None,
        }
    }

    pub fn with_total_steps(mut self, steps: i64) -> Self {
        self.total_steps = Some(steps);
        self
    }
}

/// Caller-supplied description of a new variation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewVariation {
    pub job: NewJob,
    pub variation: VariationInfo,
}

/// Partial update applied to a row.
///
/// Unset fields are left alone. A status change goes through the transition
/// table and brings its timing side effects with it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub error_message: Option<String>,
    pub output_path: Option<String>,
    pub current_step: Option<i64>,
    pub total_steps: Option<i64>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn with_output(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_progress(mut self, current_step: i64, total_steps: Option<i64>) -> Self {
        self.current_step = Some(current_step);
        self.total_steps = total_steps;
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &JobPatch::default()
    }
}

/// One entry of a batch status update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub id: JobId,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub output_path: Option<String>,
}

impl StatusUpdate {
    pub fn new(id: JobId, status: JobStatus) -> Self {
        Self {
            id,
            status,
            error_message: None,
            output_path: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn with_output(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn as_patch(&self) -> JobPatch {
        JobPatch {
            status: Some(self.status),
            error_message: self.error_message.clone(),
            output_path: self.output_path.clone(),
            ..Default::default()
        }
    }
}

/// Filter for [`Ledger::list`](crate::store::Ledger::list).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub kind: Option<JobKind>,
    pub dataset_name: Option<String>,
    pub experiment_name: Option<String>,
    pub parent_job_id: Option<JobId>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl JobFilter {
    pub fn with_statuses(statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn dataset(mut self, name: impl Into<String>) -> Self {
        self.dataset_name = Some(name.into());
        self
    }

    pub fn kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn parent(mut self, parent: JobId) -> Self {
        self.parent_job_id = Some(parent);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}
