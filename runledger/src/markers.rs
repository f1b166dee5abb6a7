//! Per-job side files: `<id>.pid` and `<id>.heartbeat`.
//!
//! The training invoker writes the PID of the process it launched and
//! refreshes the heartbeat while the job makes progress. The supervisor reads
//! both; terminal transitions delete them.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::LedgerError;
use crate::job::JobId;

const PID_EXT: &str = "pid";
const HEARTBEAT_EXT: &str = "heartbeat";

/// Markers found on disk for one job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Markers {
    pub pid: Option<u32>,
    pub heartbeat: Option<DateTime<Utc>>,
}

impl Markers {
    pub fn is_empty(&self) -> bool {
        self.pid.is_none() && self.heartbeat.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pid_path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{id}.{PID_EXT}"))
    }

    pub fn heartbeat_path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{id}.{HEARTBEAT_EXT}"))
    }

    pub async fn write_pid(&self, id: &JobId, pid: u32) -> Result<(), LedgerError> {
        self.write_atomic(&self.pid_path(id), pid.to_string()).await
    }

    /// Record a heartbeat at the current time.
    pub async fn touch_heartbeat(&self, id: &JobId) -> Result<(), LedgerError> {
        self.write_heartbeat(id, Utc::now()).await
    }

    pub async fn write_heartbeat(&self, id: &JobId, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.write_atomic(&self.heartbeat_path(id), at.to_rfc3339()).await
    }

    /// The recorded PID. A missing or unparsable file reads as `None`.
    pub async fn read_pid(&self, id: &JobId) -> Result<Option<u32>, LedgerError> {
        let path = self.pid_path(id);
        let Some(content) = read_optional(&path).await? else {
            return Ok(None);
        };
        match content.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => {
                tracing::warn!(path = %path.display(), "ignoring malformed pid marker");
                Ok(None)
            }
        }
    }

    /// Time of the last heartbeat.
    ///
    /// The file holds an RFC 3339 timestamp; when it does not parse, the
    /// file's modification time is used.
    pub async fn read_heartbeat(&self, id: &JobId) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let path = self.heartbeat_path(id);
        let Some(content) = read_optional(&path).await? else {
            return Ok(None);
        };
        if let Ok(at) = DateTime::parse_from_rfc3339(content.trim()) {
            return Ok(Some(at.with_timezone(&Utc)));
        }

        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read(&self, id: &JobId) -> Result<Markers, LedgerError> {
        Ok(Markers {
            pid: self.read_pid(id).await?,
            heartbeat: self.read_heartbeat(id).await?,
        })
    }

    /// Delete both markers. Missing files are not an error.
    pub async fn remove(&self, id: &JobId) -> Result<(), LedgerError> {
        for path in [self.pid_path(id), self.heartbeat_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "marker removed"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Best-effort removal that logs instead of failing.
    pub async fn discard(&self, id: &JobId) {
        if let Err(e) = self.remove(id).await {
            tracing::warn!(job_id = %id, error = %e, "failed to remove job markers");
        }
    }

    /// Write via a temp file and rename so readers never see a partial value.
    async fn write_atomic(&self, path: &Path, content: String) -> Result<(), LedgerError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, LedgerError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
