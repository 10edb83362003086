//! Durable job queue: the job record, the backend-agnostic [`QueueManager`]
//! contract, and the two backends that implement it.

mod migrations;
pub mod redis;
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

pub use self::redis::RedisQueue;
pub use self::sqlite::SqliteQueue;

pub const DEFAULT_LIST_LIMIT: u32 = 50;
pub const MAX_LIST_LIMIT: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub const TERMINAL: [JobStatus; 3] = [
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::InvalidStatus(s.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Job {
    #[serde(rename = "job_id")]
    pub id: String,
    pub context: Option<String>,
    #[serde(rename = "hash")]
    pub hash_filter: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub context: Option<String>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl JobFilter {
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)
    }
}

/// Fields written by [`QueueManager::update_status`]. `None` leaves the
/// stored value untouched.
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn completed(
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        result: serde_json::Value,
    ) -> Self {
        Self {
            started_at: Some(started_at),
            completed_at: Some(completed_at),
            result: Some(result),
            ..Self::new(JobStatus::Completed)
        }
    }

    pub fn failed(
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            started_at: Some(started_at),
            completed_at: Some(completed_at),
            error: Some(error.into()),
            ..Self::new(JobStatus::Failed)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct QueueStats {
    pub total_jobs: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub average_execution_time: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("invalid job payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("job {id} is {status} and can no longer change status")]
    InvalidTransition { id: String, status: JobStatus },
    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("queue is closed")]
    Closed,
}

/// Backend-agnostic job queue. Implementations must be safe to share between
/// the worker thread and every HTTP handler.
pub trait QueueManager: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn enqueue(&self, context: Option<&str>, hash_filter: Option<&str>)
    -> Result<String, QueueError>;

    /// Claims the oldest pending job, moving it to `processing`. Two callers
    /// never receive the same job.
    fn dequeue(&self) -> Result<Option<Job>, QueueError>;

    fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError>;

    /// Jobs matching every supplied filter, newest first.
    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError>;

    fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64, QueueError>;

    /// Returns `Ok(false)` when the job does not exist. Jobs already in a
    /// terminal status are rejected with [`QueueError::InvalidTransition`].
    fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<bool, QueueError>;

    /// Cancels a pending job. Returns `Ok(false)`, without mutating anything,
    /// for unknown jobs and jobs in any other status.
    fn cancel_job(&self, id: &str) -> Result<bool, QueueError>;

    /// Deletes terminal jobs whose completion time (creation time for
    /// cancelled jobs) is older than `retention`.
    fn cleanup_old_jobs(&self, retention: Duration) -> Result<u64, QueueError>;

    fn get_queue_depth(&self) -> Result<u64, QueueError>;

    /// Mean of `completed_at - started_at` in seconds over completed jobs.
    fn average_execution_time(&self) -> Result<Option<f64>, QueueError>;

    fn health_check(&self) -> bool;

    fn close(&self);

    fn get_stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            total_jobs: self.count_jobs(None)?,
            pending: self.count_jobs(Some(JobStatus::Pending))?,
            processing: self.count_jobs(Some(JobStatus::Processing))?,
            completed: self.count_jobs(Some(JobStatus::Completed))?,
            failed: self.count_jobs(Some(JobStatus::Failed))?,
            cancelled: self.count_jobs(Some(JobStatus::Cancelled))?,
            average_execution_time: self.average_execution_time()?.map(round_seconds),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    Sqlite { path: PathBuf },
    Redis { url: String },
}

pub fn open(backend: &Backend) -> Result<Arc<dyn QueueManager>, QueueError> {
    let queue: Arc<dyn QueueManager> = match backend {
        Backend::Sqlite { path } => Arc::new(SqliteQueue::open(path)?),
        Backend::Redis { url } => Arc::new(RedisQueue::connect(url)?),
    };
    tracing::info!(backend = queue.backend_name(), "queue backend ready");
    Ok(queue)
}

/// Fixed-width RFC 3339 so that stored timestamps sort lexically.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(id: &str, value: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| QueueError::Corrupt {
            id: id.to_string(),
            reason: format!("bad timestamp {value:?}: {e}"),
        })
}

fn round_seconds(secs: f64) -> f64 {
    (secs * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_every_known_value() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn status_rejects_unknown_value() {
        let err = "finished".parse::<JobStatus>().unwrap_err();
        assert!(matches!(err, QueueError::InvalidStatus(s) if s == "finished"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn filter_limit_is_clamped() {
        assert_eq!(JobFilter::default().effective_limit(), DEFAULT_LIST_LIMIT);
        let filter = JobFilter {
            limit: Some(500),
            ..Default::default()
        };
        assert_eq!(filter.effective_limit(), MAX_LIST_LIMIT);
    }

    #[test]
    fn job_serializes_with_wire_field_names() {
        let job = Job {
            id: "abc".into(),
            context: Some("weekly-cleanup".into()),
            hash_filter: None,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["job_id"], "abc");
        assert_eq!(value["status"], "pending");
        assert!(value["hash"].is_null());
        assert!(value.get("id").is_none());
    }

    #[test]
    fn timestamps_sort_lexically() {
        let earlier = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = earlier + chrono::Duration::microseconds(1500);
        assert!(format_timestamp(&earlier) < format_timestamp(&later));
        assert_eq!(format_timestamp(&earlier).len(), format_timestamp(&later).len());
        assert_eq!(parse_timestamp("x", &format_timestamp(&later)).unwrap(), later);
    }

    #[test]
    fn seconds_round_to_two_places() {
        assert_eq!(round_seconds(1.23456), 1.23);
        assert_eq!(round_seconds(2.0), 2.0);
    }
}
