use crate::priority::JobPriority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub type JobId = Uuid;

/// Identifier of a worker slot. Only set on a job while it is `processing`.
pub type WorkerId = String;

/// Retry budget used when a producer does not specify one.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn all() -> [JobStatus; 5] {
        [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ]
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(crate::DispatchError::Store {
                message: format!("unknown job status '{}'", other),
            }),
        }
    }
}

/// Producer-supplied options for [`JobQueue::add_job`](crate::JobQueue::add_job).
///
/// ```rust
/// use dispatchwork::{JobOptions, JobPriority};
/// use std::time::Duration;
///
/// let options = JobOptions::new()
///     .with_priority(JobPriority::High)
///     .with_delay(Duration::from_secs(30))
///     .with_max_retries(5);
/// assert_eq!(options.priority, JobPriority::High);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: JobPriority,
    /// Earliest dispatch is `now + delay`.
    pub delay: Duration,
    /// Falls back to the configured default when unset.
    pub max_retries: Option<i32>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn emergency() -> Self {
        Self::default().with_priority(JobPriority::Emergency)
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Medium,
            delay: Duration::ZERO,
            max_retries: None,
        }
    }
}

/// A unit of background work.
///
/// `retry_count` counts failures charged against the current retry budget and is
/// reset by an external resubmission. `failure_count` is cumulative over the job's
/// whole life and is what the dead-letter threshold is measured against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub failure_count: i32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<WorkerId>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Builds a `pending` job scheduled at `now + options.delay`.
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let delay = chrono::Duration::from_std(options.delay).unwrap_or(chrono::Duration::MAX);
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            priority: options.priority,
            payload,
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            failure_count: 0,
            scheduled_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
            started_at: None,
            completed_at: None,
            worker_id: None,
            dead_lettered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.dead_lettered_at.is_some()
    }

    /// Whether `worker_id` holds the current claim on this job.
    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Processing && self.worker_id.as_deref() == Some(worker_id)
    }

    /// Wall time between claim and completion, if both are known.
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}

/// Quarantine entry written when a job crosses the dead-letter threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub job_id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub error_message: String,
    pub retry_count: i32,
    pub failure_count: i32,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn for_job(job: &Job, error_message: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            error_message: error_message.to_string(),
            retry_count: job.retry_count,
            failure_count: job.failure_count,
            created_at: now,
        }
    }
}
