//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::backend::QueueError;
use crate::fingerprint::fingerprint;

/// Retry budget applied when a caller does not choose one
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Job Identifier, assigned by the backend on insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting in queue
    Pending,
    /// Handed to a consumer
    Processing,
    /// Finished with output
    Completed,
    /// Retry budget exhausted
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Completed and Failed never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(QueueError::Schema(format!("unknown job status '{}'", other))),
        }
    }
}

/// How a consumer finished one attempt of a job.
///
/// An explicit discriminator: a `Null` or empty output is still a success.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(serde_json::Value),
    Failure(String),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// A request to enqueue work, handed to `add`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Honoured by backends that can; otherwise assigned on insert
    pub id: Option<JobId>,
    pub task_type: String,
    pub input: serde_json::Value,
    pub run_after: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
}

impl NewJob {
    pub fn new(task_type: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            input,
            run_after: None,
            deadline_at: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Use a caller-chosen id.
    ///
    /// Ids are unique per store, not per queue: a SQLite database shares one id
    /// space across every queue name in it, while each in-memory backend is its
    /// own store. `add` fails with `AlreadyExists` if the id is taken anywhere
    /// in the store.
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    /// Not eligible for `next` before this instant
    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    /// Stored for supervisors; the queue does not enforce it
    pub fn deadline_at(mut self, at: DateTime<Utc>) -> Self {
        self.deadline_at = Some(at);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Materialize the stored entity. Backends call this once the id is known.
    pub fn into_job(self, id: JobId, queue_name: &str, now: DateTime<Utc>) -> Job {
        Job {
            id,
            queue_name: queue_name.to_string(),
            fingerprint: fingerprint(&self.input),
            task_type: self.task_type,
            input: self.input,
            output: None,
            error: None,
            status: JobStatus::Pending,
            created_at: now,
            run_after: self.run_after.unwrap_or(now),
            deadline_at: self.deadline_at,
            last_ran_at: None,
            completed_at: None,
            retries: 0,
            max_retries: self.max_retries,
        }
    }
}

/// A persisted job entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub task_type: String,
    pub fingerprint: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub run_after: DateTime<Utc>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub last_ran_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub max_retries: u32,
}

impl Job {
    /// Pending and due at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_after <= now
    }

    /// PENDING -> PROCESSING
    pub fn start(&mut self) -> Result<(), QueueError> {
        if self.status != JobStatus::Pending {
            return Err(QueueError::InvalidState {
                id: self.id,
                status: self.status,
            });
        }
        self.status = JobStatus::Processing;
        Ok(())
    }

    /// PROCESSING -> COMPLETED | PENDING (retry) | FAILED
    pub fn finish(&mut self, outcome: JobOutcome, now: DateTime<Utc>) -> Result<(), QueueError> {
        if self.status != JobStatus::Processing {
            return Err(QueueError::InvalidState {
                id: self.id,
                status: self.status,
            });
        }

        self.last_ran_at = Some(now);
        self.completed_at = Some(now);

        match outcome {
            JobOutcome::Success(output) => {
                self.output = Some(output);
                self.error = None;
                self.status = JobStatus::Completed;
            }
            JobOutcome::Failure(message) => {
                self.error = Some(message);
                self.retries += 1;
                self.status = if self.retries >= self.max_retries {
                    JobStatus::Failed
                } else {
                    JobStatus::Pending
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn processing_job(max_retries: u32) -> Job {
        let mut job = NewJob::new("embed", json!({"text": "a"}))
            .max_retries(max_retries)
            .into_job(JobId(1), "q", Utc::now());
        job.start().unwrap();
        job
    }

    #[test]
    fn test_new_job_defaults() {
        let now = Utc::now();
        let job = NewJob::new("embed", json!({"text": "a"})).into_job(JobId(7), "q", now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.run_after, now);
        assert_eq!(job.created_at, now);
        assert_eq!(job.retries, 0);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(job.fingerprint, fingerprint(&json!({"text": "a"})));
    }

    #[test]
    fn test_failure_routes_back_until_budget_exhausted() {
        let mut job = processing_job(2);

        job.finish(JobOutcome::Failure("boom".into()), Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retries, 1);
        assert_eq!(job.error.as_deref(), Some("boom"));

        job.start().unwrap();
        job.finish(JobOutcome::Failure("boom again".into()), Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, 2);

        let err = job
            .finish(JobOutcome::Failure("late".into()), Utc::now())
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
        assert_eq!(job.retries, 2);
    }

    #[test]
    fn test_null_output_is_success() {
        let mut job = processing_job(3);
        job.finish(JobOutcome::Success(serde_json::Value::Null), Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output, Some(serde_json::Value::Null));
        assert_eq!(job.retries, 0);
    }

    #[test]
    fn test_status_string_forms() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("NEW".parse::<JobStatus>().is_err());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}
