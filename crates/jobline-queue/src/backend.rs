//! Queue Backend Trait

use async_trait::async_trait;

use crate::job::{Job, JobId, JobOutcome, JobStatus, NewJob};

/// Boxed storage fault, kept intact for the caller
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Job {id} is {status}, transition not allowed")]
    InvalidState { id: JobId, status: JobStatus },
    #[error("Job {0} already exists")]
    AlreadyExists(JobId),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Backend error: {0}")]
    Backend(#[source] BoxError),
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("No job ids left to assign")]
    IdsExhausted,
    #[error("Poll loop for queue '{0}' is already running")]
    AlreadyRunning(String),
}

impl QueueError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

/// Storage for one named queue.
///
/// Every backend implements the same job state machine; callers should not
/// be able to tell them apart except by durability.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Name of the queue this backend owns
    fn queue_name(&self) -> &str;

    /// Store a new PENDING job and return its id. Never waits on a limiter.
    async fn add(&self, job: NewJob) -> Result<JobId, QueueError>;

    /// Look up a job of this queue
    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Up to `limit` jobs by ascending id, any status. For inspection only.
    async fn peek(&self, limit: usize) -> Result<Vec<Job>, QueueError>;

    /// All jobs currently PROCESSING
    async fn processing(&self) -> Result<Vec<Job>, QueueError>;

    /// Atomically claim the oldest eligible job and mark it PROCESSING
    async fn next(&self) -> Result<Option<Job>, QueueError>;

    /// Record the outcome of a PROCESSING job and return the updated job
    async fn complete(&self, id: JobId, outcome: JobOutcome) -> Result<Job, QueueError>;

    /// Number of jobs with `status`
    async fn size(&self, status: JobStatus) -> Result<usize, QueueError>;

    /// Remove every job of this queue
    async fn clear(&self) -> Result<(), QueueError>;

    /// Output of the most recent COMPLETED job with the same task type and input fingerprint
    async fn output_for_input(
        &self,
        task_type: &str,
        input: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, QueueError>;
}
