//! In-memory queue implementation
//!
//! Jobs live in insertion order inside a single lock. Every mutation takes
//! the write lock for its whole read-check-mutate sequence, so `next` hands a
//! job to exactly one caller even when many tasks poll concurrently.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::backend::{QueueBackend, QueueError};
use crate::fingerprint::fingerprint;
use crate::job::{Job, JobId, JobOutcome, JobStatus, NewJob};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: Vec<Job>,
    last_id: i64,
}

impl MemoryState {
    fn find_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }
}

/// Non-durable backend; contents are lost with the process
#[derive(Debug)]
pub struct MemoryQueueBackend {
    queue_name: String,
    state: RwLock<MemoryState>,
}

impl MemoryQueueBackend {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            state: RwLock::new(MemoryState::default()),
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn add(&self, job: NewJob) -> Result<JobId, QueueError> {
        let mut state = self.state.write().await;

        let id = match job.id {
            Some(id) if state.jobs.iter().any(|existing| existing.id == id) => {
                return Err(QueueError::AlreadyExists(id));
            }
            Some(id) => id,
            None => state
                .last_id
                .checked_add(1)
                .map(JobId)
                .ok_or(QueueError::IdsExhausted)?,
        };
        state.last_id = state.last_id.max(id.0);

        let entry = job.into_job(id, &self.queue_name, Utc::now());
        tracing::debug!(
            job_id = %id,
            queue = %self.queue_name,
            task_type = %entry.task_type,
            "Job added"
        );
        state.jobs.push(entry);

        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let state = self.state.read().await;
        Ok(state.jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn peek(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let state = self.state.read().await;
        let mut jobs = state.jobs.clone();
        jobs.sort_by_key(|job| job.id);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn processing(&self) -> Result<Vec<Job>, QueueError> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Processing)
            .cloned()
            .collect())
    }

    async fn next(&self) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let Some(job) = state
            .jobs
            .iter_mut()
            .filter(|job| job.is_eligible(now))
            .min_by_key(|job| (job.created_at, job.id))
        else {
            return Ok(None);
        };

        job.start()?;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: JobId, outcome: JobOutcome) -> Result<Job, QueueError> {
        let mut state = self.state.write().await;
        let job = state.find_mut(id).ok_or(QueueError::NotFound(id))?;
        job.finish(outcome, Utc::now())?;
        Ok(job.clone())
    }

    async fn size(&self, status: JobStatus) -> Result<usize, QueueError> {
        let state = self.state.read().await;
        Ok(state.jobs.iter().filter(|job| job.status == status).count())
    }

    async fn clear(&self) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        state.jobs.clear();
        Ok(())
    }

    async fn output_for_input(
        &self,
        task_type: &str,
        input: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, QueueError> {
        let fingerprint = fingerprint(input);
        let state = self.state.read().await;

        Ok(state
            .jobs
            .iter()
            .filter(|job| {
                job.status == JobStatus::Completed
                    && job.task_type == task_type
                    && job.fingerprint == fingerprint
            })
            .max_by_key(|job| (job.completed_at, job.id))
            .and_then(|job| job.output.clone()))
    }
}
