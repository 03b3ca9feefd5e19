//! Queue driver: forwards to a backend, runs the poll loop, emits completion events

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::backend::{QueueBackend, QueueError};
use crate::config::QueueConfig;
use crate::job::{Job, JobId, JobOutcome, JobStatus, NewJob};
use crate::limiter::Limiter;
use crate::registry::TaskRunner;

/// Shortest pause between cycles, so a limiter answering "now" cannot spin the loop
const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Emitted once per job reaching COMPLETED or FAILED
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub id: JobId,
    pub queue: String,
    pub status: JobStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl From<&Job> for CompletionEvent {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            queue: job.queue_name.clone(),
            status: job.status,
            output: job.output.clone(),
            error: job.error.clone(),
        }
    }
}

/// Result of [`JobQueue::submit`]
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// An identical input already completed; nothing was enqueued
    Cached(serde_json::Value),
    Queued(JobId),
}

pub struct JobQueue<B: QueueBackend + ?Sized> {
    backend: Arc<B>,
    limiter: Arc<dyn Limiter>,
    config: QueueConfig,
    events: broadcast::Sender<CompletionEvent>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl<B: QueueBackend + 'static> JobQueue<B> {
    pub fn new(backend: B, limiter: Arc<dyn Limiter>, config: QueueConfig) -> Self {
        Self::new_with_arc(Arc::new(backend), limiter, config)
    }
}

impl<B: QueueBackend + ?Sized + 'static> JobQueue<B> {
    /// Create from an existing Arc backend (supports dyn dispatch)
    pub fn new_with_arc(backend: Arc<B>, limiter: Arc<dyn Limiter>, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            backend,
            limiter,
            config,
            events,
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    pub fn queue_name(&self) -> &str {
        self.backend.queue_name()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn limiter(&self) -> &Arc<dyn Limiter> {
        &self.limiter
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Receive every terminal transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.events.subscribe()
    }

    pub async fn add(&self, job: NewJob) -> Result<JobId, QueueError> {
        self.backend.add(job).await
    }

    /// Return a cached output for this exact input, or enqueue it
    pub async fn submit(
        &self,
        task_type: &str,
        input: serde_json::Value,
    ) -> Result<Submission, QueueError> {
        if let Some(output) = self.backend.output_for_input(task_type, &input).await? {
            debug!(queue = %self.queue_name(), task_type, "Serving cached output");
            return Ok(Submission::Cached(output));
        }

        let job = NewJob::new(task_type, input).max_retries(self.config.default_max_retries);
        self.backend.add(job).await.map(Submission::Queued)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.backend.get(id).await
    }

    pub async fn peek(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        self.backend.peek(limit).await
    }

    pub async fn processing(&self) -> Result<Vec<Job>, QueueError> {
        self.backend.processing().await
    }

    /// Claim a job by hand, bypassing the limiter
    pub async fn next(&self) -> Result<Option<Job>, QueueError> {
        self.backend.next().await
    }

    /// Record an attempt's outcome; notifies subscribers on terminal status
    pub async fn complete(&self, id: JobId, outcome: JobOutcome) -> Result<Job, QueueError> {
        let job = self.backend.complete(id, outcome).await?;

        match job.status {
            JobStatus::Completed => {
                info!(job_id = %job.id, queue = %job.queue_name, "Job completed");
                self.notify(&job);
            }
            JobStatus::Failed => {
                warn!(
                    job_id = %job.id,
                    queue = %job.queue_name,
                    retries = job.retries,
                    error = job.error.as_deref().unwrap_or_default(),
                    "Job failed permanently"
                );
                self.notify(&job);
            }
            _ => {
                debug!(
                    job_id = %job.id,
                    attempt = job.retries,
                    max_retries = job.max_retries,
                    "Job failed, returned to pending"
                );
            }
        }

        Ok(job)
    }

    pub async fn size(&self, status: JobStatus) -> Result<usize, QueueError> {
        self.backend.size(status).await
    }

    /// Number of PENDING jobs
    pub async fn len(&self) -> Result<usize, QueueError> {
        self.backend.size(JobStatus::Pending).await
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Drop every job and reset the limiter
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.backend.clear().await?;
        self.limiter.clear().await;
        Ok(())
    }

    pub async fn output_for_input(
        &self,
        task_type: &str,
        input: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, QueueError> {
        self.backend.output_for_input(task_type, input).await
    }

    fn notify(&self, job: &Job) {
        // no subscribers is not an error
        let _ = self.events.send(CompletionEvent::from(job));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the poll loop. Jobs it claims are handed to `runner`.
    pub fn start(self: &Arc<Self>, runner: Arc<dyn TaskRunner>) -> Result<JoinHandle<()>, QueueError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyRunning(self.queue_name().to_string()));
        }

        self.shutdown.send_replace(false);
        let shutdown_rx = self.shutdown.subscribe();
        let queue = Arc::clone(self);

        Ok(tokio::spawn(async move {
            queue.poll_loop(runner, shutdown_rx).await;
        }))
    }

    /// Ask the poll loop to stop after its current cycle.
    ///
    /// Jobs already handed to the runner keep going and are completed normally.
    pub fn stop(&self) {
        info!(queue = %self.queue_name(), "Stop requested");
        self.shutdown.send_replace(true);
    }

    async fn poll_loop(self: Arc<Self>, runner: Arc<dyn TaskRunner>, mut shutdown: watch::Receiver<bool>) {
        let _running = RunningGuard(&self.running);
        info!(
            queue = %self.queue_name(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Poll loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.poll_once(&runner).await {
                Ok(wait) => wait,
                Err(e) => {
                    error!(queue = %self.queue_name(), error = %e, "Poll cycle failed");
                    self.idle_wait()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(queue = %self.queue_name(), "Poll loop stopped");
    }

    /// Claim and dispatch jobs while the limiter admits them.
    /// Returns how long to sleep before the next cycle.
    async fn poll_once(self: &Arc<Self>, runner: &Arc<dyn TaskRunner>) -> Result<Duration, QueueError> {
        loop {
            if !self.limiter.can_proceed().await {
                let until = self.limiter.next_available_time().await;
                let wait = (until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                return Ok(wait.clamp(MIN_BACKOFF, self.idle_wait()));
            }

            let Some(job) = self.backend.next().await? else {
                return Ok(self.idle_wait());
            };

            self.limiter.record_job_start().await;
            self.dispatch(job, Arc::clone(runner));
        }
    }

    /// Sleep after an empty or failed cycle; never zero, so the loop cannot spin
    fn idle_wait(&self) -> Duration {
        self.config.poll_interval.max(MIN_BACKOFF)
    }

    fn dispatch(self: &Arc<Self>, job: Job, runner: Arc<dyn TaskRunner>) {
        let queue = Arc::clone(self);
        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            queue = %job.queue_name,
            task_type = %job.task_type,
        );

        tokio::spawn(
            async move {
                debug!(attempt = job.retries + 1, "Running job");

                let attempt = AssertUnwindSafe(runner.run(&job.task_type, job.input.clone()));
                let outcome = match attempt.catch_unwind().await {
                    Ok(Ok(output)) => JobOutcome::Success(output),
                    Ok(Err(e)) => JobOutcome::Failure(format!("{:#}", e)),
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(panic = %message, "Runner panicked");
                        JobOutcome::Failure(format!("runner panicked: {}", message))
                    }
                };

                if let Err(e) = queue.complete(job.id, outcome).await {
                    error!(error = %e, "Failed to record job outcome");
                }
                queue.limiter.record_job_completion().await;
            }
            .instrument(span),
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Clears the running flag however the poll loop exits, unwinding included
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
