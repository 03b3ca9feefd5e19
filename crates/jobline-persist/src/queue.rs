//! Durable queue backend using SQLite

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobline_queue::{
    fingerprint, Job, JobId, JobOutcome, JobStatus, NewJob, QueueBackend, QueueError,
};
use sqlx::SqlitePool;
use tracing::debug;

use crate::sqlite::{self, SqliteConfig};

const JOB_COLUMNS: &str = "id, queue, task_type, fingerprint, input, output, error, status, \
     created_at, run_after, deadline_at, last_ran_at, completed_at, retries, max_retries";

/// One `job_queue` row as stored
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    queue: String,
    task_type: String,
    fingerprint: String,
    input: String,
    output: Option<String>,
    error: Option<String>,
    status: String,
    created_at: i64,
    run_after: i64,
    deadline_at: Option<i64>,
    last_ran_at: Option<i64>,
    completed_at: Option<i64>,
    retries: i64,
    max_retries: i64,
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Schema(format!("timestamp {} out of range", ms)))
}

fn from_millis_opt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, QueueError> {
    ms.map(from_millis).transpose()
}

fn to_count(value: i64, column: &str) -> Result<u32, QueueError> {
    u32::try_from(value)
        .map_err(|_| QueueError::Schema(format!("{} value {} out of range", column, value)))
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId(row.id),
            queue_name: row.queue,
            task_type: row.task_type,
            fingerprint: row.fingerprint,
            input: serde_json::from_str(&row.input)?,
            output: row
                .output
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error: row.error,
            status: row.status.parse()?,
            created_at: from_millis(row.created_at)?,
            run_after: from_millis(row.run_after)?,
            deadline_at: from_millis_opt(row.deadline_at)?,
            last_ran_at: from_millis_opt(row.last_ran_at)?,
            completed_at: from_millis_opt(row.completed_at)?,
            retries: to_count(row.retries, "retries")?,
            max_retries: to_count(row.max_retries, "max_retries")?,
        })
    }
}

/// Durable queue backend using SQLite.
///
/// Several backends (in this process or others) may share one database file
/// and one queue name: claiming is a single conditional `UPDATE`, so each job
/// is handed out once.
///
/// Job ids come from one table, so they are unique across every queue name in
/// the database. A caller-supplied id already used by another queue is rejected
/// with `AlreadyExists`.
#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    pool: SqlitePool,
    queue_name: String,
}

impl SqliteQueueBackend {
    /// Wrap a pool whose schema is already migrated
    pub fn new(pool: SqlitePool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
        }
    }

    /// Connect, migrate and bind to `queue_name`
    pub async fn connect(
        config: &SqliteConfig,
        queue_name: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let pool = sqlite::connect(config).await?;
        Ok(Self::new(pool, queue_name))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn add(&self, job: NewJob) -> Result<JobId, QueueError> {
        let now = Utc::now();
        let fingerprint = fingerprint(&job.input);
        let input = serde_json::to_string(&job.input)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO job_queue
                (id, queue, task_type, fingerprint, input, status, retries, max_retries,
                 run_after, created_at, deadline_at)
            VALUES (?, ?, ?, ?, ?, 'PENDING', 0, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(job.id.map(|id| id.0))
        .bind(&self.queue_name)
        .bind(&job.task_type)
        .bind(&fingerprint)
        .bind(input)
        .bind(i64::from(job.max_retries))
        .bind(to_millis(job.run_after.unwrap_or(now)))
        .bind(to_millis(now))
        .bind(job.deadline_at.map(to_millis))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let (Some(id), Some(db)) = (job.id, e.as_database_error()) {
                if db.is_unique_violation() {
                    return QueueError::AlreadyExists(id);
                }
            }
            QueueError::backend(e)
        })?;

        debug!(
            job_id = id,
            queue = %self.queue_name,
            task_type = %job.task_type,
            "Job added"
        );
        Ok(JobId(id))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM job_queue WHERE id = ? AND queue = ?",
            JOB_COLUMNS
        ))
        .bind(id.0)
        .bind(&self.queue_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(QueueError::backend)?;

        row.map(Job::try_from).transpose()
    }

    async fn peek(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM job_queue WHERE queue = ? ORDER BY id ASC LIMIT ?",
            JOB_COLUMNS
        ))
        .bind(&self.queue_name)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(QueueError::backend)?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn processing(&self) -> Result<Vec<Job>, QueueError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM job_queue WHERE queue = ? AND status = 'PROCESSING' ORDER BY id ASC",
            JOB_COLUMNS
        ))
        .bind(&self.queue_name)
        .fetch_all(&self.pool)
        .await
        .map_err(QueueError::backend)?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn next(&self) -> Result<Option<Job>, QueueError> {
        // select and claim in one statement; concurrent pollers serialize on the write lock
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE job_queue
            SET status = 'PROCESSING'
            WHERE status = 'PENDING' AND id = (
                SELECT id FROM job_queue
                WHERE queue = ? AND status = 'PENDING' AND run_after <= ?
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(&self.queue_name)
        .bind(to_millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(QueueError::backend)?;

        row.map(Job::try_from).transpose()
    }

    async fn complete(&self, id: JobId, outcome: JobOutcome) -> Result<Job, QueueError> {
        let now = to_millis(Utc::now());
        let (succeeded, output, error) = match outcome {
            JobOutcome::Success(output) => (true, Some(serde_json::to_string(&output)?), None),
            JobOutcome::Failure(message) => (false, None, Some(message)),
        };

        // retries and status are derived from the row's current values in the same write
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE job_queue
            SET output = ?,
                error = ?,
                retries = retries + ?,
                status = CASE
                    WHEN ? THEN 'COMPLETED'
                    WHEN retries + 1 >= max_retries THEN 'FAILED'
                    ELSE 'PENDING'
                END,
                last_ran_at = ?,
                completed_at = ?
            WHERE id = ? AND queue = ? AND status = 'PROCESSING'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(output)
        .bind(error)
        .bind(if succeeded { 0_i64 } else { 1_i64 })
        .bind(succeeded)
        .bind(now)
        .bind(now)
        .bind(id.0)
        .bind(&self.queue_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(QueueError::backend)?;

        if let Some(row) = row {
            return Job::try_from(row);
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM job_queue WHERE id = ? AND queue = ?")
                .bind(id.0)
                .bind(&self.queue_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(QueueError::backend)?;

        match status {
            Some(status) => Err(QueueError::InvalidState {
                id,
                status: status.parse()?,
            }),
            None => Err(QueueError::NotFound(id)),
        }
    }

    async fn size(&self, status: JobStatus) -> Result<usize, QueueError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM job_queue WHERE queue = ? AND status = ?")
                .bind(&self.queue_name)
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(QueueError::backend)?;

        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn clear(&self) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE queue = ?")
            .bind(&self.queue_name)
            .execute(&self.pool)
            .await
            .map_err(QueueError::backend)?;

        debug!(
            queue = %self.queue_name,
            removed = result.rows_affected(),
            "Queue cleared"
        );
        Ok(())
    }

    async fn output_for_input(
        &self,
        task_type: &str,
        input: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, QueueError> {
        let output: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT output FROM job_queue
            WHERE queue = ? AND fingerprint = ? AND status = 'COMPLETED' AND task_type = ?
            ORDER BY completed_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(&self.queue_name)
        .bind(fingerprint(input))
        .bind(task_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(QueueError::backend)?;

        match output.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}
