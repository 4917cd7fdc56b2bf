//! Durable job queue.
//!
//! Jobs persist in SQLite and survive restarts. Workers claim eligible rows
//! with a single atomic update-returning statement, so no two workers ever
//! run the same job. Retries are bounded by `max_attempts`; future-dated
//! jobs wait in `scheduled` until their time comes.

pub mod worker;

use crate::bulk::BulkMessageSpec;
use crate::error::{Result, WamuxError};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    BulkMessage,
    ScheduledMessage,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::BulkMessage => "bulk_message",
            JobType::ScheduledMessage => "scheduled_message",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bulk_message" => Some(JobType::BulkMessage),
            "scheduled_message" => Some(JobType::ScheduledMessage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "scheduled" => Some(JobStatus::Scheduled),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// A single direct message to send at (or after) a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessageSpec {
    pub session_id: String,
    pub phone: String,
    pub message: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

fn default_message_type() -> String {
    "text".to_string()
}

/// Typed payload envelope, stored as JSON with an internal tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    BulkMessage(BulkMessageSpec),
    ScheduledMessage(ScheduledMessageSpec),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::BulkMessage(_) => JobType::BulkMessage,
            JobPayload::ScheduledMessage(_) => JobType::ScheduledMessage,
        }
    }
}

/// One durable job.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedJob {
    pub job_id: String,
    pub job_type: JobType,
    pub priority: i64,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub scheduled_at: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: String,
    job_type: String,
    priority: i64,
    payload: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    scheduled_at: Option<i64>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    result: Option<String>,
    error: Option<String>,
}

impl TryFrom<JobRow> for QueuedJob {
    type Error = WamuxError;

    fn try_from(row: JobRow) -> Result<Self> {
        let payload: JobPayload = serde_json::from_str(&row.payload)?;
        let job_type = JobType::parse(&row.job_type)
            .ok_or_else(|| WamuxError::Internal(format!("unknown job type {}", row.job_type)))?;
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| WamuxError::Internal(format!("unknown job status {}", row.status)))?;
        Ok(Self {
            job_id: row.job_id,
            job_type,
            priority: row.priority,
            payload,
            status,
            attempts: row.attempts as u32,
            max_attempts: row.max_attempts as u32,
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            result: row.result,
            error: row.error,
        })
    }
}

/// Per-status counters for the ops surface.
#[derive(Debug, Clone, Serialize, Default)]
pub struct QueueStatistics {
    pub total: i64,
    pub pending: i64,
    pub scheduled: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a job. `scheduled_at` in the future parks it as `scheduled`;
    /// otherwise it is immediately eligible.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        priority: i64,
        max_attempts: u32,
        scheduled_at: Option<i64>,
    ) -> Result<QueuedJob> {
        if max_attempts == 0 {
            return Err(WamuxError::BadRequest(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        let now = chrono::Utc::now().timestamp();
        let status = match scheduled_at {
            Some(at) if at > now => JobStatus::Scheduled,
            _ => JobStatus::Pending,
        };
        let job_id = uuid::Uuid::new_v4().to_string();
        let payload_json = serde_json::to_string(&payload)?;

        sqlx::query(
            "INSERT INTO job_queue
                (job_id, job_type, priority, payload, status, attempts, max_attempts,
                 scheduled_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8)",
        )
        .bind(&job_id)
        .bind(payload.job_type().as_str())
        .bind(priority)
        .bind(&payload_json)
        .bind(status.as_str())
        .bind(i64::from(max_attempts))
        .bind(scheduled_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            "queued job {job_id} ({}, priority {priority}, status {})",
            payload.job_type().as_str(),
            status.as_str()
        );
        self.get(&job_id).await
    }

    pub async fn get(&self, job_id: &str) -> Result<QueuedJob> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM job_queue WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| WamuxError::NotFound(format!("job {job_id} not found")))?
            .try_into()
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        job_type: Option<JobType>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueuedJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM job_queue
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR job_type = ?2)
             ORDER BY created_at DESC
             LIMIT ?3 OFFSET ?4",
        )
        .bind(status.map(|s| s.as_str()))
        .bind(job_type.map(|t| t.as_str()))
        .bind(limit.clamp(1, 500))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QueuedJob::try_from).collect()
    }

    /// Atomically claim up to `limit` eligible jobs for a worker: the claim
    /// marks them `running` and counts the attempt in the same statement.
    pub async fn claim_batch(&self, limit: u32) -> Result<Vec<QueuedJob>> {
        let now = chrono::Utc::now().timestamp();
        let rows: Vec<JobRow> = sqlx::query_as(
            "UPDATE job_queue
             SET status = 'running', attempts = attempts + 1, started_at = ?1
             WHERE job_id IN (
                 SELECT job_id FROM job_queue
                 WHERE (status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= ?1))
                    OR (status = 'scheduled' AND scheduled_at <= ?1)
                 ORDER BY priority DESC, created_at ASC
                 LIMIT ?2
             )
             RETURNING *",
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QueuedJob::try_from).collect()
    }

    pub async fn complete(&self, job_id: &str, result: &str) -> Result<()> {
        sqlx::query(
            "UPDATE job_queue
             SET status = 'completed', completed_at = ?2, result = ?3, error = NULL
             WHERE job_id = ?1",
        )
        .bind(job_id)
        .bind(chrono::Utc::now().timestamp())
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt. Retryable errors requeue the job as
    /// `pending` until attempts run out; permanent errors fail immediately.
    pub async fn fail(&self, job_id: &str, error: &str, permanent: bool) -> Result<JobStatus> {
        let job = self.get(job_id).await?;
        let exhausted = permanent || job.attempts >= job.max_attempts;
        let status = if exhausted {
            JobStatus::Failed
        } else {
            JobStatus::Pending
        };
        sqlx::query(
            "UPDATE job_queue
             SET status = ?2, error = ?3, completed_at = ?4
             WHERE job_id = ?1",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(error)
        .bind(exhausted.then(|| chrono::Utc::now().timestamp()))
        .execute(&self.pool)
        .await?;
        tracing::warn!(
            "job {job_id} attempt {}/{} failed: {error} (now {})",
            job.attempts,
            job.max_attempts,
            status.as_str()
        );
        Ok(status)
    }

    /// Cancel a job that has not started running yet.
    pub async fn cancel(&self, job_id: &str) -> Result<QueuedJob> {
        let changed = sqlx::query(
            "UPDATE job_queue
             SET status = 'cancelled', completed_at = ?2
             WHERE job_id = ?1 AND status IN ('pending', 'scheduled')",
        )
        .bind(job_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?
        .rows_affected();

        let job = self.get(job_id).await?;
        if changed == 0 {
            return Err(WamuxError::Conflict(format!(
                "job {job_id} is {} and can no longer be cancelled",
                job.status.as_str()
            )));
        }
        Ok(job)
    }

    /// Requeue a failed job that still has attempts left.
    pub async fn retry(&self, job_id: &str) -> Result<QueuedJob> {
        let changed = sqlx::query(
            "UPDATE job_queue
             SET status = 'pending', completed_at = NULL
             WHERE job_id = ?1 AND status = 'failed' AND attempts < max_attempts",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let job = self.get(job_id).await?;
        if changed == 0 {
            return Err(WamuxError::Conflict(format!(
                "job {job_id} is not retryable (status {}, attempts {}/{})",
                job.status.as_str(),
                job.attempts,
                job.max_attempts
            )));
        }
        Ok(job)
    }

    pub async fn statistics(&self) -> Result<QueueStatistics> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut stats = QueueStatistics::default();
        for (status, count) in rows {
            stats.total += count;
            match status.as_str() {
                "pending" => stats.pending = count,
                "scheduled" => stats.scheduled = count,
                "running" => stats.running = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "cancelled" => stats.cancelled = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Delete terminal jobs older than the retention window.
    pub async fn cleanup_older_than(&self, retention: Duration) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - retention.as_secs() as i64;
        let deleted = sqlx::query(
            "DELETE FROM job_queue
             WHERE status IN ('completed', 'failed', 'cancelled')
               AND completed_at IS NOT NULL AND completed_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if deleted > 0 {
            tracing::info!("queue cleanup removed {deleted} jobs");
        }
        Ok(deleted)
    }

    /// Startup recovery: jobs left `running` by a crashed process go back to
    /// `pending` (or `failed` when their attempts are spent).
    pub async fn release_stale_running(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let failed = sqlx::query(
            "UPDATE job_queue
             SET status = 'failed', error = 'process restarted mid-run', completed_at = ?1
             WHERE status = 'running' AND attempts >= max_attempts",
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        let released = sqlx::query(
            "UPDATE job_queue SET status = 'pending'
             WHERE status = 'running'",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        if released + failed > 0 {
            tracing::info!(
                "startup recovery: released {released} stale jobs, failed {failed} exhausted ones"
            );
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests;
