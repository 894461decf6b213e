//! Durable queue-job record store
//!
//! The Redis lists are transport only; these rows are what the read API and
//! the stalled-job reclaimer see.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{JobStatus, QueueJobRecord};
use crate::DbPool;

/// Progress snapshot emitted at pipeline phase boundaries
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub phase: String,
    pub processed: u64,
    pub total: u64,
    pub current_file_name: Option<String>,
}

pub struct QueueJobStore;

impl QueueJobStore {
    /// Transition a job to active and stamp its heartbeat
    pub async fn mark_active(pool: &DbPool, job_id: &str, attempts_made: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs SET
                status = 'active',
                attempts_made = $2,
                heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(attempts_made)
        .execute(pool)
        .await
        .context("Failed to mark job active")?;

        Ok(())
    }

    /// Refresh the heartbeat so the stalled reclaimer leaves the job alone
    pub async fn heartbeat(pool: &DbPool, job_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs SET heartbeat_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(job_id)
        .execute(pool)
        .await
        .context("Failed to heartbeat job")?;

        Ok(())
    }

    /// Terminal success with the processor's return value
    pub async fn complete(
        pool: &DbPool,
        job_id: &str,
        return_value: Option<&serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs SET
                status = 'completed',
                return_value = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(return_value)
        .execute(pool)
        .await
        .context("Failed to complete job")?;

        Ok(())
    }

    /// Failure that will be retried after `scheduled_at`
    pub async fn fail_retryable(
        pool: &DbPool,
        job_id: &str,
        reason: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs SET
                status = 'delayed',
                failed_reason = $2,
                scheduled_at = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(reason)
        .bind(scheduled_at)
        .execute(pool)
        .await
        .context("Failed to mark job for retry")?;

        Ok(())
    }

    /// Terminal failure after the retry budget is spent
    pub async fn fail_terminal(pool: &DbPool, job_id: &str, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs SET
                status = 'failed',
                failed_reason = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(reason)
        .execute(pool)
        .await
        .context("Failed to mark job failed")?;

        Ok(())
    }

    /// Record a progress snapshot at a pipeline phase boundary
    pub async fn update_progress(
        pool: &DbPool,
        job_id: &str,
        progress: &JobProgress,
    ) -> Result<()> {
        let value = serde_json::to_value(progress).context("Failed to serialize progress")?;

        sqlx::query(
            r#"
            UPDATE queue_jobs SET progress = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(value)
        .execute(pool)
        .await
        .context("Failed to update job progress")?;

        Ok(())
    }

    /// Jobs view for the read API
    pub async fn list(
        pool: &DbPool,
        limit: i64,
        offset: i64,
        queue: Option<&str>,
        status: Option<JobStatus>,
    ) -> Result<Vec<QueueJobRecord>> {
        let jobs = sqlx::query_as::<_, QueueJobRecord>(
            r#"
            SELECT * FROM queue_jobs
            WHERE ($3::TEXT IS NULL OR queue = $3)
              AND ($4::TEXT IS NULL OR status = $4)
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .bind(queue)
        .bind(status.map(|s| s.to_string()))
        .fetch_all(pool)
        .await
        .context("Failed to list queue jobs")?;

        Ok(jobs)
    }

    /// Find one job record
    pub async fn find_by_id(pool: &DbPool, job_id: &str) -> Result<Option<QueueJobRecord>> {
        let job = sqlx::query_as::<_, QueueJobRecord>(
            r#"
            SELECT * FROM queue_jobs WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .context("Failed to find queue job")?;

        Ok(job)
    }

    /// Active jobs whose heartbeat is older than `stalled_after`: their
    /// worker died. Flip them back to waiting and return them for
    /// re-delivery; the lost attempt stays counted.
    pub async fn reclaim_stalled(
        pool: &DbPool,
        queue: &str,
        stalled_after: chrono::Duration,
    ) -> Result<Vec<QueueJobRecord>> {
        let cutoff = Utc::now() - stalled_after;

        let jobs = sqlx::query_as::<_, QueueJobRecord>(
            r#"
            UPDATE queue_jobs SET
                status = 'waiting',
                heartbeat_at = NULL,
                updated_at = NOW()
            WHERE queue = $1 AND status = 'active' AND heartbeat_at < $2
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(cutoff)
        .fetch_all(pool)
        .await
        .context("Failed to reclaim stalled jobs")?;

        Ok(jobs)
    }

    /// Per-status counts for queue-depth gauges
    pub async fn count_by_status(pool: &DbPool, queue: &str) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM queue_jobs
            WHERE queue = $1
            GROUP BY status
            "#,
        )
        .bind(queue)
        .fetch_all(pool)
        .await
        .context("Failed to count jobs by status")?;

        Ok(rows)
    }
}
