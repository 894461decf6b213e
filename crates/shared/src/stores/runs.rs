//! Workflow run and CI job store

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::models::{CiJob, RunStatus, WorkflowRun};
use crate::DbPool;

pub struct RunStore;

impl RunStore {
    /// Record a run observation. Identity is `(repo_id, external_run_id)`;
    /// later observations update status and conclusion.
    pub async fn upsert(
        pool: &DbPool,
        repo_id: &str,
        external_run_id: i64,
        status: RunStatus,
        conclusion: Option<&str>,
    ) -> Result<WorkflowRun> {
        let now = chrono::Utc::now();

        let run = sqlx::query_as::<_, WorkflowRun>(
            r#"
            INSERT INTO workflow_runs (id, repo_id, external_run_id, status, conclusion, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (repo_id, external_run_id) DO UPDATE SET
                status = EXCLUDED.status,
                conclusion = EXCLUDED.conclusion,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(repo_id)
        .bind(external_run_id)
        .bind(status)
        .bind(conclusion)
        .bind(now)
        .fetch_one(pool)
        .await
        .context("Failed to upsert workflow run")?;

        Ok(run)
    }

    /// Find a run by its provider id
    pub async fn find_by_external_id(
        pool: &DbPool,
        repo_id: &str,
        external_run_id: i64,
    ) -> Result<Option<WorkflowRun>> {
        let run = sqlx::query_as::<_, WorkflowRun>(
            r#"
            SELECT * FROM workflow_runs
            WHERE repo_id = $1 AND external_run_id = $2
            "#,
        )
        .bind(repo_id)
        .bind(external_run_id)
        .fetch_optional(pool)
        .await
        .context("Failed to find workflow run by external id")?;

        Ok(run)
    }

    /// External run ids already known for a repo, newest first.
    /// The polling sweep diffs provider listings against this.
    pub async fn known_external_ids(
        pool: &DbPool,
        repo_id: &str,
        limit: i64,
    ) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT external_run_id FROM workflow_runs
            WHERE repo_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(repo_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to list known run ids")?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Record a CI job observation keyed by `(run_id, external_job_id)`
    pub async fn upsert_job(
        pool: &DbPool,
        run_id: &str,
        external_job_id: i64,
        name: &str,
        status: RunStatus,
        conclusion: Option<&str>,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        completed_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<CiJob> {
        let job = sqlx::query_as::<_, CiJob>(
            r#"
            INSERT INTO ci_jobs (id, run_id, external_job_id, name, status, conclusion, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (run_id, external_job_id) DO UPDATE SET
                status = EXCLUDED.status,
                conclusion = EXCLUDED.conclusion,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(run_id)
        .bind(external_job_id)
        .bind(name)
        .bind(status)
        .bind(conclusion)
        .bind(started_at)
        .bind(completed_at)
        .fetch_one(pool)
        .await
        .context("Failed to upsert CI job")?;

        Ok(job)
    }
}
