//! Repository store for database operations

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::Repository;
use crate::DbPool;

/// Aggregate counts backing the repository dashboard, fetched in one read
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DashboardCounts {
    pub total_tests: i64,
    pub flaky_tests: i64,
    pub quarantined_tests: i64,
    pub recent_runs: i64,
    pub recent_failures: i64,
    pub cluster_count: i64,
}

pub struct RepoStore;

impl RepoStore {
    /// Register a repository or refresh its installation binding.
    ///
    /// Identity is `(provider, owner, name)`; re-registration updates the
    /// installation id and reactivates the row.
    pub async fn upsert(
        pool: &DbPool,
        provider: &str,
        owner: &str,
        name: &str,
        installation_id: i64,
    ) -> Result<Repository> {
        let now = chrono::Utc::now();

        let repo = sqlx::query_as::<_, Repository>(
            r#"
            INSERT INTO repositories (id, provider, owner, name, installation_id, active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6, $6)
            ON CONFLICT (provider, owner, name) DO UPDATE SET
                installation_id = EXCLUDED.installation_id,
                active = TRUE,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(provider)
        .bind(owner)
        .bind(name)
        .bind(installation_id)
        .bind(now)
        .fetch_one(pool)
        .await
        .context("Failed to upsert repository")?;

        Ok(repo)
    }

    /// Find repository by ID
    pub async fn find_by_id(pool: &DbPool, repo_id: &str) -> Result<Option<Repository>> {
        let repo = sqlx::query_as::<_, Repository>(
            r#"
            SELECT * FROM repositories
            WHERE id = $1
            "#,
        )
        .bind(repo_id)
        .fetch_optional(pool)
        .await
        .context("Failed to find repository by ID")?;

        Ok(repo)
    }

    /// List repositories with pagination and optional substring search
    pub async fn list(
        pool: &DbPool,
        limit: i64,
        offset: i64,
        search: Option<&str>,
    ) -> Result<Vec<Repository>> {
        let repos = sqlx::query_as::<_, Repository>(
            r#"
            SELECT * FROM repositories
            WHERE ($3::TEXT IS NULL OR owner || '/' || name ILIKE '%' || $3 || '%')
            ORDER BY owner, name
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .bind(search)
        .fetch_all(pool)
        .await
        .context("Failed to list repositories")?;

        Ok(repos)
    }

    /// Active repositories, for the polling sweep
    pub async fn list_active(pool: &DbPool) -> Result<Vec<Repository>> {
        let repos = sqlx::query_as::<_, Repository>(
            r#"
            SELECT * FROM repositories
            WHERE active = TRUE
            ORDER BY owner, name
            "#,
        )
        .fetch_all(pool)
        .await
        .context("Failed to list active repositories")?;

        Ok(repos)
    }

    /// Dashboard aggregates in a single round trip
    pub async fn dashboard(
        pool: &DbPool,
        repo_id: &str,
        warn_threshold: f64,
        lookback_days: i64,
    ) -> Result<DashboardCounts> {
        let counts = sqlx::query_as::<_, DashboardCounts>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM test_cases tc WHERE tc.repo_id = $1) AS total_tests,
                (SELECT COUNT(*) FROM flake_scores fs
                    JOIN test_cases tc ON tc.id = fs.test_id
                    WHERE tc.repo_id = $1 AND fs.score >= $2) AS flaky_tests,
                (SELECT COUNT(DISTINCT qd.test_id) FROM quarantine_decisions qd
                    JOIN test_cases tc ON tc.id = qd.test_id
                    WHERE tc.repo_id = $1 AND qd.state = 'ACTIVE'
                      AND (qd.until IS NULL OR qd.until > NOW())) AS quarantined_tests,
                (SELECT COUNT(*) FROM workflow_runs wr
                    WHERE wr.repo_id = $1
                      AND wr.created_at > NOW() - ($3 * INTERVAL '1 day')) AS recent_runs,
                (SELECT COUNT(*) FROM occurrences o
                    JOIN test_cases tc ON tc.id = o.test_id
                    WHERE tc.repo_id = $1 AND o.status IN ('failed', 'error')
                      AND o.created_at > NOW() - ($3 * INTERVAL '1 day')) AS recent_failures,
                (SELECT COUNT(*) FROM failure_clusters fc WHERE fc.repo_id = $1) AS cluster_count
            "#,
        )
        .bind(repo_id)
        .bind(warn_threshold)
        .bind(lookback_days)
        .fetch_one(pool)
        .await
        .context("Failed to load repository dashboard")?;

        Ok(counts)
    }
}
