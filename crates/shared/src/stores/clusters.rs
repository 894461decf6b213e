//! Failure cluster store

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::models::FailureCluster;
use crate::DbPool;

pub struct ClusterStore;

impl ClusterStore {
    /// Fold one failure into its signature cluster, creating the cluster on
    /// first sight. `(repo_id, failure_msg_signature)` is the identity; the
    /// member set grows monotonically.
    pub async fn absorb(
        pool: &DbPool,
        repo_id: &str,
        signature: &str,
        example_message: &str,
        test_id: &str,
        observed_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<FailureCluster> {
        let cluster = sqlx::query_as::<_, FailureCluster>(
            r#"
            INSERT INTO failure_clusters
                (id, repo_id, failure_msg_signature, example_message, occurrence_count,
                 test_ids, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, 1, ARRAY[$5], $6, $6)
            ON CONFLICT (repo_id, failure_msg_signature) DO UPDATE SET
                occurrence_count = failure_clusters.occurrence_count + 1,
                test_ids = CASE
                    WHEN $5 = ANY(failure_clusters.test_ids) THEN failure_clusters.test_ids
                    ELSE array_append(failure_clusters.test_ids, $5)
                END,
                last_seen_at = GREATEST(failure_clusters.last_seen_at, EXCLUDED.last_seen_at)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(repo_id)
        .bind(signature)
        .bind(example_message)
        .bind(test_id)
        .bind(observed_at)
        .fetch_one(pool)
        .await
        .context("Failed to absorb failure into cluster")?;

        Ok(cluster)
    }

    /// One cluster by signature
    pub async fn find_by_signature(
        pool: &DbPool,
        repo_id: &str,
        signature: &str,
    ) -> Result<Option<FailureCluster>> {
        let cluster = sqlx::query_as::<_, FailureCluster>(
            r#"
            SELECT * FROM failure_clusters
            WHERE repo_id = $1 AND failure_msg_signature = $2
            "#,
        )
        .bind(repo_id)
        .bind(signature)
        .fetch_optional(pool)
        .await
        .context("Failed to find failure cluster")?;

        Ok(cluster)
    }
}
