//! Flake score store

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use crate::models::FlakeScore;
use crate::DbPool;

/// Score joined with its test identity, for the read API
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ScoredTest {
    pub test_id: String,
    pub suite: String,
    pub class_name: Option<String>,
    pub name: String,
    pub file: Option<String>,
    pub score: f64,
    pub confidence: f64,
    pub window_n: i32,
    pub last_updated_at: DateTime<Utc>,
}

pub struct ScoreStore;

impl ScoreStore {
    /// Write a score snapshot. Last-writer-wins keyed by `last_updated_at`:
    /// a stale recomputation never clobbers a fresher one.
    pub async fn upsert(pool: &DbPool, score: &FlakeScore) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flake_scores (test_id, score, confidence, window_n, features, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (test_id) DO UPDATE SET
                score = EXCLUDED.score,
                confidence = EXCLUDED.confidence,
                window_n = EXCLUDED.window_n,
                features = EXCLUDED.features,
                last_updated_at = EXCLUDED.last_updated_at
            WHERE flake_scores.last_updated_at <= EXCLUDED.last_updated_at
            "#,
        )
        .bind(&score.test_id)
        .bind(score.score)
        .bind(score.confidence)
        .bind(score.window_n)
        .bind(&score.features)
        .bind(score.last_updated_at)
        .execute(pool)
        .await
        .context("Failed to upsert flake score")?;

        Ok(())
    }

    /// Top-k flakiest tests joined with their identities
    pub async fn flakiest_with_tests(
        pool: &DbPool,
        repo_id: &str,
        limit: i64,
        min_score: f64,
    ) -> Result<Vec<ScoredTest>> {
        let rows = sqlx::query_as::<_, ScoredTest>(
            r#"
            SELECT fs.test_id, tc.suite, tc.class_name, tc.name, tc.file,
                   fs.score, fs.confidence, fs.window_n, fs.last_updated_at
            FROM flake_scores fs
            JOIN test_cases tc ON tc.id = fs.test_id
            WHERE tc.repo_id = $1 AND fs.score >= $2
            ORDER BY fs.score DESC
            LIMIT $3
            "#,
        )
        .bind(repo_id)
        .bind(min_score)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to list flakiest tests with identities")?;

        Ok(rows)
    }

}
