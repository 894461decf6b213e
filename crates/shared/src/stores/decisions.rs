//! Quarantine decision store
//!
//! The at-most-one-ACTIVE invariant is enforced twice: a partial unique
//! index on `(test_id) WHERE state = 'ACTIVE'`, and the propose transaction
//! which expires the previous ACTIVE row before inserting the new one.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{QuarantineDecision, QuarantineState};
use crate::DbPool;

pub struct DecisionStore;

impl DecisionStore {
    /// The effective ACTIVE decision for a test, if any
    pub async fn active_for_test(
        pool: &DbPool,
        test_id: &str,
    ) -> Result<Option<QuarantineDecision>> {
        let decision = sqlx::query_as::<_, QuarantineDecision>(
            r#"
            SELECT * FROM quarantine_decisions
            WHERE test_id = $1 AND state = 'ACTIVE'
              AND (until IS NULL OR until > NOW())
            "#,
        )
        .bind(test_id)
        .fetch_optional(pool)
        .await
        .context("Failed to find active quarantine decision")?;

        Ok(decision)
    }

    /// Record a new decision, expiring any prior ACTIVE one atomically
    pub async fn propose(
        pool: &DbPool,
        test_id: &str,
        state: QuarantineState,
        rationale: &str,
        by_user: Option<&str>,
        until: Option<DateTime<Utc>>,
    ) -> Result<QuarantineDecision> {
        let mut tx = pool.begin().await.context("Failed to open transaction")?;

        if state == QuarantineState::Active {
            sqlx::query(
                r#"
                UPDATE quarantine_decisions SET state = 'EXPIRED'
                WHERE test_id = $1 AND state = 'ACTIVE'
                "#,
            )
            .bind(test_id)
            .execute(&mut *tx)
            .await
            .context("Failed to expire prior quarantine decision")?;
        }

        let decision = sqlx::query_as::<_, QuarantineDecision>(
            r#"
            INSERT INTO quarantine_decisions (id, test_id, state, rationale, by_user, until, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(test_id)
        .bind(state)
        .bind(rationale)
        .bind(by_user)
        .bind(until)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert quarantine decision")?;

        tx.commit().await.context("Failed to commit decision")?;

        Ok(decision)
    }

    /// Sweep ACTIVE decisions whose `until` has lapsed into EXPIRED
    pub async fn expire_lapsed(pool: &DbPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE quarantine_decisions SET state = 'EXPIRED'
            WHERE state = 'ACTIVE' AND until IS NOT NULL AND until <= NOW()
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to expire lapsed decisions")?;

        Ok(result.rows_affected())
    }

    /// Tests scoring at or above `score_threshold` with at least `min_runs`
    /// observed and no effective ACTIVE decision. Feed for the plan builder.
    pub async fn candidates(
        pool: &DbPool,
        repo_id: &str,
        score_threshold: f64,
        min_runs: i32,
    ) -> Result<Vec<(String, f64)>> {
        let rows: Vec<(String, f64)> = sqlx::query_as(
            r#"
            SELECT fs.test_id, fs.score FROM flake_scores fs
            JOIN test_cases tc ON tc.id = fs.test_id
            WHERE tc.repo_id = $1
              AND fs.score >= $2
              AND fs.window_n >= $3
              AND NOT EXISTS (
                  SELECT 1 FROM quarantine_decisions qd
                  WHERE qd.test_id = fs.test_id AND qd.state = 'ACTIVE'
                    AND (qd.until IS NULL OR qd.until > NOW())
              )
            ORDER BY fs.score DESC
            "#,
        )
        .bind(repo_id)
        .bind(score_threshold)
        .bind(min_runs)
        .fetch_all(pool)
        .await
        .context("Failed to list quarantine candidates")?;

        Ok(rows)
    }
}
