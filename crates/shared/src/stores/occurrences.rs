//! Occurrence store
//!
//! Occurrences are append-only; the ingest pipeline never deletes them.
//! Inserts are idempotent on `(test_id, run_id, attempt)` so reprocessing an
//! artifact converges instead of duplicating rows.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Occurrence, OccurrenceStatus};
use crate::DbPool;

/// One row of a bulk occurrence insert
#[derive(Debug, Clone)]
pub struct NewOccurrence {
    pub test_id: String,
    pub run_id: String,
    pub status: OccurrenceStatus,
    pub duration_ms: Option<i64>,
    pub failure_msg_signature: Option<String>,
    pub stack_digest: Option<String>,
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
}

pub struct OccurrenceStore;

impl OccurrenceStore {
    /// Bulk-insert occurrences in batches.
    ///
    /// Each batch is a single multi-row `UNNEST` statement (the COPY-style
    /// path) with `ON CONFLICT DO NOTHING`, so a replayed artifact leaves at
    /// most one row per `(test_id, run_id, attempt)`. Returns the number of
    /// rows actually inserted.
    pub async fn insert_batch(
        pool: &DbPool,
        rows: &[NewOccurrence],
        batch_size: usize,
    ) -> Result<u64> {
        let batch_size = batch_size.clamp(100, 1000);
        let mut inserted = 0u64;

        for chunk in rows.chunks(batch_size) {
            let ids: Vec<String> = chunk.iter().map(|_| Uuid::new_v4().to_string()).collect();
            let test_ids: Vec<&str> = chunk.iter().map(|r| r.test_id.as_str()).collect();
            let run_ids: Vec<&str> = chunk.iter().map(|r| r.run_id.as_str()).collect();
            let statuses: Vec<String> = chunk.iter().map(|r| r.status.to_string()).collect();
            let durations: Vec<Option<i64>> = chunk.iter().map(|r| r.duration_ms).collect();
            let signatures: Vec<Option<String>> = chunk
                .iter()
                .map(|r| r.failure_msg_signature.clone())
                .collect();
            let digests: Vec<Option<String>> =
                chunk.iter().map(|r| r.stack_digest.clone()).collect();
            let attempts: Vec<i32> = chunk.iter().map(|r| r.attempt).collect();
            let created: Vec<DateTime<Utc>> = chunk.iter().map(|r| r.created_at).collect();

            let result = sqlx::query(
                r#"
                INSERT INTO occurrences
                    (id, test_id, run_id, status, duration_ms, failure_msg_signature,
                     stack_digest, attempt, created_at)
                SELECT * FROM UNNEST(
                    $1::TEXT[], $2::TEXT[], $3::TEXT[], $4::TEXT[], $5::BIGINT[],
                    $6::TEXT[], $7::TEXT[], $8::INT[], $9::TIMESTAMPTZ[]
                )
                ON CONFLICT (test_id, run_id, attempt) DO NOTHING
                "#,
            )
            .bind(&ids)
            .bind(&test_ids)
            .bind(&run_ids)
            .bind(&statuses)
            .bind(&durations)
            .bind(&signatures)
            .bind(&digests)
            .bind(&attempts)
            .bind(&created)
            .execute(pool)
            .await
            .context("Failed to bulk-insert occurrences")?;

            inserted += result.rows_affected();
        }

        Ok(inserted)
    }

    /// The scorer's rolling window: most recent `window_n` occurrences in
    /// canonical order `(created_at, attempt)`, returned oldest first.
    pub async fn window_for_test(
        pool: &DbPool,
        test_id: &str,
        window_n: i64,
    ) -> Result<Vec<Occurrence>> {
        let mut rows = sqlx::query_as::<_, Occurrence>(
            r#"
            SELECT * FROM occurrences
            WHERE test_id = $1
            ORDER BY created_at DESC, attempt DESC
            LIMIT $2
            "#,
        )
        .bind(test_id)
        .bind(window_n)
        .fetch_all(pool)
        .await
        .context("Failed to read occurrence window")?;

        rows.reverse();
        Ok(rows)
    }

    /// Ordered occurrences within the trailing `days`
    pub async fn history_for_test(
        pool: &DbPool,
        test_id: &str,
        days: i64,
    ) -> Result<Vec<Occurrence>> {
        let rows = sqlx::query_as::<_, Occurrence>(
            r#"
            SELECT * FROM occurrences
            WHERE test_id = $1
              AND created_at > NOW() - ($2 * INTERVAL '1 day')
            ORDER BY created_at ASC, attempt ASC
            "#,
        )
        .bind(test_id)
        .bind(days)
        .fetch_all(pool)
        .await
        .context("Failed to read occurrence history")?;

        Ok(rows)
    }
}
