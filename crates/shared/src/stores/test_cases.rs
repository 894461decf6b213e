//! Test case store

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::models::TestCase;
use crate::DbPool;

/// The identity under which a test is tracked over time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestCaseKey {
    pub suite: String,
    pub class_name: Option<String>,
    pub name: String,
}

pub struct TestCaseStore;

impl TestCaseStore {
    /// Get-or-create a test case by its identity.
    ///
    /// The unique index treats NULL class names as equal, so repeated
    /// ingestion of a class-less suite resolves to one row. An apparent
    /// rename simply creates a new identity.
    pub async fn upsert(
        pool: &DbPool,
        repo_id: &str,
        key: &TestCaseKey,
        file: Option<&str>,
    ) -> Result<TestCase> {
        let test = sqlx::query_as::<_, TestCase>(
            r#"
            INSERT INTO test_cases (id, repo_id, suite, class_name, name, file, owner_team, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NULL, $7)
            ON CONFLICT (repo_id, suite, COALESCE(class_name, ''), name) DO UPDATE SET
                file = COALESCE(EXCLUDED.file, test_cases.file)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(repo_id)
        .bind(&key.suite)
        .bind(&key.class_name)
        .bind(&key.name)
        .bind(file)
        .bind(chrono::Utc::now())
        .fetch_one(pool)
        .await
        .context("Failed to upsert test case")?;

        Ok(test)
    }

    /// Find test case by ID
    pub async fn find_by_id(pool: &DbPool, test_id: &str) -> Result<Option<TestCase>> {
        let test = sqlx::query_as::<_, TestCase>(
            r#"
            SELECT * FROM test_cases
            WHERE id = $1
            "#,
        )
        .bind(test_id)
        .fetch_optional(pool)
        .await
        .context("Failed to find test case by ID")?;

        Ok(test)
    }
}
