//! Data models matching the PostgreSQL database schema

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// A code repository under flakiness analysis
///
/// Registered when its first webhook or registration arrives. Never deleted
/// while it owns test cases; deactivation is the `active` flag.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Repository {
    pub id: String,
    /// Provider tag, currently always "github"
    pub provider: String,
    pub owner: String,
    pub name: String,
    pub installation_id: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    /// "owner/name" as the provider renders it
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Workflow run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" | "requested" | "waiting" | "pending" => Ok(RunStatus::Queued),
            "in_progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => anyhow::bail!("Invalid run status: {}", s),
        }
    }
}

/// A single CI execution of a workflow
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRun {
    pub id: String,
    pub repo_id: String,
    pub external_run_id: i64,
    pub status: RunStatus,
    /// Set iff status is `completed`
    pub conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single executor within a run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CiJob {
    pub id: String,
    pub run_id: String,
    pub external_job_id: i64,
    pub name: String,
    pub status: RunStatus,
    pub conclusion: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A uniquely identifiable test over time
///
/// Identity is `(repo_id, suite, class_name, name)`. A test is never
/// renamed; an apparent rename produces a new row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TestCase {
    pub id: String,
    pub repo_id: String,
    pub suite: String,
    pub class_name: Option<String>,
    pub name: String,
    pub file: Option<String>,
    pub owner_team: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one test execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OccurrenceStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl OccurrenceStatus {
    /// Failures and errors both count against a test
    pub fn is_failing(self) -> bool {
        matches!(self, OccurrenceStatus::Failed | OccurrenceStatus::Error)
    }
}

impl fmt::Display for OccurrenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OccurrenceStatus::Passed => "passed",
            OccurrenceStatus::Failed => "failed",
            OccurrenceStatus::Skipped => "skipped",
            OccurrenceStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// One execution of one test in one run attempt
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Occurrence {
    pub id: String,
    pub test_id: String,
    pub run_id: String,
    pub status: OccurrenceStatus,
    pub duration_ms: Option<i64>,
    pub failure_msg_signature: Option<String>,
    pub stack_digest: Option<String>,
    /// 1-indexed retry attempt within the run
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
}

/// Current scoring snapshot for a test
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlakeScore {
    pub test_id: String,
    pub score: f64,
    pub confidence: f64,
    pub window_n: i32,
    #[sqlx(json)]
    pub features: serde_json::Value,
    pub last_updated_at: DateTime<Utc>,
}

/// A group of failures sharing a normalized signature
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FailureCluster {
    pub id: String,
    pub repo_id: String,
    pub failure_msg_signature: String,
    pub example_message: String,
    pub occurrence_count: i64,
    pub test_ids: Vec<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Quarantine decision state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT")]
pub enum QuarantineState {
    #[sqlx(rename = "NONE")]
    #[serde(rename = "NONE")]
    None,
    #[sqlx(rename = "ACTIVE")]
    #[serde(rename = "ACTIVE")]
    Active,
    #[sqlx(rename = "EXPIRED")]
    #[serde(rename = "EXPIRED")]
    Expired,
}

impl fmt::Display for QuarantineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuarantineState::None => "NONE",
            QuarantineState::Active => "ACTIVE",
            QuarantineState::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

/// An observed or proposed quarantine state for a test
///
/// At most one ACTIVE decision per test at any instant; an ACTIVE decision
/// with `until` in the past is semantically EXPIRED.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuarantineDecision {
    pub id: String,
    pub test_id: String,
    pub state: QuarantineState,
    pub rationale: String,
    pub by_user: Option<String>,
    pub until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl QuarantineDecision {
    /// ACTIVE and not lapsed at `now`
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.state == QuarantineState::Active && self.until.map(|u| u > now).unwrap_or(true)
    }
}

/// External tracker reference for a test case
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IssueLink {
    pub id: String,
    pub test_id: String,
    pub provider: String,
    pub issue_number: i64,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// Queue job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Durable record of a queue job (the read-side view of the Redis transport)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueueJobRecord {
    pub id: String,
    pub queue: String,
    #[sqlx(json)]
    pub payload: serde_json::Value,
    pub priority: String,
    pub status: JobStatus,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub failed_reason: Option<String>,
    #[sqlx(json(nullable))]
    pub return_value: Option<serde_json::Value>,
    #[sqlx(json(nullable))]
    pub progress: Option<serde_json::Value>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_from_provider_strings() {
        assert_eq!("queued".parse::<RunStatus>().unwrap(), RunStatus::Queued);
        assert_eq!("waiting".parse::<RunStatus>().unwrap(), RunStatus::Queued);
        assert_eq!(
            "in_progress".parse::<RunStatus>().unwrap(),
            RunStatus::InProgress
        );
        assert_eq!(
            "completed".parse::<RunStatus>().unwrap(),
            RunStatus::Completed
        );
        assert!("exploded".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_occurrence_status_failing() {
        assert!(OccurrenceStatus::Failed.is_failing());
        assert!(OccurrenceStatus::Error.is_failing());
        assert!(!OccurrenceStatus::Passed.is_failing());
        assert!(!OccurrenceStatus::Skipped.is_failing());
    }

    #[test]
    fn test_quarantine_effective_window() {
        let now = Utc::now();
        let decision = QuarantineDecision {
            id: "q1".into(),
            test_id: "t1".into(),
            state: QuarantineState::Active,
            rationale: "flaky".into(),
            by_user: None,
            until: Some(now + chrono::Duration::days(1)),
            created_at: now,
        };
        assert!(decision.is_effective(now));
        assert!(!decision.is_effective(now + chrono::Duration::days(2)));

        let open_ended = QuarantineDecision {
            until: None,
            ..decision.clone()
        };
        assert!(open_ended.is_effective(now + chrono::Duration::days(400)));
    }

    #[test]
    fn test_repository_full_name() {
        let repo = Repository {
            id: "r1".into(),
            provider: "github".into(),
            owner: "acme".into(),
            name: "widget".into(),
            installation_id: 7,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(repo.full_name(), "acme/widget");
    }
}
