//! Durable job queue primitives
//!
//! Redis lists are the transport (one list per priority, BRPOP'd in
//! priority order, so ordering is FIFO modulo priority). A PostgreSQL
//! `queue_jobs` row is the record of truth for every job and doubles as the
//! deduplication key: enqueueing an id that already exists is a no-op, which
//! gives at-most-once enqueue per webhook delivery id.
//!
//! Delayed and retried jobs sit in a per-queue ZSET scored by their ready
//! time; a mover task promotes due members back onto the priority lists.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::db::DbPool;
use crate::error::{Error, Result};

/// Completed-job ids retained per queue
pub const COMPLETED_RETENTION: isize = 100;

/// Failed-job ids retained per queue
pub const FAILED_RETENTION: isize = 50;

/// Job priority; higher drains first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Drain order for consumers
    pub fn drain_order() -> [Priority; 4] {
        [
            Priority::Critical,
            Priority::High,
            Priority::Normal,
            Priority::Low,
        ]
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(Error::queue(format!("unknown priority {}", other))),
        }
    }
}

/// A job as it travels through Redis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Unique id; also the deduplication key
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    /// Seconds to hold the job in the delayed set before first delivery
    pub delay_secs: u64,
    pub max_attempts: u32,
    pub attempts_made: u32,
    /// Base for exponential retry backoff, in seconds
    pub backoff_base_secs: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    /// Envelope with the webhook-path defaults: normal priority, immediate,
    /// 3 attempts, exponential backoff from 5 s.
    pub fn new(id: impl Into<String>, queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            payload,
            priority: Priority::Normal,
            delay_secs: 0,
            max_attempts: 3,
            attempts_made: 0,
            backoff_base_secs: 5,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_secs = delay.as_secs();
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_secs = base.as_secs();
        self
    }

    /// Whether the retry budget still has room after a failure
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Backoff before the next delivery: `base * 2^(attempts_made - 1)`,
    /// jittered by up to ±10% so retry storms decorrelate.
    pub fn retry_delay(&self) -> Duration {
        let exponent = self.attempts_made.saturating_sub(1).min(16);
        let base = self.backoff_base_secs.saturating_mul(1u64 << exponent);
        let jitter_band = (base as f64 * 0.1).max(0.0);
        let jitter = rand::thread_rng().gen_range(-jitter_band..=jitter_band);
        Duration::from_secs_f64((base as f64 + jitter).max(0.0))
    }
}

/// Redis list holding ready jobs at one priority
pub fn priority_list_key(queue: &str, priority: Priority) -> String {
    format!("cq:{}:{}", queue, priority.as_str())
}

/// Redis ZSET holding delayed/retrying jobs, scored by ready time
pub fn delayed_set_key(queue: &str) -> String {
    format!("cq:{}:delayed", queue)
}

/// Redis list of recently completed job ids (bounded)
pub fn completed_list_key(queue: &str) -> String {
    format!("cq:{}:completed", queue)
}

/// Redis list of recently failed job ids (bounded)
pub fn failed_list_key(queue: &str) -> String {
    format!("cq:{}:failed", queue)
}

/// Abstract producer interface for testability
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit a job. Returns `false` when the id was already enqueued inside
    /// the retention window and the submission was deduplicated.
    async fn enqueue(&self, job: &JobEnvelope) -> Result<bool>;
}

/// Abstract consumer interface for testability
#[async_trait]
pub trait JobConsumer: Send + Sync {
    /// Block up to `timeout_secs` for the next job, draining priorities
    /// critical → low.
    async fn next_job(&self, timeout_secs: u64) -> Result<Option<JobEnvelope>>;
}

/// Redis + Postgres backed producer
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    pool: DbPool,
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager, pool: DbPool) -> Self {
        Self { conn, pool }
    }

    /// The underlying transport connection, for bookkeeping writes
    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }

    /// Push a (possibly retried) envelope back onto the transport without
    /// touching the dedup record.
    pub async fn requeue(&self, job: &JobEnvelope, delay: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(job)?;
        if delay.is_zero() {
            conn.lpush::<_, _, ()>(priority_list_key(&job.queue, job.priority), body)
                .await?;
        } else {
            let ready_at = (Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default())
                .timestamp_millis();
            conn.zadd::<_, _, _, ()>(delayed_set_key(&job.queue), body, ready_at)
                .await?;
        }
        Ok(())
    }

    /// Promote delayed jobs whose ready time has passed onto the priority
    /// lists. Returns how many were promoted.
    pub async fn promote_due(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(delayed_set_key(queue), i64::MIN, now_ms, 0, 100)
            .await?;

        let mut promoted = 0;
        for body in due {
            let removed: i64 = conn.zrem(delayed_set_key(queue), &body).await?;
            // Another mover may have claimed this member between the range
            // read and the removal.
            if removed == 0 {
                continue;
            }
            let job: JobEnvelope = serde_json::from_str(&body)?;
            conn.lpush::<_, _, ()>(priority_list_key(queue, job.priority), body)
                .await?;
            promoted += 1;
        }
        Ok(promoted)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &JobEnvelope) -> Result<bool> {
        // The durable row is the dedup gate: only a fresh insert may touch
        // the transport, so a redelivered id enqueues nothing.
        let inserted = sqlx::query(
            r#"
            INSERT INTO queue_jobs
                (id, queue, payload, priority, status, attempts_made, max_attempts,
                 scheduled_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(job.priority.as_str())
        .bind(if job.delay_secs > 0 { "delayed" } else { "waiting" })
        .bind(job.max_attempts as i32)
        .bind(if job.delay_secs > 0 {
            Some(Utc::now() + chrono::Duration::seconds(job.delay_secs as i64))
        } else {
            None
        })
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            tracing::debug!(job_id = %job.id, queue = %job.queue, "Duplicate job id, enqueue skipped");
            return Ok(false);
        }

        let mut conn = self.conn.clone();
        let body = serde_json::to_string(job)?;
        if job.delay_secs > 0 {
            let ready_at =
                (Utc::now() + chrono::Duration::seconds(job.delay_secs as i64)).timestamp_millis();
            conn.zadd::<_, _, _, ()>(delayed_set_key(&job.queue), body, ready_at)
                .await
                .map_err(Error::Redis)?;
        } else {
            conn.lpush::<_, _, ()>(priority_list_key(&job.queue, job.priority), body)
                .await
                .map_err(Error::Redis)?;
        }

        tracing::debug!(
            job_id = %job.id,
            queue = %job.queue,
            priority = %job.priority,
            delay_secs = job.delay_secs,
            "Enqueued job"
        );

        Ok(true)
    }
}

/// Redis-backed consumer
#[derive(Clone)]
pub struct RedisJobConsumer {
    conn: ConnectionManager,
    queue: String,
}

impl RedisJobConsumer {
    pub fn new(conn: ConnectionManager, queue: impl Into<String>) -> Self {
        Self {
            conn,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl JobConsumer for RedisJobConsumer {
    async fn next_job(&self, timeout_secs: u64) -> Result<Option<JobEnvelope>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = Priority::drain_order()
            .iter()
            .map(|p| priority_list_key(&self.queue, *p))
            .collect();

        // BRPOP scans keys left to right, which realizes FIFO modulo priority
        let result: Option<(String, String)> = conn
            .brpop(keys, timeout_secs as f64)
            .await
            .map_err(Error::Redis)?;

        match result {
            Some((_, body)) => {
                let job: JobEnvelope = serde_json::from_str(&body)?;
                tracing::debug!(job_id = %job.id, queue = %self.queue, "Consumed job");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }
}

/// Trim the bounded completed/failed bookkeeping lists after recording `id`.
pub async fn record_outcome(
    conn: &ConnectionManager,
    queue: &str,
    id: &str,
    failed: bool,
) -> Result<()> {
    let mut conn = conn.clone();
    let (key, keep) = if failed {
        (failed_list_key(queue), FAILED_RETENTION)
    } else {
        (completed_list_key(queue), COMPLETED_RETENTION)
    };
    conn.lpush::<_, _, ()>(&key, id).await?;
    conn.ltrim::<_, ()>(&key, 0, keep - 1).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use serde_json::json;

    mock! {
        pub Queue {}

        #[async_trait]
        impl JobQueue for Queue {
            async fn enqueue(&self, job: &JobEnvelope) -> Result<bool>;
        }
    }

    #[test]
    fn test_envelope_defaults_match_webhook_contract() {
        let job = JobEnvelope::new("delivery-1", "webhook-events", json!({}));
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.backoff_base_secs, 5);
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.delay_secs, 0);
        assert!(job.has_attempts_left());
    }

    #[test]
    fn test_retry_delay_grows_exponentially() {
        let mut job = JobEnvelope::new("j", "q", json!({})).with_backoff_base(Duration::from_secs(5));

        job.attempts_made = 1;
        let first = job.retry_delay().as_secs_f64();
        assert!((4.5..=5.5).contains(&first), "first retry was {}", first);

        job.attempts_made = 2;
        let second = job.retry_delay().as_secs_f64();
        assert!((9.0..=11.0).contains(&second), "second retry was {}", second);

        job.attempts_made = 3;
        let third = job.retry_delay().as_secs_f64();
        assert!((18.0..=22.0).contains(&third), "third retry was {}", third);
    }

    #[test]
    fn test_attempt_budget() {
        let mut job = JobEnvelope::new("j", "q", json!({})).with_max_attempts(2);
        assert!(job.has_attempts_left());
        job.attempts_made = 1;
        assert!(job.has_attempts_left());
        job.attempts_made = 2;
        assert!(!job.has_attempts_left());
    }

    #[test]
    fn test_priority_drain_order() {
        let order = Priority::drain_order();
        assert_eq!(order[0], Priority::Critical);
        assert_eq!(order[3], Priority::Low);
    }

    #[test]
    fn test_key_shapes() {
        assert_eq!(
            priority_list_key("artifact-process", Priority::High),
            "cq:artifact-process:high"
        );
        assert_eq!(delayed_set_key("polling"), "cq:polling:delayed");
    }

    #[tokio::test]
    async fn test_duplicate_delivery_enqueues_once() {
        // S6: two submissions with the same delivery id materialize one job.
        let mut queue = MockQueue::new();
        let mut seen = std::collections::HashSet::new();
        queue.expect_enqueue().times(2).returning(move |job| {
            let fresh = seen.insert(job.id.clone());
            Ok(fresh)
        });

        let job = JobEnvelope::new("delivery-abc", WEBHOOK_QUEUE_FOR_TEST, json!({}));
        assert!(queue.enqueue(&job).await.unwrap());
        assert!(!queue.enqueue(&job).await.unwrap());
    }

    const WEBHOOK_QUEUE_FOR_TEST: &str = "webhook-events";
}
