//! Worker pool loop
//!
//! Each queue binds a pool of identical workers. A worker pulls a job,
//! marks it active in the durable record, runs its processor under the
//! wall-clock budget while a heartbeat task keeps the stalled reclaimer at
//! bay, then settles the job: completed, delayed for retry, or terminally
//! failed once the attempt budget is spent.

use std::sync::Arc;
use std::time::Instant;

use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;

use shared::queue::{record_outcome, JobConsumer, JobEnvelope, RedisJobConsumer};
use shared::stores::QueueJobStore;
use shared::Error;

use crate::context::WorkerContext;
use crate::processors;

/// How long a worker blocks waiting for a job before re-checking shutdown
const POLL_TIMEOUT_SECS: u64 = 5;

/// Heartbeat cadence while a job is active
const HEARTBEAT_SECS: u64 = 30;

/// Spawn `concurrency` workers for one queue; resolves when all exit
pub async fn run_pool(
    ctx: Arc<WorkerContext>,
    redis: ConnectionManager,
    queue_name: &'static str,
    concurrency: usize,
    shutdown: CancellationToken,
) {
    let mut handles = Vec::new();
    for worker_index in 0..concurrency.max(1) {
        let ctx = ctx.clone();
        let consumer = RedisJobConsumer::new(redis.clone(), queue_name);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(ctx, consumer, queue_name, worker_index, shutdown).await;
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(queue = queue_name, error = %e, "Worker task panicked");
        }
    }
}

async fn worker_loop(
    ctx: Arc<WorkerContext>,
    consumer: RedisJobConsumer,
    queue_name: &'static str,
    worker_index: usize,
    shutdown: CancellationToken,
) {
    tracing::info!(queue = queue_name, worker = worker_index, "Worker started");

    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = consumer.next_job(POLL_TIMEOUT_SECS) => job,
        };

        match job {
            Ok(Some(envelope)) => {
                run_job(&ctx, envelope, &shutdown).await;
            }
            Ok(None) => {} // poll timeout, loop for shutdown check
            Err(e) => {
                tracing::error!(queue = queue_name, error = %e, "Queue pull failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }

    tracing::info!(queue = queue_name, worker = worker_index, "Worker stopped");
}

async fn run_job(ctx: &Arc<WorkerContext>, mut envelope: JobEnvelope, shutdown: &CancellationToken) {
    envelope.attempts_made += 1;
    let started = Instant::now();

    if let Err(e) =
        QueueJobStore::mark_active(&ctx.pool, &envelope.id, envelope.attempts_made as i32).await
    {
        tracing::error!(job_id = %envelope.id, error = %e, "Failed to mark job active");
    }

    // heartbeat keeps the stalled reclaimer from stealing a live job
    let heartbeat = tokio::spawn({
        let pool = ctx.pool.clone();
        let job_id = envelope.id.clone();
        async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_SECS));
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if let Err(e) = QueueJobStore::heartbeat(&pool, &job_id).await {
                    tracing::debug!(job_id = %job_id, error = %e, "Heartbeat failed");
                }
            }
        }
    });

    let budget = ctx.config.timeouts.job();
    let outcome = tokio::select! {
        result = tokio::time::timeout(budget, processors::dispatch(ctx, &envelope)) => {
            match result {
                Ok(result) => result,
                Err(_) => Err(Error::network(format!(
                    "job exceeded its {}s budget",
                    budget.as_secs()
                ))),
            }
        }
        _ = shutdown.cancelled() => {
            // shutdown mid-job: fail retryable so another worker resumes it
            Err(Error::queue("worker shut down mid-job"))
        }
    };

    heartbeat.abort();

    let duration = started.elapsed();
    match outcome {
        Ok(return_value) => {
            if let Err(e) =
                QueueJobStore::complete(&ctx.pool, &envelope.id, Some(&return_value)).await
            {
                tracing::error!(job_id = %envelope.id, error = %e, "Failed to record completion");
            }
            let _ = record_outcome(ctx.queue_conn(), &envelope.queue, &envelope.id, false).await;
            metrics::counter!(
                "queue_jobs_total",
                "queue" => envelope.queue.clone(),
                "status" => "completed"
            )
            .increment(1);
            metrics::histogram!("queue_job_duration_seconds", "queue" => envelope.queue.clone())
                .record(duration.as_secs_f64());
            tracing::info!(
                job_id = %envelope.id,
                queue = %envelope.queue,
                duration_ms = duration.as_millis() as u64,
                "Job completed"
            );
        }
        Err(e) => settle_failure(ctx, envelope, e).await,
    }
}

async fn settle_failure(ctx: &Arc<WorkerContext>, envelope: JobEnvelope, error: Error) {
    let retry = error.is_retryable() && envelope.has_attempts_left();

    if retry {
        let delay = envelope.retry_delay();
        let scheduled_at = chrono::Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(5));

        if let Err(store_err) =
            QueueJobStore::fail_retryable(&ctx.pool, &envelope.id, &error.to_string(), scheduled_at)
                .await
        {
            tracing::error!(job_id = %envelope.id, error = %store_err, "Failed to record retry");
        }
        if let Err(requeue_err) = ctx.queue.requeue(&envelope, delay).await {
            tracing::error!(job_id = %envelope.id, error = %requeue_err, "Failed to requeue job");
        }

        metrics::counter!(
            "queue_jobs_total",
            "queue" => envelope.queue.clone(),
            "status" => "retried"
        )
        .increment(1);
        tracing::warn!(
            job_id = %envelope.id,
            attempt = envelope.attempts_made,
            max_attempts = envelope.max_attempts,
            delay_secs = delay.as_secs(),
            error = %error,
            "Job failed, retrying"
        );
    } else {
        if let Err(store_err) =
            QueueJobStore::fail_terminal(&ctx.pool, &envelope.id, &error.to_string()).await
        {
            tracing::error!(job_id = %envelope.id, error = %store_err, "Failed to record failure");
        }
        let _ = record_outcome(ctx.queue_conn(), &envelope.queue, &envelope.id, true).await;

        metrics::counter!(
            "queue_jobs_total",
            "queue" => envelope.queue.clone(),
            "status" => "failed"
        )
        .increment(1);
        tracing::error!(
            job_id = %envelope.id,
            attempts = envelope.attempts_made,
            error = %error,
            "Job terminally failed"
        );
    }
}

impl WorkerContext {
    /// The Redis connection backing the queue, for bookkeeping writes
    pub fn queue_conn(&self) -> &ConnectionManager {
        self.queue.connection()
    }
}
