//! Background schedulers
//!
//! Three periodic loops run beside the worker pools: the delayed-job mover
//! promotes due retries back onto the priority lists, the stalled reclaimer
//! rescues jobs whose workers died and sweeps lapsed quarantine decisions,
//! and the polling tick enqueues the five-minute discovery sweep.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use shared::jobs::{JobPayload, PollingJob, POLLING_QUEUE};
use shared::queue::{JobEnvelope, JobQueue, Priority};
use shared::stores::{DecisionStore, QueueJobStore};
use shared::{ARTIFACT_PROCESS_QUEUE, WEBHOOK_EVENTS_QUEUE};

use crate::context::WorkerContext;

/// Delayed-set promotion cadence
const MOVER_INTERVAL_SECS: u64 = 5;

/// Stalled-job scan cadence
const RECLAIM_INTERVAL_SECS: u64 = 60;

/// A job is stalled once its heartbeat is this old
const STALLED_AFTER_SECS: i64 = 120;

/// Polling sweep cadence
const POLLING_INTERVAL_SECS: u64 = 300;

const ALL_QUEUES: [&str; 3] = [WEBHOOK_EVENTS_QUEUE, ARTIFACT_PROCESS_QUEUE, POLLING_QUEUE];

/// Promote due delayed jobs onto their priority lists
pub async fn run_delayed_mover(ctx: Arc<WorkerContext>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(MOVER_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for queue in ALL_QUEUES {
            match ctx.queue.promote_due(queue).await {
                Ok(promoted) if promoted > 0 => {
                    tracing::debug!(queue = queue, promoted = promoted, "Delayed jobs promoted");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(queue = queue, error = %e, "Delayed promotion failed"),
            }
        }
    }
}

/// Re-deliver jobs whose workers died mid-flight and expire quarantine
/// decisions whose `until` has lapsed
pub async fn run_stalled_reclaimer(ctx: Arc<WorkerContext>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(RECLAIM_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for queue in ALL_QUEUES {
            let stalled = match QueueJobStore::reclaim_stalled(
                &ctx.pool,
                queue,
                chrono::Duration::seconds(STALLED_AFTER_SECS),
            )
            .await
            {
                Ok(stalled) => stalled,
                Err(e) => {
                    tracing::warn!(queue = queue, error = %e, "Stalled scan failed");
                    continue;
                }
            };

            for record in stalled {
                tracing::warn!(
                    job_id = %record.id,
                    queue = queue,
                    attempts_made = record.attempts_made,
                    "Reclaiming stalled job"
                );
                let envelope = JobEnvelope {
                    id: record.id.clone(),
                    queue: queue.to_string(),
                    payload: record.payload,
                    priority: record.priority.parse().unwrap_or(Priority::Normal),
                    delay_secs: 0,
                    max_attempts: record.max_attempts as u32,
                    attempts_made: record.attempts_made as u32,
                    backoff_base_secs: 5,
                    enqueued_at: record.created_at,
                };
                if let Err(e) = ctx
                    .queue
                    .requeue(&envelope, std::time::Duration::ZERO)
                    .await
                {
                    tracing::error!(job_id = %envelope.id, error = %e, "Failed to requeue stalled job");
                }
            }
        }

        match DecisionStore::expire_lapsed(&ctx.pool).await {
            Ok(expired) if expired > 0 => {
                tracing::info!(expired = expired, "Lapsed quarantine decisions expired");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Quarantine expiry sweep failed"),
        }

        update_depth_gauges(&ctx).await;
    }
}

/// Enqueue the discovery sweep every five minutes.
/// The job id buckets on the tick so a restarted scheduler cannot stack
/// duplicate sweeps inside one interval.
pub async fn run_polling_tick(ctx: Arc<WorkerContext>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(POLLING_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Utc::now();
        let bucket = now.timestamp() / POLLING_INTERVAL_SECS as i64;
        let payload = JobPayload::Polling(PollingJob { scheduled_at: now });
        let envelope = JobEnvelope::new(
            format!("polling:{}", bucket),
            POLLING_QUEUE,
            match serde_json::to_value(payload) {
                Ok(value) => value,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize polling job");
                    continue;
                }
            },
        )
        .with_priority(Priority::Low);

        match ctx.queue.enqueue(&envelope).await {
            Ok(true) => tracing::debug!(job_id = %envelope.id, "Polling sweep enqueued"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to enqueue polling sweep"),
        }
    }
}

async fn update_depth_gauges(ctx: &Arc<WorkerContext>) {
    for queue in ALL_QUEUES {
        match QueueJobStore::count_by_status(&ctx.pool, queue).await {
            Ok(counts) => {
                for (status, count) in counts {
                    metrics::gauge!(
                        "queue_depth",
                        "queue" => queue.to_string(),
                        "status" => status
                    )
                    .set(count as f64);
                }
            }
            Err(e) => tracing::debug!(queue = queue, error = %e, "Depth gauge update failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_string_roundtrip() {
        for priority in Priority::drain_order() {
            let parsed: Priority = priority.as_str().parse().unwrap();
            assert_eq!(parsed, priority);
        }
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_polling_bucket_is_stable_within_interval() {
        let t1 = 1_700_000_000i64;
        let t2 = t1 + 100; // same 300 s bucket
        assert_eq!(
            t1 / POLLING_INTERVAL_SECS as i64,
            t2 / POLLING_INTERVAL_SECS as i64
        );
    }
}
