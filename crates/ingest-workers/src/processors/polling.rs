//! Polling discovery processor
//!
//! The scheduled safety net for missed webhooks: list recent runs for every
//! active repository and enqueue ingestion for completed runs we have not
//! seen. Skips entirely while the rate-limit sentinel says to wait.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use shared::jobs::{ArtifactProcessJob, JobPayload, ARTIFACT_PROCESS_QUEUE};
use shared::models::RunStatus;
use shared::queue::{JobEnvelope, JobQueue, Priority};
use shared::stores::{RepoStore, RunStore};
use shared::{Error, Result};

use crate::context::WorkerContext;

/// Runs fetched per repository per sweep
const RUNS_PER_SWEEP: u32 = 25;

/// Known-run lookback when diffing provider listings
const KNOWN_RUNS_WINDOW: i64 = 200;

pub async fn process(ctx: &Arc<WorkerContext>, _env: &JobEnvelope) -> Result<serde_json::Value> {
    // honor the process-wide backoff before any outbound work
    match ctx.github.rate_gate().check(Utc::now()).await {
        Ok(()) => {}
        Err(Error::RateLimited { reset_at }) => {
            tracing::info!(reset_at = %reset_at, "Polling sweep skipped, rate-limit backoff");
            return Ok(json!({ "skipped": "rate-limited", "reset_at": reset_at }));
        }
        Err(e) => return Err(e),
    }

    let repos = RepoStore::list_active(&ctx.pool)
        .await
        .map_err(|e| Error::internal(e.to_string()))?;

    let mut discovered = 0usize;
    let mut failures = 0usize;

    for repo in &repos {
        match sweep_repo(ctx, repo).await {
            Ok(count) => discovered += count,
            Err(Error::RateLimited { reset_at }) => {
                // stop the sweep immediately; the sentinel is now set
                tracing::info!(reset_at = %reset_at, "Polling sweep halted mid-way by rate limit");
                break;
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(repo = %repo.full_name(), error = %e, "Repo sweep failed, continuing");
            }
        }
    }

    tracing::info!(
        repos = repos.len(),
        discovered = discovered,
        failures = failures,
        "Polling sweep complete"
    );

    Ok(json!({ "repos": repos.len(), "discovered": discovered, "failures": failures }))
}

async fn sweep_repo(
    ctx: &Arc<WorkerContext>,
    repo: &shared::models::Repository,
) -> Result<usize> {
    let runs = ctx
        .github
        .list_recent_runs(&repo.owner, &repo.name, repo.installation_id, RUNS_PER_SWEEP)
        .await?;

    let known = RunStore::known_external_ids(&ctx.pool, &repo.id, KNOWN_RUNS_WINDOW)
        .await
        .map_err(|e| Error::internal(e.to_string()))?;

    let mut enqueued = 0usize;
    for run in runs {
        if run.status != "completed" || known.contains(&run.id) {
            continue;
        }

        let status: RunStatus = run.status.parse().unwrap_or(RunStatus::Completed);
        RunStore::upsert(
            &ctx.pool,
            &repo.id,
            run.id,
            status,
            Some(run.conclusion.as_deref().unwrap_or("unknown")),
        )
        .await
        .map_err(|e| Error::internal(e.to_string()))?;

        let job = ArtifactProcessJob {
            owner: repo.owner.clone(),
            repo: repo.name.clone(),
            repository_id: repo.id.clone(),
            run_id: run.id,
            installation_id: repo.installation_id,
            expected_format: None,
        };
        let envelope = JobEnvelope::new(
            job.job_id(),
            ARTIFACT_PROCESS_QUEUE,
            serde_json::to_value(JobPayload::ArtifactProcess(job))?,
        )
        .with_priority(Priority::Low);

        // the deterministic job id makes this a no-op when the webhook won
        if ctx.queue.enqueue(&envelope).await? {
            enqueued += 1;
        }
    }

    Ok(enqueued)
}
