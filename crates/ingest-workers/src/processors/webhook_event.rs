//! Webhook-event processor
//!
//! Dispatches by event type. A completed `workflow_run` upserts the run and
//! fans out an artifact-process job keyed deterministically on
//! `(repository, run)` so duplicate deliveries and polling converge on one
//! ingestion. Other relevant events update run/job rows only.

use serde_json::json;
use std::sync::Arc;

use shared::jobs::{ArtifactProcessJob, JobPayload, WebhookEventJob, ARTIFACT_PROCESS_QUEUE};
use shared::models::RunStatus;
use shared::queue::{JobEnvelope, JobQueue, Priority};
use shared::stores::{RepoStore, RunStore};
use shared::{Error, Result};

use crate::context::WorkerContext;

pub async fn process(ctx: &Arc<WorkerContext>, env: &JobEnvelope) -> Result<serde_json::Value> {
    let JobPayload::WebhookEvent(event) = serde_json::from_value(env.payload.clone())? else {
        return Err(Error::queue("webhook-event job carried a foreign payload"));
    };

    metrics::counter!(
        "webhook_events_total",
        "event" => event.event_type.clone(),
        "outcome" => "processing"
    )
    .increment(1);

    match event.event_type.as_str() {
        "workflow_run" => handle_workflow_run(ctx, &event).await,
        "workflow_job" => handle_workflow_job(ctx, &event).await,
        // accepted for completeness; these carry no report artifacts
        "check_run" | "check_suite" | "pull_request" => {
            tracing::debug!(
                event = %event.event_type,
                action = event.action.as_deref().unwrap_or("-"),
                delivery_id = %event.delivery_id,
                "Event acknowledged without ingestion"
            );
            Ok(json!({ "handled": false }))
        }
        other => Err(Error::queue(format!(
            "irrelevant event type {} reached the queue",
            other
        ))),
    }
}

async fn handle_workflow_run(
    ctx: &Arc<WorkerContext>,
    event: &WebhookEventJob,
) -> Result<serde_json::Value> {
    let run_payload = &event.payload["workflow_run"];
    let external_run_id = run_payload["id"]
        .as_i64()
        .ok_or_else(|| Error::validation("workflow_run payload missing run id"))?;

    let (owner, name) = split_full_name(event)?;
    let installation_id = event
        .installation_id
        .or(ctx.config.github.default_installation_id)
        .ok_or_else(|| Error::validation("no installation id on delivery"))?;

    let repo = RepoStore::upsert(&ctx.pool, "github", &owner, &name, installation_id)
        .await
        .map_err(|e| Error::internal(e.to_string()))?;

    let status: RunStatus = run_payload["status"]
        .as_str()
        .unwrap_or("queued")
        .parse()
        .unwrap_or(RunStatus::Queued);
    let conclusion = run_payload["conclusion"].as_str();

    // conclusion is set iff the run completed
    let (status, conclusion) = match (status, conclusion) {
        (RunStatus::Completed, None) => (RunStatus::Completed, Some("unknown")),
        (RunStatus::Completed, c) => (RunStatus::Completed, c),
        (s, _) => (s, None),
    };

    RunStore::upsert(&ctx.pool, &repo.id, external_run_id, status, conclusion)
        .await
        .map_err(|e| Error::internal(e.to_string()))?;

    if event.action.as_deref() == Some("completed") {
        let job = ArtifactProcessJob {
            owner,
            repo: name,
            repository_id: repo.id.clone(),
            run_id: external_run_id,
            installation_id,
            expected_format: None,
        };
        let envelope = JobEnvelope::new(
            job.job_id(),
            ARTIFACT_PROCESS_QUEUE,
            serde_json::to_value(JobPayload::ArtifactProcess(job))?,
        )
        .with_priority(Priority::High);

        let fresh = ctx.queue.enqueue(&envelope).await?;
        tracing::info!(
            repo = %repo.full_name(),
            run_id = external_run_id,
            fresh = fresh,
            "Run completed, ingestion enqueued"
        );
        return Ok(json!({ "enqueued": fresh, "run_id": external_run_id }));
    }

    Ok(json!({ "enqueued": false, "run_id": external_run_id }))
}

async fn handle_workflow_job(
    ctx: &Arc<WorkerContext>,
    event: &WebhookEventJob,
) -> Result<serde_json::Value> {
    let job_payload = &event.payload["workflow_job"];
    let external_job_id = job_payload["id"]
        .as_i64()
        .ok_or_else(|| Error::validation("workflow_job payload missing job id"))?;
    let external_run_id = job_payload["run_id"]
        .as_i64()
        .ok_or_else(|| Error::validation("workflow_job payload missing run id"))?;

    let (owner, name) = split_full_name(event)?;
    let installation_id = event
        .installation_id
        .or(ctx.config.github.default_installation_id)
        .ok_or_else(|| Error::validation("no installation id on delivery"))?;

    let repo = RepoStore::upsert(&ctx.pool, "github", &owner, &name, installation_id)
        .await
        .map_err(|e| Error::internal(e.to_string()))?;

    // the job may arrive before its run's webhook; register the run first
    let run = match RunStore::find_by_external_id(&ctx.pool, &repo.id, external_run_id)
        .await
        .map_err(|e| Error::internal(e.to_string()))?
    {
        Some(run) => run,
        None => RunStore::upsert(&ctx.pool, &repo.id, external_run_id, RunStatus::InProgress, None)
            .await
            .map_err(|e| Error::internal(e.to_string()))?,
    };

    let status: RunStatus = job_payload["status"]
        .as_str()
        .unwrap_or("queued")
        .parse()
        .unwrap_or(RunStatus::Queued);

    RunStore::upsert_job(
        &ctx.pool,
        &run.id,
        external_job_id,
        job_payload["name"].as_str().unwrap_or("(unnamed)"),
        status,
        job_payload["conclusion"].as_str(),
        parse_time(&job_payload["started_at"]),
        parse_time(&job_payload["completed_at"]),
    )
    .await
    .map_err(|e| Error::internal(e.to_string()))?;

    Ok(json!({ "job_id": external_job_id }))
}

fn split_full_name(event: &WebhookEventJob) -> Result<(String, String)> {
    let full_name = event
        .repository_full_name
        .as_deref()
        .ok_or_else(|| Error::validation("delivery missing repository full name"))?;
    let (owner, name) = full_name
        .split_once('/')
        .ok_or_else(|| Error::validation(format!("malformed repository name {}", full_name)))?;
    Ok((owner.to_string(), name.to_string()))
}

fn parse_time(value: &serde_json::Value) -> Option<chrono::DateTime<chrono::Utc>> {
    value
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(event_type: &str, full_name: Option<&str>) -> WebhookEventJob {
        WebhookEventJob {
            event_type: event_type.to_string(),
            delivery_id: "11111111-2222-4333-8444-555555555555".to_string(),
            repository_id: Some(1),
            repository_full_name: full_name.map(str::to_string),
            installation_id: Some(7),
            action: Some("completed".to_string()),
            payload: json!({}),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_split_full_name() {
        let (owner, name) = split_full_name(&event("workflow_run", Some("acme/widget"))).unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(name, "widget");
    }

    #[test]
    fn test_split_full_name_rejects_malformed() {
        assert!(split_full_name(&event("workflow_run", Some("acme"))).is_err());
        assert!(split_full_name(&event("workflow_run", None)).is_err());
    }

    #[test]
    fn test_parse_time() {
        assert!(parse_time(&json!("2024-03-01T10:00:00Z")).is_some());
        assert!(parse_time(&json!("not a time")).is_none());
        assert!(parse_time(&json!(null)).is_none());
    }
}
