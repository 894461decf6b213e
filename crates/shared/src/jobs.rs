//! Job payload definitions for the ingestion queues
//!
//! The gateway enqueues webhook-event jobs; the webhook processor fans out
//! artifact-process jobs; the polling scheduler enqueues discovery sweeps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue carrying raw webhook deliveries
pub const WEBHOOK_EVENTS_QUEUE: &str = "webhook-events";

/// Queue carrying artifact ingestion work
pub const ARTIFACT_PROCESS_QUEUE: &str = "artifact-process";

/// Queue carrying scheduled run-discovery sweeps
pub const POLLING_QUEUE: &str = "polling";

/// Minimal payload captured on the webhook request path
///
/// The job id is the delivery id, which is also the queue's deduplication
/// key: a redelivered webhook enqueues nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventJob {
    pub event_type: String,
    pub delivery_id: String,
    pub repository_id: Option<i64>,
    pub repository_full_name: Option<String>,
    pub installation_id: Option<i64>,
    pub action: Option<String>,
    /// Raw event body, parsed lazily by the processor
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Ingestion work for one completed workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactProcessJob {
    pub owner: String,
    pub repo: String,
    pub repository_id: String,
    pub run_id: i64,
    pub installation_id: i64,
    /// Dialect hint forwarded to the parser, when the workflow declares one
    pub expected_format: Option<String>,
}

impl ArtifactProcessJob {
    /// Deterministic job id so concurrent ingestions of one run converge
    pub fn job_id(&self) -> String {
        format!("artifact-process:{}:{}", self.repository_id, self.run_id)
    }
}

/// A single discovery sweep over active repositories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingJob {
    pub scheduled_at: DateTime<Utc>,
}

/// Typed view over the payloads this system enqueues
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobPayload {
    WebhookEvent(WebhookEventJob),
    ArtifactProcess(ArtifactProcessJob),
    Polling(PollingJob),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_webhook_job_roundtrip() {
        let job = WebhookEventJob {
            event_type: "workflow_run".into(),
            delivery_id: "d3adbeef-0000-4000-8000-000000000001".into(),
            repository_id: Some(42),
            repository_full_name: Some("acme/widget".into()),
            installation_id: Some(7),
            action: Some("completed".into()),
            payload: json!({"action": "completed"}),
            received_at: Utc::now(),
        };

        let serialized = serde_json::to_string(&JobPayload::WebhookEvent(job.clone())).unwrap();
        let parsed: JobPayload = serde_json::from_str(&serialized).unwrap();
        match parsed {
            JobPayload::WebhookEvent(parsed) => {
                assert_eq!(parsed.delivery_id, job.delivery_id);
                assert_eq!(parsed.event_type, "workflow_run");
                assert_eq!(parsed.action.as_deref(), Some("completed"));
            }
            other => panic!("wrong payload variant: {:?}", other),
        }
    }

    #[test]
    fn test_artifact_job_id_is_deterministic() {
        let job = ArtifactProcessJob {
            owner: "acme".into(),
            repo: "widget".into(),
            repository_id: "repo-1".into(),
            run_id: 9001,
            installation_id: 7,
            expected_format: None,
        };
        assert_eq!(job.job_id(), "artifact-process:repo-1:9001");
        assert_eq!(job.job_id(), job.job_id());
    }

    #[test]
    fn test_payload_tag_names() {
        let sweep = JobPayload::Polling(PollingJob {
            scheduled_at: Utc::now(),
        });
        let value = serde_json::to_value(&sweep).unwrap();
        assert_eq!(value["kind"], "polling");
    }
}
