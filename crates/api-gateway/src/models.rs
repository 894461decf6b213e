//! Request and response DTOs for the REST surface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use flake_analysis::{PolicyAction, PolicyPriority};
use shared::models::Occurrence;

/// Webhook acknowledgement body
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
}

impl WebhookResponse {
    pub fn accepted(message: impl Into<String>, delivery_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            delivery_id: Some(delivery_id.into()),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            delivery_id: None,
        }
    }
}

/// Pagination and search for the repository listing
#[derive(Debug, Deserialize, Validate)]
pub struct RepositoryListQuery {
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<i64>,
    #[validate(range(min = 0))]
    pub offset: Option<i64>,
    #[validate(length(max = 200))]
    pub search: Option<String>,
}

/// Query for the flakiest-tests listing
#[derive(Debug, Deserialize, Validate)]
pub struct FlakiestQuery {
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<i64>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_score: Option<f64>,
}

/// Query for a test's occurrence history
#[derive(Debug, Deserialize, Validate)]
pub struct HistoryQuery {
    #[validate(range(min = 1, max = 90))]
    pub days: Option<i64>,
}

/// Query for the jobs view
#[derive(Debug, Deserialize, Validate)]
pub struct TasksQuery {
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<i64>,
    #[validate(range(min = 0))]
    pub offset: Option<i64>,
    /// Queue name filter
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub status: Option<String>,
}

/// Policy fields a plan request may override
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct PolicyDto {
    pub warn_threshold: Option<f64>,
    pub quarantine_threshold: Option<f64>,
    pub min_runs_for_quarantine: Option<u32>,
    pub min_recent_failures: Option<u32>,
    pub lookback_days: Option<u32>,
    pub rolling_window_size: Option<u32>,
}

/// Quarantine plan request
#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuarantinePlanRequest {
    #[validate(length(min = 1))]
    pub repository_id: String,
    pub policy: Option<PolicyDto>,
    #[validate(range(min = 1, max = 90))]
    pub lookback_days: Option<u32>,
    pub include_annotations: Option<bool>,
}

/// One entry of a quarantine plan
#[derive(Debug, Serialize, ToSchema)]
pub struct PlanEntry {
    pub test_id: String,
    pub suite: String,
    pub class_name: Option<String>,
    pub name: String,
    pub score: f64,
    pub confidence: f64,
    #[schema(value_type = String)]
    pub action: PolicyAction,
    #[schema(value_type = String)]
    pub priority: PolicyPriority,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

/// Quarantine plan response
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuarantinePlanResponse {
    pub repository_id: String,
    pub generated_at: DateTime<Utc>,
    pub lookback_days: u32,
    pub entries: Vec<PlanEntry>,
}

/// Test history response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TestHistoryResponse {
    pub test_id: String,
    pub days: i64,
    #[schema(value_type = Vec<Object>)]
    pub occurrences: Vec<Occurrence>,
}

/// Paged envelope for list endpoints
#[derive(Debug, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub limit: i64,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_response_shapes() {
        let accepted = WebhookResponse::accepted("queued", "d-1");
        let json = serde_json::to_value(&accepted).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["deliveryId"].as_str(), None); // snake_case field
        assert_eq!(json["delivery_id"], "d-1");

        let rejected = WebhookResponse::rejected("bad signature");
        let json = serde_json::to_value(&rejected).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("delivery_id").is_none());
    }

    #[test]
    fn test_plan_request_accepts_camel_case() {
        let request: QuarantinePlanRequest = serde_json::from_str(
            r#"{"repositoryId": "r-1", "lookbackDays": 14, "includeAnnotations": true}"#,
        )
        .unwrap();
        assert_eq!(request.repository_id, "r-1");
        assert_eq!(request.lookback_days, Some(14));
        assert_eq!(request.include_annotations, Some(true));
    }

    #[test]
    fn test_plan_request_validation() {
        let request = QuarantinePlanRequest {
            repository_id: String::new(),
            policy: None,
            lookback_days: Some(500),
            include_annotations: None,
        };
        assert!(request.validate().is_err());
    }
}
