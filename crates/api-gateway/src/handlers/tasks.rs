//! Jobs view endpoint

use actix_web::{web, HttpResponse, Responder};
use validator::Validate;

use shared::models::JobStatus;
use shared::stores::QueueJobStore;

use crate::models::{Paged, TasksQuery};
use crate::state::AppState;

/// GET /api/v1/tasks
///
/// Durable queue-job records, filterable by queue and status.
pub async fn list(state: web::Data<AppState>, query: web::Query<TasksQuery>) -> impl Responder {
    if let Err(e) = query.validate() {
        return HttpResponse::BadRequest().json(serde_json::json!({ "error": e.to_string() }));
    }

    let limit = query.limit.unwrap_or(20);
    let offset = query.offset.unwrap_or(0);

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match parse_status(raw) {
            Some(status) => Some(status),
            None => {
                return HttpResponse::BadRequest()
                    .json(serde_json::json!({ "error": format!("unknown status {}", raw) }));
            }
        },
    };

    match QueueJobStore::list(
        &state.pool,
        limit,
        offset,
        query.job_type.as_deref(),
        status,
    )
    .await
    {
        Ok(items) => HttpResponse::Ok().json(Paged {
            items,
            limit,
            offset,
        }),
        Err(e) => {
            tracing::error!(error = %e, "Task listing failed");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": "failed to list tasks" }))
        }
    }
}

fn parse_status(raw: &str) -> Option<JobStatus> {
    match raw {
        "waiting" => Some(JobStatus::Waiting),
        "delayed" => Some(JobStatus::Delayed),
        "active" => Some(JobStatus::Active),
        "completed" => Some(JobStatus::Completed),
        "failed" => Some(JobStatus::Failed),
        _ => None,
    }
}
