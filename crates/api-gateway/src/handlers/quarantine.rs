//! Quarantine plan and policy endpoints

use actix_web::{web, HttpResponse, Responder};
use validator::Validate;

use crate::models::QuarantinePlanRequest;
use crate::services::query::QueryService;
use crate::state::AppState;

/// POST /api/v1/quarantine/plan
///
/// Runs the policy over each candidate's fetched history and returns the
/// ordered proposal. The plan is advisory; enforcement belongs to the
/// upstream collaborator.
#[utoipa::path(
    post,
    path = "/api/v1/quarantine/plan",
    tag = "Quarantine",
    request_body = QuarantinePlanRequest,
    responses(
        (status = 200, description = "Quarantine plan"),
        (status = 400, description = "Invalid request"),
        (status = 404, description = "Unknown repository")
    )
)]
pub async fn plan(
    state: web::Data<AppState>,
    body: web::Json<QuarantinePlanRequest>,
) -> impl Responder {
    if let Err(e) = body.validate() {
        return HttpResponse::BadRequest().json(serde_json::json!({ "error": e.to_string() }));
    }

    let request = body.into_inner();
    let lookback = request
        .lookback_days
        .unwrap_or(state.config.policy.lookback_days);

    match shared::stores::RepoStore::find_by_id(&state.pool, &request.repository_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return HttpResponse::NotFound().json(serde_json::json!({
                "error": format!("repository {} not found", request.repository_id)
            }));
        }
        Err(e) => {
            tracing::error!(error = %e, "Repository lookup failed");
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": "failed to fetch repository" }));
        }
    }

    match QueryService::quarantine_plan(
        &state.pool,
        &request.repository_id,
        &state.config.policy,
        request.policy.as_ref(),
        lookback,
        request.include_annotations.unwrap_or(false),
    )
    .await
    {
        Ok(plan) => HttpResponse::Ok().json(plan),
        Err(e) => {
            tracing::error!(repo_id = %request.repository_id, error = %e, "Plan generation failed");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": "failed to generate plan" }))
        }
    }
}

/// GET /api/v1/quarantine/policy
///
/// The effective policy defaults.
#[utoipa::path(
    get,
    path = "/api/v1/quarantine/policy",
    tag = "Quarantine",
    responses((status = 200, description = "Policy defaults"))
)]
pub async fn policy(state: web::Data<AppState>) -> impl Responder {
    let policy = &state.config.policy;
    HttpResponse::Ok().json(serde_json::json!({
        "warn_threshold": policy.warn_threshold,
        "quarantine_threshold": policy.quarantine_threshold,
        "min_runs_for_quarantine": policy.min_runs_for_quarantine,
        "min_recent_failures": policy.min_recent_failures,
        "lookback_days": policy.lookback_days,
        "rolling_window_size": policy.rolling_window_size,
    }))
}
