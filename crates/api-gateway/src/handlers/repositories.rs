//! Repository read endpoints

use actix_web::{web, HttpResponse, Responder};
use validator::Validate;

use shared::stores::{ClusterStore, RepoStore};

use crate::models::{FlakiestQuery, Paged, RepositoryListQuery};
use crate::services::query::QueryService;
use crate::state::AppState;

/// GET /api/v1/repositories
pub async fn list(
    state: web::Data<AppState>,
    query: web::Query<RepositoryListQuery>,
) -> impl Responder {
    if let Err(e) = query.validate() {
        return HttpResponse::BadRequest().json(serde_json::json!({ "error": e.to_string() }));
    }

    let limit = query.limit.unwrap_or(20);
    let offset = query.offset.unwrap_or(0);

    match RepoStore::list(&state.pool, limit, offset, query.search.as_deref()).await {
        Ok(items) => HttpResponse::Ok().json(Paged {
            items,
            limit,
            offset,
        }),
        Err(e) => {
            tracing::error!(error = %e, "Repository listing failed");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": "failed to list repositories" }))
        }
    }
}

/// GET /api/v1/repositories/{id}
pub async fn get(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let repo_id = path.into_inner();
    match RepoStore::find_by_id(&state.pool, &repo_id).await {
        Ok(Some(repo)) => HttpResponse::Ok().json(repo),
        Ok(None) => HttpResponse::NotFound()
            .json(serde_json::json!({ "error": format!("repository {} not found", repo_id) })),
        Err(e) => {
            tracing::error!(repo_id = %repo_id, error = %e, "Repository fetch failed");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": "failed to fetch repository" }))
        }
    }
}

/// GET /api/v1/repositories/{id}/dashboard
///
/// Aggregate counts in a single read, cached briefly.
pub async fn dashboard(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let repo_id = path.into_inner();
    let cache_key = shared::cache::dashboard_key(&repo_id);

    if let Some(cache) = &state.cache {
        if let Some(cached) = cache.get::<serde_json::Value>(&cache_key).await {
            return HttpResponse::Ok().json(cached);
        }
    }

    let counts = RepoStore::dashboard(
        &state.pool,
        &repo_id,
        state.config.policy.warn_threshold,
        state.config.policy.lookback_days as i64,
    )
    .await;

    match counts {
        Ok(counts) => {
            let body = serde_json::json!({
                "repository_id": repo_id,
                "counts": counts,
            });
            if let Some(cache) = &state.cache {
                cache.set(&cache_key, &body).await;
            }
            HttpResponse::Ok().json(body)
        }
        Err(e) => {
            tracing::error!(repo_id = %repo_id, error = %e, "Dashboard read failed");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": "failed to build dashboard" }))
        }
    }
}

/// GET /api/v1/repositories/{id}/flaky-tests
pub async fn flakiest(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<FlakiestQuery>,
) -> impl Responder {
    if let Err(e) = query.validate() {
        return HttpResponse::BadRequest().json(serde_json::json!({ "error": e.to_string() }));
    }

    let repo_id = path.into_inner();
    let limit = query.limit.unwrap_or(20);
    let min_score = query.min_score.unwrap_or(0.0);

    match QueryService::flakiest_tests(&state.pool, &repo_id, limit, min_score).await {
        Ok(tests) => HttpResponse::Ok().json(tests),
        Err(e) => {
            tracing::error!(repo_id = %repo_id, error = %e, "Flakiest listing failed");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": "failed to list flaky tests" }))
        }
    }
}

/// GET /api/v1/repositories/{id}/clusters/{signature}
///
/// One failure cluster and its affected tests.
pub async fn similar_failures(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (repo_id, signature) = path.into_inner();

    match ClusterStore::find_by_signature(&state.pool, &repo_id, &signature).await {
        Ok(Some(cluster)) => HttpResponse::Ok().json(cluster),
        Ok(None) => HttpResponse::NotFound()
            .json(serde_json::json!({ "error": format!("no cluster for signature {}", signature) })),
        Err(e) => {
            tracing::error!(repo_id = %repo_id, error = %e, "Cluster fetch failed");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": "failed to fetch cluster" }))
        }
    }
}

/// GET /api/v1/repositories/{id}/quarantine-candidates
pub async fn quarantine_candidates(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let repo_id = path.into_inner();
    let policy = &state.config.policy;

    match QueryService::quarantine_candidates(
        &state.pool,
        &repo_id,
        policy.quarantine_threshold,
        policy.min_runs_for_quarantine as i32,
    )
    .await
    {
        Ok(candidates) => {
            let body: Vec<_> = candidates
                .into_iter()
                .map(|(test_id, score)| serde_json::json!({ "test_id": test_id, "score": score }))
                .collect();
            HttpResponse::Ok().json(body)
        }
        Err(e) => {
            tracing::error!(repo_id = %repo_id, error = %e, "Candidate listing failed");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": "failed to list candidates" }))
        }
    }
}
