//! Test-level read endpoints

use actix_web::{web, HttpResponse, Responder};
use validator::Validate;

use shared::stores::{OccurrenceStore, TestCaseStore};

use crate::models::{HistoryQuery, TestHistoryResponse};
use crate::state::AppState;

/// GET /api/v1/tests/{id}/history
pub async fn history(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> impl Responder {
    if let Err(e) = query.validate() {
        return HttpResponse::BadRequest().json(serde_json::json!({ "error": e.to_string() }));
    }

    let test_id = path.into_inner();
    let days = query.days.unwrap_or(state.config.policy.lookback_days as i64);

    match TestCaseStore::find_by_id(&state.pool, &test_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return HttpResponse::NotFound()
                .json(serde_json::json!({ "error": format!("test {} not found", test_id) }));
        }
        Err(e) => {
            tracing::error!(test_id = %test_id, error = %e, "Test lookup failed");
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": "failed to fetch test" }));
        }
    }

    let cache_key = shared::cache::history_key(&test_id, days as u32);
    if let Some(cache) = &state.cache {
        if let Some(cached) = cache.get::<TestHistoryResponse>(&cache_key).await {
            return HttpResponse::Ok().json(cached);
        }
    }

    match OccurrenceStore::history_for_test(&state.pool, &test_id, days).await {
        Ok(occurrences) => {
            let response = TestHistoryResponse {
                test_id,
                days,
                occurrences,
            };
            if let Some(cache) = &state.cache {
                cache.set(&cache_key, &response).await;
            }
            HttpResponse::Ok().json(response)
        }
        Err(e) => {
            tracing::error!(error = %e, "History read failed");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": "failed to read history" }))
        }
    }
}
