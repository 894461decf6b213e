//! OpenAPI document for the REST surface

use utoipa::OpenApi;

use crate::handlers;
use crate::models;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health_check,
        handlers::health::openapi_json,
        handlers::quarantine::plan,
        handlers::quarantine::policy,
    ),
    components(schemas(
        handlers::health::HealthResponse,
        models::WebhookResponse,
        models::QuarantinePlanRequest,
        models::QuarantinePlanResponse,
        models::PlanEntry,
        models::PolicyDto,
    )),
    tags(
        (name = "Health", description = "Service health"),
        (name = "Discovery", description = "API self-description"),
        (name = "Quarantine", description = "Quarantine plans and policy")
    ),
    info(
        title = "FlakeGuard API",
        description = "Flaky-test analytics and quarantine planning"
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_document_builds() {
        let doc = ApiDoc::openapi();
        let json = doc.to_json().unwrap();
        assert!(json.contains("/api/v1/quarantine/plan"));
        assert!(json.contains("FlakeGuard API"));
    }
}
