//! Route configuration for the API

use actix_web::web;

use crate::handlers;
use crate::middleware::metrics::metrics_handler;

/// Configure all routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/webhook", web::post().to(handlers::webhook::receive))
        .route("/metrics", web::get().to(metrics_handler))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(handlers::health::health_check))
                .route(
                    "/openapi.json",
                    web::get().to(handlers::health::openapi_json),
                )
                .route("/repositories", web::get().to(handlers::repositories::list))
                .route(
                    "/repositories/{id}",
                    web::get().to(handlers::repositories::get),
                )
                .route(
                    "/repositories/{id}/dashboard",
                    web::get().to(handlers::repositories::dashboard),
                )
                .route(
                    "/repositories/{id}/flaky-tests",
                    web::get().to(handlers::repositories::flakiest),
                )
                .route(
                    "/repositories/{id}/clusters/{signature}",
                    web::get().to(handlers::repositories::similar_failures),
                )
                .route(
                    "/repositories/{id}/quarantine-candidates",
                    web::get().to(handlers::repositories::quarantine_candidates),
                )
                .route("/tests/{id}/history", web::get().to(handlers::tests::history))
                .route("/tasks", web::get().to(handlers::tasks::list))
                .route("/quarantine/plan", web::post().to(handlers::quarantine::plan))
                .route(
                    "/quarantine/policy",
                    web::get().to(handlers::quarantine::policy),
                ),
        );
}
