//! API Gateway for FlakeGuard
//!
//! Webhook intake plus the read-side REST surface for dashboards and
//! quarantine planning.

use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;

use api_gateway::middleware::{self, metrics::PrometheusMetrics};
use api_gateway::routes;
use api_gateway::state::AppState;
use shared::cache::EntityCache;
use shared::queue::RedisJobQueue;
use shared::{db, Config};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    shared::init_tracing();

    tracing::info!("Starting API Gateway...");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Create database connection pool
    let db_pool = db::create_pool(&config.database)
        .await
        .context("Failed to create database pool")?;

    // Run database migrations
    db::run_migrations(&db_pool)
        .await
        .context("Failed to run database migrations")?;

    // Check database health
    db::check_health(&db_pool)
        .await
        .context("Database health check failed")?;

    // Redis backs the job queue and the best-effort read caches
    let redis_client = redis::Client::open(config.redis.connection_url())
        .context("Failed to create Redis client")?;
    let redis_conn = redis_client
        .get_connection_manager()
        .await
        .context("Failed to connect to Redis")?;
    tracing::info!("Connected to Redis");

    let queue = Arc::new(RedisJobQueue::new(redis_conn.clone(), db_pool.clone()));
    let cache = EntityCache::new(redis_conn, None);

    // Install the Prometheus recorder before any request lands
    let _prometheus = api_gateway::middleware::metrics::init_metrics();

    let state = AppState::new(db_pool, queue, Some(cache), config.clone());

    let server_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("API Gateway listening on {}", server_addr);

    HttpServer::new(move || {
        App::new()
            // Add logger middleware
            .wrap(Logger::default())
            // Request metrics (counter, histogram, in-flight gauge)
            .wrap(PrometheusMetrics::new())
            // Add CORS middleware
            .wrap(middleware::cors())
            // Webhook bodies are modest; 1MB cap matches the provider's
            .app_data(web::PayloadConfig::new(1_048_576))
            .app_data(web::JsonConfig::default().limit(1_048_576))
            .app_data(web::Data::new(state.clone()))
            // Configure routes
            .configure(routes::configure)
    })
    .bind(&server_addr)
    .with_context(|| format!("Failed to bind to {}", server_addr))?
    .run()
    .await
    .context("Server error")?;

    tracing::info!("API Gateway shutdown complete");

    Ok(())
}
