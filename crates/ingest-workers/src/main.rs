//! Ingestion workers for FlakeGuard
//!
//! Drains the webhook-event, artifact-process and polling queues, runs the
//! periodic schedulers, and exposes Prometheus metrics.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use github_client::{GithubClient, InMemorySentinel};
use ingest_workers::{context::WorkerContext, scheduler, worker};
use shared::queue::RedisJobQueue;
use shared::{db, Config, ARTIFACT_PROCESS_QUEUE, POLLING_QUEUE, WEBHOOK_EVENTS_QUEUE};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    shared::init_tracing();

    tracing::info!("Starting Ingestion Workers...");

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

    // Create Redis connection
    let redis_client = redis::Client::open(config.redis.connection_url())
        .context("Failed to create Redis client")?;
    let redis_conn = redis_client
        .get_connection_manager()
        .await
        .context("Failed to connect to Redis")?;

    tracing::info!("Connected to Redis");

    // Prometheus exposition on its own port
    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9090".to_string())
        .parse()
        .context("Invalid METRICS_PORT")?;
    let metrics_addr: SocketAddr = ([0, 0, 0, 0], metrics_port).into();
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    tracing::info!("Metrics exposed on :{}/metrics", metrics_port);

    // GitHub adapter with the process-wide rate-limit sentinel
    let sentinel = Arc::new(InMemorySentinel::new());
    let github = Arc::new(
        GithubClient::new(
            &config.github,
            config.rate_limit,
            config.breaker,
            config.timeouts,
            sentinel,
        )
        .context("Failed to build GitHub client")?,
    );

    let queue = RedisJobQueue::new(redis_conn.clone(), db_pool.clone());
    let ctx = WorkerContext::new(db_pool, queue, github, config.clone());

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    // Worker pools per queue
    for (queue_name, concurrency) in [
        (WEBHOOK_EVENTS_QUEUE, config.ingestion.queue_concurrency),
        (ARTIFACT_PROCESS_QUEUE, config.ingestion.queue_concurrency),
        (POLLING_QUEUE, 1),
    ] {
        let ctx = ctx.clone();
        let redis = redis_conn.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            worker::run_pool(ctx, redis, queue_name, concurrency, shutdown).await;
        }));
    }

    // Periodic schedulers
    tasks.push(tokio::spawn(scheduler::run_delayed_mover(
        ctx.clone(),
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(scheduler::run_stalled_reclaimer(
        ctx.clone(),
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(scheduler::run_polling_tick(
        ctx.clone(),
        shutdown.clone(),
    )));

    tracing::info!("Ingestion Workers ready");

    // Wait for shutdown signal
    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received, stopping workers...");
    shutdown.cancel();

    for task in tasks {
        let _ = task.await;
    }

    tracing::info!("Ingestion Workers shutdown complete");

    Ok(())
}
