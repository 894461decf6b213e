//! Shared library for FlakeGuard backend services
//!
//! This crate provides common functionality used across all backend services:
//! - Database connection pooling and utilities
//! - Common data models matching the PostgreSQL schema
//! - Entity stores for persistence
//! - Error handling types
//! - Configuration management
//! - Logging infrastructure
//! - Durable job queue primitives shared by the gateway and workers

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod models;
pub mod queue;
pub mod stores;

// Re-export commonly used types
pub use config::Config;
pub use db::DbPool;
pub use error::{Error, Result};
pub use jobs::{JobPayload, ARTIFACT_PROCESS_QUEUE, POLLING_QUEUE, WEBHOOK_EVENTS_QUEUE};
pub use queue::{JobEnvelope, Priority};

/// Initialize tracing subscriber for structured logging
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "shared=debug,api_gateway=debug,ingest_workers=debug,github_client=debug,info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
