//! Ingestion workers for FlakeGuard
//!
//! Worker pools drain the durable queues: webhook events are dispatched and
//! fanned out, artifact-process jobs run the full ingestion pipeline
//! (download, extract, parse, persist, re-score), and the polling sweep
//! discovers runs whose webhooks went missing.

pub mod context;
pub mod extract;
pub mod pipeline;
pub mod processors;
pub mod scheduler;
pub mod worker;
