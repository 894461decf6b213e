//! Job processors, dispatched by queue name

pub mod polling;
pub mod webhook_event;

use std::sync::Arc;

use shared::queue::JobEnvelope;
use shared::{Error, Result, ARTIFACT_PROCESS_QUEUE, POLLING_QUEUE, WEBHOOK_EVENTS_QUEUE};

use crate::context::WorkerContext;
use crate::pipeline;

/// Route a job to its processor and return the job's result value
pub async fn dispatch(ctx: &Arc<WorkerContext>, env: &JobEnvelope) -> Result<serde_json::Value> {
    match env.queue.as_str() {
        WEBHOOK_EVENTS_QUEUE => webhook_event::process(ctx, env).await,
        ARTIFACT_PROCESS_QUEUE => pipeline::process(ctx, env).await,
        POLLING_QUEUE => polling::process(ctx, env).await,
        other => Err(Error::queue(format!("no processor for queue {}", other))),
    }
}
