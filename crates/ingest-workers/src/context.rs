//! Shared worker state

use std::sync::Arc;

use github_client::GithubClient;
use shared::queue::RedisJobQueue;
use shared::{Config, DbPool};

/// Everything a processor needs, passed by Arc into each worker task
pub struct WorkerContext {
    pub pool: DbPool,
    pub queue: RedisJobQueue,
    pub github: Arc<GithubClient>,
    pub config: Config,
}

impl WorkerContext {
    pub fn new(
        pool: DbPool,
        queue: RedisJobQueue,
        github: Arc<GithubClient>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            queue,
            github,
            config,
        })
    }
}
