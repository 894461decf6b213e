//! Shared application state

use std::sync::Arc;

use shared::cache::EntityCache;
use shared::queue::JobQueue;
use shared::{Config, DbPool};

/// State handed to every handler.
///
/// The queue sits behind its trait so webhook tests can substitute a mock.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub queue: Arc<dyn JobQueue>,
    pub cache: Option<EntityCache>,
    pub config: Config,
}

impl AppState {
    pub fn new(
        pool: DbPool,
        queue: Arc<dyn JobQueue>,
        cache: Option<EntityCache>,
        config: Config,
    ) -> Self {
        Self {
            pool,
            queue,
            cache,
            config,
        }
    }
}
