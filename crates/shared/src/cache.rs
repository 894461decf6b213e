//! Best-effort TTL cache for read-side entities
//!
//! Caches flake scores and test histories for dashboard reads. Never
//! authoritative: quarantine decisions always go back to PostgreSQL, and
//! every Redis failure degrades to a miss.
//!
//! # Key Prefixes
//!
//! - `score:{test_id}` - current flake score snapshot
//! - `history:{test_id}:{days}` - recent occurrence slice
//! - `dashboard:{repo_id}` - aggregate dashboard payload

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Default cache TTL in seconds (5 minutes)
const DEFAULT_TTL_SECS: u64 = 300;

/// TTL-bounded entity cache
#[derive(Clone)]
pub struct EntityCache {
    redis: ConnectionManager,
    ttl: Duration,
    enabled: bool,
}

impl EntityCache {
    /// Create a new entity cache
    ///
    /// `ttl_secs` of `None` selects the 300 s default.
    pub fn new(redis: ConnectionManager, ttl_secs: Option<u64>) -> Self {
        let enabled = std::env::var("ENTITY_CACHE_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        let ttl = Duration::from_secs(ttl_secs.unwrap_or(DEFAULT_TTL_SECS));

        debug!(
            ttl_secs = ttl.as_secs(),
            enabled = enabled,
            "Initializing EntityCache"
        );

        Self {
            redis,
            ttl,
            enabled,
        }
    }

    /// Get an entity from cache
    ///
    /// Returns None if not found or on Redis error (graceful degradation)
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }

        let mut conn = self.redis.clone();

        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(json_str)) => match serde_json::from_str(&json_str) {
                Ok(entity) => {
                    debug!(key = key, "Cache HIT");
                    Some(entity)
                }
                Err(e) => {
                    warn!(key = key, error = %e, "Failed to deserialize cached entity");
                    None
                }
            },
            Ok(None) => {
                debug!(key = key, "Cache MISS");
                None
            }
            Err(e) => {
                warn!(key = key, error = %e, "Redis cache read failed");
                None
            }
        }
    }

    /// Store an entity in cache
    ///
    /// Errors are logged but don't fail the operation (graceful degradation)
    pub async fn set<T: Serialize>(&self, key: &str, entity: &T) {
        if !self.enabled {
            return;
        }

        let mut conn = self.redis.clone();

        match serde_json::to_string(entity) {
            Ok(json_str) => {
                if let Err(e) = conn
                    .set_ex::<_, _, ()>(key, json_str, self.ttl.as_secs())
                    .await
                {
                    warn!(key = key, error = %e, "Redis cache write failed");
                }
            }
            Err(e) => {
                warn!(key = key, error = %e, "Failed to serialize entity for cache");
            }
        }
    }

    /// Drop a cached entity after its source row changes
    pub async fn invalidate(&self, key: &str) {
        if !self.enabled {
            return;
        }

        let mut conn = self.redis.clone();

        if let Err(e) = conn.del::<_, ()>(key).await {
            warn!(key = key, error = %e, "Redis cache delete failed");
        }
    }
}

/// Cache key for a test's score snapshot
pub fn score_key(test_id: &str) -> String {
    format!("score:{}", test_id)
}

/// Cache key for a test's recent history slice
pub fn history_key(test_id: &str, days: u32) -> String {
    format!("history:{}:{}", test_id, days)
}

/// Cache key for a repository dashboard payload
pub fn dashboard_key(repo_id: &str) -> String {
    format!("dashboard:{}", repo_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(score_key("t-1"), "score:t-1");
        assert_eq!(history_key("t-1", 7), "history:t-1:7");
        assert_eq!(dashboard_key("r-9"), "dashboard:r-9");
    }
}
