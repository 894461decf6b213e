//! Outbound rate-limit posture
//!
//! GitHub reports the remaining budget on every response. The gate keeps
//! the latest observation and fails fast once remaining drops to the
//! configured reserve, recording a process-wide wait-until-reset sentinel
//! that the polling scheduler consults before enqueueing new work. The
//! sentinel sits behind a trait so tests can substitute it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

use shared::{Error, Result};

/// Process-wide wait-until-reset marker
#[async_trait]
pub trait RateLimitSentinel: Send + Sync {
    /// The reset instant outbound work must wait for, if one is set
    async fn wait_until(&self) -> Option<DateTime<Utc>>;

    /// Record a reset instant
    async fn set_wait_until(&self, until: DateTime<Utc>);

    /// Clear the marker once the window has reset
    async fn clear(&self);
}

/// Default in-process sentinel
#[derive(Default)]
pub struct InMemorySentinel {
    inner: RwLock<Option<DateTime<Utc>>>,
}

impl InMemorySentinel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitSentinel for InMemorySentinel {
    async fn wait_until(&self) -> Option<DateTime<Utc>> {
        *self.inner.read().await
    }

    async fn set_wait_until(&self, until: DateTime<Utc>) {
        *self.inner.write().await = Some(until);
    }

    async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    remaining: i64,
    reset_at: DateTime<Utc>,
}

/// Pre-flight gate over the cached rate-limit window
pub struct RateLimitGate {
    reserve: i64,
    latest: RwLock<Option<Observation>>,
    sentinel: Arc<dyn RateLimitSentinel>,
}

impl RateLimitGate {
    pub fn new(reserve: u32, sentinel: Arc<dyn RateLimitSentinel>) -> Self {
        Self {
            reserve: reserve as i64,
            latest: RwLock::new(None),
            sentinel,
        }
    }

    /// Check before an outbound call. Fails fast with [`Error::RateLimited`]
    /// while the budget sits at or under the reserve and the window has not
    /// reset.
    pub async fn check(&self, now: DateTime<Utc>) -> Result<()> {
        if let Some(until) = self.sentinel.wait_until().await {
            if until > now {
                return Err(Error::RateLimited { reset_at: until });
            }
            self.sentinel.clear().await;
        }

        let latest = *self.latest.read().await;
        if let Some(observation) = latest {
            if observation.remaining <= self.reserve && observation.reset_at > now {
                self.sentinel.set_wait_until(observation.reset_at).await;
                tracing::warn!(
                    remaining = observation.remaining,
                    reserve = self.reserve,
                    reset_at = %observation.reset_at,
                    "Rate-limit reserve reached, deferring outbound work"
                );
                return Err(Error::RateLimited {
                    reset_at: observation.reset_at,
                });
            }
        }

        Ok(())
    }

    /// Fold response headers into the cached window
    pub async fn observe(&self, remaining: Option<i64>, reset_at: Option<DateTime<Utc>>) {
        if let (Some(remaining), Some(reset_at)) = (remaining, reset_at) {
            metrics::gauge!("github_rate_limit_remaining").set(remaining as f64);
            *self.latest.write().await = Some(Observation {
                remaining,
                reset_at,
            });
        }
    }

    /// Record a hard 429: the provider told us exactly when to come back
    pub async fn observe_throttled(&self, reset_at: DateTime<Utc>) {
        self.sentinel.set_wait_until(reset_at).await;
        *self.latest.write().await = Some(Observation {
            remaining: 0,
            reset_at,
        });
    }
}

/// Parse the `x-ratelimit-remaining` / `x-ratelimit-reset` header pair
pub fn parse_rate_headers(headers: &reqwest::header::HeaderMap) -> (Option<i64>, Option<DateTime<Utc>>) {
    let remaining = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let reset_at = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|epoch| DateTime::from_timestamp(epoch, 0));
    (remaining, reset_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn gate(reserve: u32) -> (RateLimitGate, Arc<InMemorySentinel>) {
        let sentinel = Arc::new(InMemorySentinel::new());
        (RateLimitGate::new(reserve, sentinel.clone()), sentinel)
    }

    #[tokio::test]
    async fn test_fresh_gate_allows_calls() {
        let (gate, _) = gate(10);
        assert!(gate.check(Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_reserve_breach_blocks_and_sets_sentinel() {
        let (gate, sentinel) = gate(10);
        let now = Utc::now();
        let reset = now + Duration::minutes(10);

        gate.observe(Some(5), Some(reset)).await;

        let result = gate.check(now).await;
        assert!(matches!(result, Err(Error::RateLimited { .. })));
        assert_eq!(sentinel.wait_until().await, Some(reset));

        // invariant 7: while blocked, every check refuses
        assert!(gate.check(now + Duration::minutes(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_window_reset_clears_sentinel() {
        let (gate, sentinel) = gate(10);
        let now = Utc::now();
        let reset = now + Duration::minutes(10);

        gate.observe(Some(2), Some(reset)).await;
        assert!(gate.check(now).await.is_err());

        // after the reset instant the sentinel clears and calls resume
        assert!(gate.check(reset + Duration::seconds(1)).await.is_ok());
        assert_eq!(sentinel.wait_until().await, None);
    }

    #[tokio::test]
    async fn test_remaining_above_reserve_allows() {
        let (gate, _) = gate(10);
        let now = Utc::now();
        gate.observe(Some(11), Some(now + Duration::minutes(10))).await;
        assert!(gate.check(now).await.is_ok());
    }

    #[tokio::test]
    async fn test_throttle_observation_blocks_immediately() {
        let (gate, _) = gate(10);
        let now = Utc::now();
        gate.observe_throttled(now + Duration::seconds(30)).await;
        assert!(gate.check(now).await.is_err());
    }

    #[test]
    fn test_header_parsing() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-ratelimit-remaining", "42".parse().unwrap());
        headers.insert("x-ratelimit-reset", "1700000000".parse().unwrap());

        let (remaining, reset) = parse_rate_headers(&headers);
        assert_eq!(remaining, Some(42));
        assert_eq!(reset.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_header_parsing_tolerates_absence() {
        let headers = reqwest::header::HeaderMap::new();
        let (remaining, reset) = parse_rate_headers(&headers);
        assert_eq!(remaining, None);
        assert_eq!(reset, None);
    }
}
