//! Circuit breaker for upstream targets
//!
//! # State Machine
//!
//! ```text
//! CLOSED (normal operation)
//!   ↓ (failure_threshold failures inside failure_time_window)
//! OPEN (calls rejected immediately)
//!   ↓ (after open_timeout)
//! HALF-OPEN (up to half_open_max_calls probes)
//!   ↓ (success_threshold successes) → CLOSED
//!   ↓ (any failure) → OPEN
//! ```
//!
//! State is per upstream target and process-wide; the clock is an explicit
//! argument so the transitions are testable without sleeping.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use shared::config::BreakerConfig;
use shared::{Error, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - calls flow through
    Closed,
    /// Calls rejected immediately (fail-fast)
    Open,
    /// Recovery test mode - limited probes allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
struct TargetState {
    state: CircuitState,
    failure_count: u32,
    window_started_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    half_open_calls: u32,
    half_open_successes: u32,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            window_started_at: None,
            opened_at: None,
            half_open_calls: 0,
            half_open_successes: 0,
        }
    }
}

/// Per-target circuit breaker
pub struct CircuitBreaker {
    config: BreakerConfig,
    targets: DashMap<String, TargetState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            targets: DashMap::new(),
        }
    }

    /// Gate an outbound call. While half-open, admits at most
    /// `half_open_max_calls` concurrent probes.
    pub fn allow(&self, target: &str, now: DateTime<Utc>) -> Result<()> {
        let mut entry = self.targets.entry(target.to_string()).or_default();

        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = entry.opened_at.unwrap_or(now);
                if now - opened_at >= Duration::seconds(self.config.open_timeout_secs as i64) {
                    self.transition(&mut entry, target, CircuitState::HalfOpen);
                    entry.half_open_calls = 1;
                    entry.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(target.to_string()))
                }
            }
            CircuitState::HalfOpen => {
                if entry.half_open_calls < self.config.half_open_max_calls {
                    entry.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(target.to_string()))
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self, target: &str, _now: DateTime<Utc>) {
        let mut entry = self.targets.entry(target.to_string()).or_default();

        match entry.state {
            CircuitState::Closed => {
                entry.failure_count = 0;
                entry.window_started_at = None;
            }
            CircuitState::HalfOpen => {
                entry.half_open_successes += 1;
                if entry.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut entry, target, CircuitState::Closed);
                    entry.failure_count = 0;
                    entry.window_started_at = None;
                    entry.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, target: &str, now: DateTime<Utc>) {
        let mut entry = self.targets.entry(target.to_string()).or_default();

        match entry.state {
            CircuitState::Closed => {
                let window = Duration::seconds(self.config.failure_time_window_secs as i64);
                // failures outside the window restart the count
                match entry.window_started_at {
                    Some(start) if now - start <= window => entry.failure_count += 1,
                    _ => {
                        entry.window_started_at = Some(now);
                        entry.failure_count = 1;
                    }
                }

                if entry.failure_count >= self.config.failure_threshold {
                    self.transition(&mut entry, target, CircuitState::Open);
                    entry.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                // one failed probe reopens the circuit
                self.transition(&mut entry, target, CircuitState::Open);
                entry.opened_at = Some(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state for a target
    pub fn state(&self, target: &str) -> CircuitState {
        self.targets
            .get(target)
            .map(|entry| entry.state)
            .unwrap_or(CircuitState::Closed)
    }

    fn transition(&self, entry: &mut TargetState, target: &str, to: CircuitState) {
        tracing::info!(
            target = target,
            from = %entry.state,
            to = %to,
            "Circuit breaker transition"
        );
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "target" => target.to_string(),
            "to" => to.to_string()
        )
        .increment(1);
        entry.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            failure_time_window_secs: 60,
            open_timeout_secs: 30,
            half_open_max_calls: 2,
            success_threshold: 2,
        })
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let cb = breaker();
        let now = Utc::now();

        cb.record_failure("api", now);
        cb.record_failure("api", now);
        assert_eq!(cb.state("api"), CircuitState::Closed);

        cb.record_failure("api", now);
        assert_eq!(cb.state("api"), CircuitState::Open);
        assert!(cb.allow("api", now).is_err());
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let cb = breaker();
        let now = Utc::now();

        cb.record_failure("api", now);
        cb.record_failure("api", now + Duration::seconds(10));
        // window restarts here
        cb.record_failure("api", now + Duration::seconds(120));
        assert_eq!(cb.state("api"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout_then_closes_on_probes() {
        let cb = breaker();
        let now = Utc::now();

        for _ in 0..3 {
            cb.record_failure("api", now);
        }
        assert_eq!(cb.state("api"), CircuitState::Open);

        let later = now + Duration::seconds(31);
        assert!(cb.allow("api", later).is_ok());
        assert_eq!(cb.state("api"), CircuitState::HalfOpen);

        cb.record_success("api", later);
        assert_eq!(cb.state("api"), CircuitState::HalfOpen);
        cb.record_success("api", later);
        assert_eq!(cb.state("api"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_budget() {
        let cb = breaker();
        let now = Utc::now();

        for _ in 0..3 {
            cb.record_failure("api", now);
        }
        let later = now + Duration::seconds(31);
        assert!(cb.allow("api", later).is_ok()); // transition consumes probe 1
        assert!(cb.allow("api", later).is_ok()); // probe 2
        assert!(cb.allow("api", later).is_err()); // budget spent
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker();
        let now = Utc::now();

        for _ in 0..3 {
            cb.record_failure("api", now);
        }
        let later = now + Duration::seconds(31);
        assert!(cb.allow("api", later).is_ok());

        cb.record_failure("api", later);
        assert_eq!(cb.state("api"), CircuitState::Open);
        assert!(cb.allow("api", later + Duration::seconds(1)).is_err());
    }

    #[test]
    fn test_targets_are_independent() {
        let cb = breaker();
        let now = Utc::now();

        for _ in 0..3 {
            cb.record_failure("api", now);
        }
        assert_eq!(cb.state("api"), CircuitState::Open);
        assert_eq!(cb.state("uploads"), CircuitState::Closed);
        assert!(cb.allow("uploads", now).is_ok());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker();
        let now = Utc::now();

        cb.record_failure("api", now);
        cb.record_failure("api", now);
        cb.record_success("api", now);
        cb.record_failure("api", now);
        cb.record_failure("api", now);
        assert_eq!(cb.state("api"), CircuitState::Closed);
    }
}
