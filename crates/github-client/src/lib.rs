//! GitHub adapter for FlakeGuard
//!
//! Authenticated access to the Actions API: installation tokens, artifact
//! listing and streamed download, run/job reads and failed-job reruns.
//! Outbound calls pass through a process-wide rate-limit gate and a
//! per-target circuit breaker; transient failures retry with jittered
//! exponential backoff.

pub mod auth;
pub mod breaker;
pub mod client;
pub mod rate_limit;

pub use auth::AppAuth;
pub use breaker::{CircuitBreaker, CircuitState};
pub use client::{Artifact, GithubClient, JobInfo, WorkflowRunInfo};
pub use rate_limit::{InMemorySentinel, RateLimitGate, RateLimitSentinel};
