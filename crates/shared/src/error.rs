//! Error types for the application
//!
//! One taxonomy shared by the gateway, workers and the provider adapter.
//! Retry decisions are centralized in [`Error::is_retryable`].

use thiserror::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types
#[derive(Debug, Error)]
pub enum Error {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis connection or operation error
    #[error("Queue backend error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors (bad request body, bad headers)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Signature or token verification failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Upstream 403 that is not a rate limit
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Provider rate limit exhausted; retry after the embedded reset
    #[error("Rate limited until {reset_at}")]
    RateLimited {
        reset_at: chrono::DateTime<chrono::Utc>,
    },

    /// Transient network failure (5xx, timeout, connection reset)
    #[error("Network error: {0}")]
    Network(String),

    /// Short-lived artifact URL expired before the download completed
    #[error("Artifact URL expired: {0}")]
    ArtifactExpired(String),

    /// Artifact exceeds the configured size cap
    #[error("Artifact too large: {size_bytes} bytes (cap {max_bytes})")]
    ArtifactTooLarge { size_bytes: u64, max_bytes: u64 },

    /// Malformed test report
    #[error("Parse error: {0}")]
    Parse(String),

    /// Circuit breaker is open for the upstream target
    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    /// Queue operation error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a NotFound error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a Validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a Config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an Authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a Permission error
    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }

    /// Create a Network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a Parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a Queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create an Internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    ///
    /// Transient failures (network, rate limit, expired URLs, DB/queue
    /// hiccups) are retryable. Authentication, permission, validation and
    /// parse failures are permanent and must not be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::Redis(_)
                | Error::RateLimited { .. }
                | Error::Network(_)
                | Error::ArtifactExpired(_)
                | Error::Queue(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::network("connection reset").is_retryable());
        assert!(Error::queue("redis gone").is_retryable());
        assert!(Error::ArtifactExpired("url lapsed".into()).is_retryable());
        assert!(Error::RateLimited {
            reset_at: chrono::Utc::now()
        }
        .is_retryable());

        assert!(!Error::authentication("bad signature").is_retryable());
        assert!(!Error::permission("403").is_retryable());
        assert!(!Error::validation("missing header").is_retryable());
        assert!(!Error::parse("malformed xml").is_retryable());
        assert!(!Error::CircuitOpen("api.github.com".into()).is_retryable());
        assert!(!Error::ArtifactTooLarge {
            size_bytes: 200,
            max_bytes: 100
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::not_found("TestCase", "tc-42");
        assert_eq!(err.to_string(), "TestCase not found: tc-42");

        let err = Error::ArtifactTooLarge {
            size_bytes: 200,
            max_bytes: 100,
        };
        assert_eq!(err.to_string(), "Artifact too large: 200 bytes (cap 100)");
    }
}
