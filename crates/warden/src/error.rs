//! Engine error taxonomy.
//!
//! Every subsystem surfaces one of these kinds upward; the pipeline decides
//! the user-visible outcome. The split matters operationally: transient
//! failures are retried or degraded around, permanent ones fail fast,
//! validation failures reject the input, capacity failures are counted, and
//! invariant violations abort the current step without retry.

use thiserror::Error;

/// Typed errors surfaced by warden subsystems.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A backend that is expected to recover: DB pool, HTTP 5xx, SSH connect.
    #[error("transient: {0}")]
    Transient(String),

    /// A failure that retrying cannot fix: HTTP 4xx, unknown host, bad auth.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Malformed or unacceptable input: empty fingerprint, unsafe plan,
    /// bad tool parameters.
    #[error("validation: {0}")]
    Validation(String),

    /// A bounded resource ran out: queue full, lock contention.
    #[error("capacity: {0}")]
    Capacity(String),

    /// A broken internal invariant: mismatched parallel arrays, duplicate
    /// active handoffs. Logged at error, never retried.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    /// Whether the caller may retry the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::Permanent(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Transient(err.to_string())
            }
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status.is_client_error() {
                return Self::Permanent(err.to_string());
            }
        }
        Self::Transient(err.to_string())
    }
}

/// Convenience alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::Transient("pool empty".into()).is_retryable());
        assert!(!EngineError::Permanent("401".into()).is_retryable());
        assert!(!EngineError::Validation("empty fingerprint".into()).is_retryable());
        assert!(!EngineError::Invariant("two handoffs".into()).is_retryable());
    }
}
