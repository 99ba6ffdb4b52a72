//! Error types for byte bodies and their consumers.

use std::sync::Arc;

use thiserror::Error;

/// Boxed error accepted from transports and returned by consumers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared form of [`BoxError`], cloneable so one failure can reach many readers.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for body operations.
pub type BodyResult<T> = Result<T, BodyError>;

/// Errors surfaced by byte bodies.
///
/// `BodyError` is `Clone`: a single upstream failure is replayed to every
/// reader attached to the same shared buffer.
#[derive(Debug, Clone, Error)]
pub enum BodyError {
    /// The transport failed. Terminal for every attached reader.
    #[error("upstream failed: {0}")]
    Upstream(SharedError),

    /// This consumer's own processing failed. Sibling readers are unaffected.
    #[error("consumer failed: {0}")]
    Consumer(SharedError),

    /// Materialization exceeded the configured maximum size.
    #[error("body too large: {received} bytes exceeds the limit of {limit} bytes")]
    LimitExceeded { limit: u64, received: u64 },

    /// The body was abandoned before it reached a terminal state.
    #[error("body cancelled before completion")]
    Cancelled,

    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl BodyError {
    /// Wrap a transport failure.
    pub fn upstream(cause: impl Into<BoxError>) -> Self {
        Self::Upstream(Arc::from(cause.into()))
    }

    /// Wrap a consumer failure.
    pub fn consumer(cause: impl Into<BoxError>) -> Self {
        Self::Consumer(Arc::from(cause.into()))
    }

    /// Returns `true` for programmer-misuse errors.
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    /// Returns `true` if a size limit was exceeded.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, Self::LimitExceeded { .. })
    }

    /// Returns the misuse kind, if this is a usage error.
    pub fn usage(&self) -> Option<UsageError> {
        match self {
            Self::Usage(usage) => Some(*usage),
            _ => None,
        }
    }
}

/// Contract violations by a collaborator of the engine.
///
/// These indicate a bug in the caller and are returned from the call that
/// violated the contract instead of travelling down a consumer's error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("body already closed")]
    Closed,

    #[error("body already consumed")]
    AlreadyConsumed,

    #[error("late split: data the new reader needs was already released")]
    LateSplit,

    #[error("data pushed after the body terminated")]
    PushAfterTerminal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_error_from_str() {
        let err = BodyError::upstream("connection reset");
        assert_eq!(err.to_string(), "upstream failed: connection reset");
        assert!(!err.is_usage());
    }

    #[test]
    fn upstream_error_is_shared_between_clones() {
        let err = BodyError::upstream("boom");
        let clone = err.clone();
        match (&err, &clone) {
            (BodyError::Upstream(a), BodyError::Upstream(b)) => assert!(Arc::ptr_eq(a, b)),
            other => panic!("unexpected variants: {other:?}"),
        }
    }

    #[test]
    fn usage_error_converts_and_displays() {
        let err: BodyError = UsageError::LateSplit.into();
        assert!(err.is_usage());
        assert_eq!(err.usage(), Some(UsageError::LateSplit));
        assert!(err.to_string().starts_with("late split"));
    }

    #[test]
    fn limit_exceeded_message() {
        let err = BodyError::LimitExceeded {
            limit: 10,
            received: 11,
        };
        assert!(err.is_limit_exceeded());
        assert_eq!(
            err.to_string(),
            "body too large: 11 bytes exceeds the limit of 10 bytes"
        );
    }
}
