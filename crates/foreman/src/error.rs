//! Error classes of the reconciliation engine.

use foreman_backends_core::BackendError;

/// Raised when a reconciliation step cannot proceed.
#[derive(Debug, thiserror::Error)]
pub enum OperateError {
    /// The soft per-call deadline fired; the workflow is requeued.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
    /// A parallelism limit refused execution; not an error for the workflow.
    #[error("parallelism limit reached")]
    ParallelismReached,
    /// A template outlived its declared timeout.
    #[error("{0}")]
    Timeout(String),
    /// Non-retryable policy violation; the node or workflow fails.
    #[error("{0}")]
    Forbidden(String),
    /// Requeue without advancing node state.
    #[error("transient: {0}")]
    Transient(String),
    /// Spec failed validation; the workflow fails.
    #[error("invalid spec: {0}")]
    Validation(String),
    /// A broken internal assumption, converted to a workflow Error at the
    /// driver top level instead of aborting the process.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl OperateError {
    pub fn is_transient(&self) -> bool {
        match self {
            OperateError::Transient(_) => true,
            OperateError::Backend(backend) => backend.is_transient(),
            _ => false,
        }
    }
}

/// Classifies a failure message as transient: network flakes, timeouts,
/// throttling, quota pressure, and optimistic-concurrency conflicts.
pub fn message_is_transient(message: &str) -> bool {
    const MARKERS: &[&str] = &[
        "connection refused",
        "connection reset",
        "connection timed out",
        "i/o timeout",
        "timed out",
        "timeout",
        "too many requests",
        "429",
        "502",
        "503",
        "504",
        "service unavailable",
        "exceeded quota",
        "conflict",
        "transient",
    ];
    let lowered = message.to_ascii_lowercase();
    MARKERS.iter().any(|marker| lowered.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_conflicts_count_as_transient() {
        let err = OperateError::Backend(BackendError::Conflict("stale".to_string()));
        assert!(err.is_transient());
        assert!(!OperateError::Timeout("t".to_string()).is_transient());
    }

    #[test]
    fn message_classification_matches_known_flakes() {
        assert!(message_is_transient("dial tcp: connection refused"));
        assert!(message_is_transient("Operation cannot be fulfilled: Conflict"));
        assert!(message_is_transient("429 Too Many Requests"));
        assert!(!message_is_transient("exit status 1"));
    }
}
