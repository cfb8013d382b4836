//! Store errors with retry classification.
//!
//! The engine's facade uses [`StoreError::is_retryable`] to decide whether to
//! re-issue a persistence call under its bounded back-off policy. Condition
//! failures are not retried here — they flow into the facade's
//! reload-and-reapply loop instead.

/// Error returned by [`super::ExecutionStore`] implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record for the requested execution or branch.
    NotFound(String),

    /// The optimistic-concurrency condition on an update did not match the
    /// stored record. The caller must reload and reapply.
    ConditionFailed,

    /// A create collided with an existing current run for the workflow id.
    /// Carries the incumbent so the start path can answer idempotent retries.
    CurrentRunConflict {
        workflow_id: String,
        run_id: String,
        start_request_id: String,
    },

    /// Transient storage failure (connection loss, timeout, overload).
    Unavailable { operation: String, message: String },
}

impl StoreError {
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Only transient failures are retryable; conflicts and missing records
    /// will not change on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(msg) => write!(f, "not found: {msg}"),
            StoreError::ConditionFailed => write!(f, "condition failed"),
            StoreError::CurrentRunConflict {
                workflow_id, run_id, ..
            } => write!(f, "current run conflict: {workflow_id} (run {run_id})"),
            StoreError::Unavailable { operation, message } => {
                write!(f, "{operation}: {message}")
            }
        }
    }
}

impl std::error::Error for StoreError {}
