//! RPC-facing error contract of the engine.
//!
//! Callers dispatch on [`ErrorKind`], not on variant names: the kind is the
//! stable contract (invalid-argument, not-found, already-exists, ...), the
//! variants carry enough detail for logs and for the handlers to make policy
//! decisions (e.g. a stale task token is `NotFound`, a full consistent-query
//! buffer is `ResourceExhausted`).

use crate::providers::StoreError;
use crate::state::StateError;

/// Stable classification of engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    WorkflowExecutionAlreadyCompleted,
    /// Internal: optimistic-concurrency conflict, retried by the facade.
    ConditionFailed,
    ServiceUnavailable,
    ResourceExhausted,
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidArgument(String),
    NotFound(String),
    /// A run with this workflow id is already open. Carries enough for the
    /// start path to answer idempotent retries without creating history.
    WorkflowExecutionAlreadyStarted {
        workflow_id: String,
        run_id: String,
        start_request_id: String,
    },
    /// The execution reached a terminal status; mutations are absorbed.
    WorkflowExecutionAlreadyCompleted,
    /// Internal marker surfaced only if the bounded retry loop is bypassed.
    ConditionFailed,
    /// Optimistic-concurrency retries exhausted.
    MaxAttemptsExceeded,
    ServiceUnavailable(String),
    ResourceExhausted(String),
    DeadlineExceeded,

    // Query-path errors. Distinct variants because callers branch on them.
    ConsistentQueryNotEnabled,
    ConsistentQueryBufferExceeded,
    QueryWorkflowBeforeFirstDecision,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidArgument(_)
            | EngineError::ConsistentQueryNotEnabled
            | EngineError::QueryWorkflowBeforeFirstDecision => ErrorKind::InvalidArgument,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::WorkflowExecutionAlreadyStarted { .. } => ErrorKind::AlreadyExists,
            EngineError::WorkflowExecutionAlreadyCompleted => {
                ErrorKind::WorkflowExecutionAlreadyCompleted
            }
            EngineError::ConditionFailed => ErrorKind::ConditionFailed,
            EngineError::MaxAttemptsExceeded
            | EngineError::ResourceExhausted(_)
            | EngineError::ConsistentQueryBufferExceeded => ErrorKind::ResourceExhausted,
            EngineError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            EngineError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
        }
    }

    /// Stale-task convenience: the worker holding the task should give up.
    pub fn stale_task(what: &str) -> Self {
        EngineError::NotFound(format!("{what} is no longer current"))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::NotFound(msg) => write!(f, "not found: {msg}"),
            EngineError::WorkflowExecutionAlreadyStarted {
                workflow_id, run_id, ..
            } => write!(
                f,
                "workflow execution already started: workflow_id={workflow_id} run_id={run_id}"
            ),
            EngineError::WorkflowExecutionAlreadyCompleted => {
                write!(f, "workflow execution already completed")
            }
            EngineError::ConditionFailed => write!(f, "persistence condition failed"),
            EngineError::MaxAttemptsExceeded => {
                write!(f, "maximum update attempts exceeded")
            }
            EngineError::ServiceUnavailable(msg) => write!(f, "service unavailable: {msg}"),
            EngineError::ResourceExhausted(msg) => write!(f, "resource exhausted: {msg}"),
            EngineError::DeadlineExceeded => write!(f, "deadline exceeded"),
            EngineError::ConsistentQueryNotEnabled => {
                write!(f, "consistent query is not enabled")
            }
            EngineError::ConsistentQueryBufferExceeded => {
                write!(f, "consistent query buffer is full")
            }
            EngineError::QueryWorkflowBeforeFirstDecision => {
                write!(f, "workflow has not completed its first decision task")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => EngineError::NotFound(msg),
            StoreError::ConditionFailed => EngineError::ConditionFailed,
            StoreError::CurrentRunConflict {
                workflow_id,
                run_id,
                start_request_id,
            } => EngineError::WorkflowExecutionAlreadyStarted {
                workflow_id,
                run_id,
                start_request_id,
            },
            StoreError::Unavailable { operation, message } => {
                EngineError::ServiceUnavailable(format!("{operation}: {message}"))
            }
        }
    }
}

impl From<StateError> for EngineError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::WorkflowTerminal => EngineError::WorkflowExecutionAlreadyCompleted,
            StateError::DecisionHeartbeatTimeout => EngineError::DeadlineExceeded,
            other => EngineError::InvalidArgument(other.to_string()),
        }
    }
}
