//! # Chronik: per-shard history engine for durable workflow orchestration
//!
//! Chronik owns the authoritative state of running workflow executions for one
//! shard. A workflow execution is a long-lived, event-sourced state machine
//! identified by a `(namespace, workflow-id, run-id)` triple; its history is an
//! append-only log of events. Worker processes poll decision tasks and activity
//! tasks, execute user code, and report outcomes; the engine ingests those
//! reports, validates them against mutable state, emits new history events,
//! schedules follow-on work, and persists the result atomically.
//!
//! ## Shape of the crate
//!
//! - [`engine::HistoryEngine`] — the facade. Every mutating RPC flows through
//!   its load → mutate → persist pipeline with bounded optimistic-concurrency
//!   retry.
//! - [`state::MutableState`] — the only writer of execution state. Applies
//!   events, maintains invariants, emits transfer/timer tasks.
//! - [`cache::HistoryCache`] — per-shard map from execution key to context with
//!   a single-holder lease serializing mutations per execution.
//! - [`notifier::HistoryEventNotifier`] — pub/sub of "new event appeared"
//!   notifications backing the long-poll read path.
//! - [`query::QueryRegistry`] — per-execution buffer of pending consistent
//!   queries with termination states.
//! - [`providers::ExecutionStore`] — the transactional persistence contract
//!   (external collaborator; an in-memory implementation backs the tests).
//! - [`matching::MatchingClient`] — the task-dispatch contract (external
//!   collaborator).
//!
//! ## Minimal usage
//!
//! ```rust,no_run
//! use chronik::engine::HistoryEngine;
//! use chronik::matching::RecordingMatchingClient;
//! use chronik::namespace::StaticNamespaceRegistry;
//! use chronik::providers::in_memory::InMemoryExecutionStore;
//! use chronik::{EngineConfig, StartWorkflowRequest};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = HistoryEngine::new(
//!     1,
//!     Arc::new(EngineConfig::default()),
//!     Arc::new(InMemoryExecutionStore::default()),
//!     Arc::new(RecordingMatchingClient::default()),
//!     Arc::new(StaticNamespaceRegistry::default()),
//! );
//!
//! let run_id = engine
//!     .start_workflow_execution(StartWorkflowRequest {
//!         namespace_id: "ns".into(),
//!         workflow_id: "order-42".into(),
//!         workflow_type: "ProcessOrder".into(),
//!         task_list: "orders".into(),
//!         input: "{}".into(),
//!         execution_timeout_secs: 300,
//!         task_timeout_secs: 10,
//!         identity: "starter".into(),
//!         request_id: "req-1".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! # let _ = run_id;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod matching;
pub mod namespace;
pub mod notifier;
pub mod providers;
pub mod query;
pub mod state;
pub mod token;

pub use config::EngineConfig;
pub use engine::StartWorkflowRequest;
pub use error::EngineError;
pub use token::{TaskToken, TokenRouting};

/// Sentinel for "no event": used for absent started ids, absent schedule ids,
/// and the activity-id-only token routing path.
pub const EMPTY_EVENT_ID: u64 = 0;

/// The first event of every run is assigned this id.
pub const FIRST_EVENT_ID: u64 = 1;

/// Identity of one workflow run within a shard.
///
/// `workflow_id` is user-supplied; `run_id` is a generated UUID. Two runs of
/// the same workflow id (e.g. across ContinueAsNew) have distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

impl ExecutionKey {
    pub fn new(
        namespace_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

impl std::fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace_id, self.workflow_id, self.run_id)
    }
}

/// Lifecycle state of the mutable-state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Created,
    Running,
    Completed,
    /// A run that lost currency (e.g. superseded during conflict resolution)
    /// but whose record has not yet been reclaimed.
    Zombie,
}

/// Close status of the execution. `Running` until a terminal event lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Canceled,
    Terminated,
    ContinuedAsNew,
    TimedOut,
}

impl WorkflowStatus {
    /// Terminal statuses are absorbing: any later mutation fails not-found.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

/// What happens to an open child workflow when its parent closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentClosePolicy {
    Abandon,
    Terminate,
    RequestCancel,
}

/// Retry policy attached to a scheduled activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval_secs: i32,
    pub backoff_coefficient: f64,
    pub max_interval_secs: i32,
    /// 0 means unlimited attempts (bounded only by expiration).
    pub max_attempts: i32,
    /// 0 means no expiration.
    pub expiration_secs: i32,
    pub non_retryable_reasons: Vec<String>,
}

impl RetryPolicy {
    /// Back-off before attempt `attempt + 1`, in seconds.
    pub fn backoff_interval_secs(&self, attempt: i32) -> i64 {
        let raw = (self.initial_interval_secs as f64)
            * self.backoff_coefficient.powi(attempt.max(0));
        let capped = if self.max_interval_secs > 0 {
            raw.min(self.max_interval_secs as f64)
        } else {
            raw
        };
        capped.ceil() as i64
    }
}

/// One history event: a monotonically-assigned position in the run's log plus
/// the event payload. Scheduling and completion events are linked through the
/// schedule/started ids carried inside [`EventKind`] payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Sequential position in history, assigned by the mutable-state builder.
    pub event_id: u64,
    /// Milliseconds since Unix epoch at event creation.
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl HistoryEvent {
    pub fn new(event_id: u64, kind: EventKind) -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        Self {
            event_id,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            kind,
        }
    }

    /// Short name of the event type for logs and metrics.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

/// Event payloads. Inputs, results, and details are opaque strings; the engine
/// never interprets user payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    WorkflowExecutionStarted {
        workflow_type: String,
        task_list: String,
        input: String,
        execution_timeout_secs: i32,
        task_timeout_secs: i32,
        identity: String,
        /// Set when this run continues a prior run (ContinueAsNew).
        continued_from_run_id: Option<String>,
        first_decision_backoff_secs: i32,
    },
    WorkflowExecutionCompleted {
        result: String,
        decision_completed_event_id: u64,
    },
    WorkflowExecutionFailed {
        reason: String,
        details: String,
        decision_completed_event_id: u64,
    },
    WorkflowExecutionCanceled {
        details: String,
        decision_completed_event_id: u64,
    },
    WorkflowExecutionTerminated {
        reason: String,
        details: String,
        identity: String,
    },
    WorkflowExecutionContinuedAsNew {
        new_run_id: String,
        workflow_type: String,
        task_list: String,
        input: String,
        execution_timeout_secs: i32,
        task_timeout_secs: i32,
        decision_completed_event_id: u64,
    },
    WorkflowExecutionTimedOut,
    WorkflowExecutionCancelRequested {
        cause: String,
        identity: String,
    },
    WorkflowExecutionSignaled {
        signal_name: String,
        input: String,
        identity: String,
    },

    DecisionTaskScheduled {
        task_list: String,
        start_to_close_timeout_secs: i32,
        attempt: i32,
    },
    DecisionTaskStarted {
        scheduled_event_id: u64,
        identity: String,
        request_id: String,
    },
    DecisionTaskCompleted {
        scheduled_event_id: u64,
        started_event_id: u64,
        identity: String,
        binary_checksum: String,
    },
    DecisionTaskFailed {
        scheduled_event_id: u64,
        started_event_id: u64,
        cause: DecisionFailCause,
        details: String,
        identity: String,
    },
    DecisionTaskTimedOut {
        scheduled_event_id: u64,
        started_event_id: u64,
    },

    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
        task_list: String,
        input: String,
        schedule_to_close_timeout_secs: i32,
        schedule_to_start_timeout_secs: i32,
        start_to_close_timeout_secs: i32,
        heartbeat_timeout_secs: i32,
        decision_completed_event_id: u64,
        retry_policy: Option<RetryPolicy>,
    },
    ActivityTaskStarted {
        scheduled_event_id: u64,
        identity: String,
        request_id: String,
        attempt: i32,
    },
    ActivityTaskCompleted {
        scheduled_event_id: u64,
        started_event_id: u64,
        result: String,
        identity: String,
    },
    ActivityTaskFailed {
        scheduled_event_id: u64,
        started_event_id: u64,
        reason: String,
        details: String,
        identity: String,
    },
    ActivityTaskCancelRequested {
        decision_completed_event_id: u64,
        activity_id: String,
    },
    ActivityTaskCanceled {
        scheduled_event_id: u64,
        started_event_id: u64,
        latest_cancel_requested_event_id: u64,
        details: String,
        identity: String,
    },

    TimerStarted {
        timer_id: String,
        start_to_fire_timeout_secs: i64,
        decision_completed_event_id: u64,
    },
    TimerFired {
        timer_id: String,
        started_event_id: u64,
    },
    TimerCanceled {
        timer_id: String,
        started_event_id: u64,
        decision_completed_event_id: u64,
        identity: String,
    },

    MarkerRecorded {
        marker_name: String,
        details: String,
        decision_completed_event_id: u64,
    },
    UpsertWorkflowSearchAttributes {
        search_attributes: HashMap<String, String>,
        decision_completed_event_id: u64,
    },

    SignalExternalWorkflowExecutionInitiated {
        decision_completed_event_id: u64,
        namespace: String,
        workflow_id: String,
        run_id: String,
        signal_name: String,
        input: String,
        control: String,
    },
    ExternalWorkflowExecutionSignaled {
        initiated_event_id: u64,
        namespace: String,
        workflow_id: String,
        run_id: String,
        control: String,
    },
    SignalExternalWorkflowExecutionFailed {
        initiated_event_id: u64,
        namespace: String,
        workflow_id: String,
        run_id: String,
        control: String,
        cause: String,
    },
    RequestCancelExternalWorkflowExecutionInitiated {
        decision_completed_event_id: u64,
        namespace: String,
        workflow_id: String,
        run_id: String,
        control: String,
    },
    ExternalWorkflowExecutionCancelRequested {
        initiated_event_id: u64,
        namespace: String,
        workflow_id: String,
        run_id: String,
    },
    RequestCancelExternalWorkflowExecutionFailed {
        initiated_event_id: u64,
        namespace: String,
        workflow_id: String,
        run_id: String,
        cause: String,
    },

    StartChildWorkflowExecutionInitiated {
        decision_completed_event_id: u64,
        namespace: String,
        workflow_id: String,
        workflow_type: String,
        task_list: String,
        input: String,
        parent_close_policy: ParentClosePolicy,
        control: String,
    },
    ChildWorkflowExecutionStarted {
        initiated_event_id: u64,
        namespace: String,
        workflow_id: String,
        run_id: String,
        workflow_type: String,
    },
    ChildWorkflowExecutionCompleted {
        initiated_event_id: u64,
        started_event_id: u64,
        result: String,
    },
    ChildWorkflowExecutionFailed {
        initiated_event_id: u64,
        started_event_id: u64,
        reason: String,
        details: String,
    },
    StartChildWorkflowExecutionFailed {
        initiated_event_id: u64,
        workflow_id: String,
        workflow_type: String,
        cause: String,
    },
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::WorkflowExecutionStarted { .. } => "WorkflowExecutionStarted",
            EventKind::WorkflowExecutionCompleted { .. } => "WorkflowExecutionCompleted",
            EventKind::WorkflowExecutionFailed { .. } => "WorkflowExecutionFailed",
            EventKind::WorkflowExecutionCanceled { .. } => "WorkflowExecutionCanceled",
            EventKind::WorkflowExecutionTerminated { .. } => "WorkflowExecutionTerminated",
            EventKind::WorkflowExecutionContinuedAsNew { .. } => "WorkflowExecutionContinuedAsNew",
            EventKind::WorkflowExecutionTimedOut => "WorkflowExecutionTimedOut",
            EventKind::WorkflowExecutionCancelRequested { .. } => "WorkflowExecutionCancelRequested",
            EventKind::WorkflowExecutionSignaled { .. } => "WorkflowExecutionSignaled",
            EventKind::DecisionTaskScheduled { .. } => "DecisionTaskScheduled",
            EventKind::DecisionTaskStarted { .. } => "DecisionTaskStarted",
            EventKind::DecisionTaskCompleted { .. } => "DecisionTaskCompleted",
            EventKind::DecisionTaskFailed { .. } => "DecisionTaskFailed",
            EventKind::DecisionTaskTimedOut { .. } => "DecisionTaskTimedOut",
            EventKind::ActivityTaskScheduled { .. } => "ActivityTaskScheduled",
            EventKind::ActivityTaskStarted { .. } => "ActivityTaskStarted",
            EventKind::ActivityTaskCompleted { .. } => "ActivityTaskCompleted",
            EventKind::ActivityTaskFailed { .. } => "ActivityTaskFailed",
            EventKind::ActivityTaskCancelRequested { .. } => "ActivityTaskCancelRequested",
            EventKind::ActivityTaskCanceled { .. } => "ActivityTaskCanceled",
            EventKind::TimerStarted { .. } => "TimerStarted",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::TimerCanceled { .. } => "TimerCanceled",
            EventKind::MarkerRecorded { .. } => "MarkerRecorded",
            EventKind::UpsertWorkflowSearchAttributes { .. } => "UpsertWorkflowSearchAttributes",
            EventKind::SignalExternalWorkflowExecutionInitiated { .. } => {
                "SignalExternalWorkflowExecutionInitiated"
            }
            EventKind::ExternalWorkflowExecutionSignaled { .. } => {
                "ExternalWorkflowExecutionSignaled"
            }
            EventKind::SignalExternalWorkflowExecutionFailed { .. } => {
                "SignalExternalWorkflowExecutionFailed"
            }
            EventKind::RequestCancelExternalWorkflowExecutionInitiated { .. } => {
                "RequestCancelExternalWorkflowExecutionInitiated"
            }
            EventKind::ExternalWorkflowExecutionCancelRequested { .. } => {
                "ExternalWorkflowExecutionCancelRequested"
            }
            EventKind::RequestCancelExternalWorkflowExecutionFailed { .. } => {
                "RequestCancelExternalWorkflowExecutionFailed"
            }
            EventKind::StartChildWorkflowExecutionInitiated { .. } => {
                "StartChildWorkflowExecutionInitiated"
            }
            EventKind::ChildWorkflowExecutionStarted { .. } => "ChildWorkflowExecutionStarted",
            EventKind::ChildWorkflowExecutionCompleted { .. } => "ChildWorkflowExecutionCompleted",
            EventKind::ChildWorkflowExecutionFailed { .. } => "ChildWorkflowExecutionFailed",
            EventKind::StartChildWorkflowExecutionFailed { .. } => {
                "StartChildWorkflowExecutionFailed"
            }
        }
    }

    /// Events that arrive from outside the decision path get buffered while a
    /// decision task is started, and flushed when it closes.
    pub fn is_bufferable(&self) -> bool {
        matches!(
            self,
            EventKind::WorkflowExecutionSignaled { .. }
                | EventKind::WorkflowExecutionCancelRequested { .. }
                | EventKind::ActivityTaskCompleted { .. }
                | EventKind::ActivityTaskFailed { .. }
                | EventKind::ActivityTaskCanceled { .. }
                | EventKind::TimerFired { .. }
                | EventKind::ExternalWorkflowExecutionSignaled { .. }
                | EventKind::SignalExternalWorkflowExecutionFailed { .. }
                | EventKind::ExternalWorkflowExecutionCancelRequested { .. }
                | EventKind::RequestCancelExternalWorkflowExecutionFailed { .. }
                | EventKind::ChildWorkflowExecutionStarted { .. }
                | EventKind::ChildWorkflowExecutionCompleted { .. }
                | EventKind::ChildWorkflowExecutionFailed { .. }
                | EventKind::StartChildWorkflowExecutionFailed { .. }
        )
    }
}

/// Why a decision task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionFailCause {
    UnhandledDecision,
    BadScheduleActivityAttributes,
    BadStartTimerAttributes,
    BadCancelTimerAttributes,
    BadRequestCancelActivityAttributes,
    BadCompleteWorkflowExecutionAttributes,
    BadFailWorkflowExecutionAttributes,
    BadCancelWorkflowExecutionAttributes,
    BadContinueAsNewAttributes,
    BadSignalWorkflowExecutionAttributes,
    BadRequestCancelExternalWorkflowExecutionAttributes,
    BadStartChildExecutionAttributes,
    BadSearchAttributes,
    BadRecordMarkerAttributes,
    BadBinary,
    ResetWorkflow,
    WorkflowWorkerUnhandledFailure,
}

/// One item inside a completed decision's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    ScheduleActivityTask(ScheduleActivityTaskAttributes),
    RequestCancelActivityTask {
        activity_id: String,
    },
    StartTimer {
        timer_id: String,
        start_to_fire_timeout_secs: i64,
    },
    CancelTimer {
        timer_id: String,
    },
    CompleteWorkflowExecution {
        result: String,
    },
    FailWorkflowExecution {
        reason: String,
        details: String,
    },
    CancelWorkflowExecution {
        details: String,
    },
    ContinueAsNewWorkflowExecution(ContinueAsNewWorkflowAttributes),
    SignalExternalWorkflowExecution(SignalExternalWorkflowAttributes),
    RequestCancelExternalWorkflowExecution {
        namespace: String,
        workflow_id: String,
        run_id: String,
        control: String,
    },
    StartChildWorkflowExecution(StartChildWorkflowAttributes),
    UpsertWorkflowSearchAttributes {
        search_attributes: HashMap<String, String>,
    },
    RecordMarker {
        marker_name: String,
        details: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleActivityTaskAttributes {
    pub activity_id: String,
    pub activity_type: String,
    pub task_list: String,
    pub input: String,
    pub schedule_to_close_timeout_secs: i32,
    pub schedule_to_start_timeout_secs: i32,
    pub start_to_close_timeout_secs: i32,
    pub heartbeat_timeout_secs: i32,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinueAsNewWorkflowAttributes {
    pub workflow_type: String,
    pub task_list: String,
    pub input: String,
    pub execution_timeout_secs: i32,
    pub task_timeout_secs: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalExternalWorkflowAttributes {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: String,
    pub signal_name: String,
    pub input: String,
    pub control: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartChildWorkflowAttributes {
    pub namespace: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_list: String,
    pub input: String,
    pub execution_timeout_secs: i32,
    pub task_timeout_secs: i32,
    pub parent_close_policy: ParentClosePolicy,
    pub control: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_absorbing() {
        assert!(!WorkflowStatus::Running.is_terminal());
        for status in [
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Canceled,
            WorkflowStatus::Terminated,
            WorkflowStatus::ContinuedAsNew,
            WorkflowStatus::TimedOut,
        ] {
            assert!(status.is_terminal(), "{status:?} must be terminal");
        }
    }

    #[test]
    fn event_serde_round_trip_preserves_tag() {
        let event = HistoryEvent::new(
            7,
            EventKind::TimerStarted {
                timer_id: "t1".into(),
                start_to_fire_timeout_secs: 30,
                decision_completed_event_id: 4,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"TimerStarted\""));
        let back: HistoryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn backoff_interval_grows_and_caps() {
        let policy = RetryPolicy {
            initial_interval_secs: 2,
            backoff_coefficient: 2.0,
            max_interval_secs: 10,
            max_attempts: 5,
            expiration_secs: 0,
            non_retryable_reasons: vec![],
        };
        assert_eq!(policy.backoff_interval_secs(0), 2);
        assert_eq!(policy.backoff_interval_secs(1), 4);
        assert_eq!(policy.backoff_interval_secs(2), 8);
        assert_eq!(policy.backoff_interval_secs(3), 10);
        assert_eq!(policy.backoff_interval_secs(10), 10);
    }
}
