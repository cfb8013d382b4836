//! Mutable state: the authoritative in-memory projection of one execution.
//!
//! `MutableState` is the only writer of execution state. Every operation
//! validates its preconditions against current state, allocates event ids,
//! stages events (or buffers them while a decision is in flight), updates the
//! pending collections, and enqueues the transfer/timer tasks the mutation
//! implies. `close_transaction` packages the staged work for persistence.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

use crate::providers::{TimerTask, TransferTask};
use crate::{
    ContinueAsNewWorkflowAttributes, DecisionFailCause, EventKind, ExecutionKey, HistoryEvent,
    ParentClosePolicy, RetryPolicy, ScheduleActivityTaskAttributes,
    SignalExternalWorkflowAttributes, StartChildWorkflowAttributes, WorkflowState, WorkflowStatus,
    EMPTY_EVENT_ID, FIRST_EVENT_ID,
};

mod history_builder;
pub use history_builder::HistoryBuilder;

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Typed precondition violations from the builder. The caller decides whether
/// to fail the decision, fail the task, or surface the error to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    WorkflowTerminal,
    AlreadyStarted,
    DecisionAlreadyPending,
    DecisionNotPending,
    DecisionNotStarted,
    /// Token refers to a decision that is no longer current.
    DecisionStale { expected: u64, got: u64 },
    DecisionHeartbeatTimeout,
    /// A sub-decision arrived after a terminal sub-decision in the same batch.
    UnhandledDecision,
    BadBinary { checksum: String },
    ActivityNotFound(String),
    ActivityNotStarted(String),
    ActivityAlreadyStarted(String),
    TimerNotFound(String),
    InitiatedEventNotFound(u64),
    BadScheduleActivityAttributes(String),
    BadStartTimerAttributes(String),
    BadCancelTimerAttributes(String),
    BadRequestCancelActivityAttributes(String),
    BadContinueAsNewAttributes(String),
    BadSignalExternalAttributes(String),
    BadRequestCancelExternalAttributes(String),
    BadStartChildAttributes(String),
    BadRecordMarkerAttributes(String),
}

impl StateError {
    /// Violations caused by bad sub-decision attributes fail the decision
    /// task (the workflow lives on); everything else surfaces to the caller.
    pub fn fail_cause(&self) -> Option<DecisionFailCause> {
        match self {
            StateError::BadScheduleActivityAttributes(_) => {
                Some(DecisionFailCause::BadScheduleActivityAttributes)
            }
            StateError::BadStartTimerAttributes(_) => {
                Some(DecisionFailCause::BadStartTimerAttributes)
            }
            StateError::BadCancelTimerAttributes(_) | StateError::TimerNotFound(_) => {
                Some(DecisionFailCause::BadCancelTimerAttributes)
            }
            StateError::BadRequestCancelActivityAttributes(_) => {
                Some(DecisionFailCause::BadRequestCancelActivityAttributes)
            }
            StateError::BadContinueAsNewAttributes(_) => {
                Some(DecisionFailCause::BadContinueAsNewAttributes)
            }
            StateError::BadSignalExternalAttributes(_) => {
                Some(DecisionFailCause::BadSignalWorkflowExecutionAttributes)
            }
            StateError::BadRequestCancelExternalAttributes(_) => {
                Some(DecisionFailCause::BadRequestCancelExternalWorkflowExecutionAttributes)
            }
            StateError::BadStartChildAttributes(_) => {
                Some(DecisionFailCause::BadStartChildExecutionAttributes)
            }
            StateError::BadRecordMarkerAttributes(_) => {
                Some(DecisionFailCause::BadRecordMarkerAttributes)
            }
            StateError::BadBinary { .. } => Some(DecisionFailCause::BadBinary),
            StateError::UnhandledDecision => Some(DecisionFailCause::UnhandledDecision),
            _ => None,
        }
    }
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::WorkflowTerminal => write!(f, "workflow execution is closed"),
            StateError::AlreadyStarted => write!(f, "workflow execution already started"),
            StateError::DecisionAlreadyPending => write!(f, "a decision task is already pending"),
            StateError::DecisionNotPending => write!(f, "no decision task is pending"),
            StateError::DecisionNotStarted => write!(f, "decision task has not started"),
            StateError::DecisionStale { expected, got } => {
                write!(f, "stale decision task: current={expected} token={got}")
            }
            StateError::DecisionHeartbeatTimeout => write!(f, "decision heartbeat budget exceeded"),
            StateError::UnhandledDecision => {
                write!(f, "sub-decision after a terminal sub-decision")
            }
            StateError::BadBinary { checksum } => {
                write!(f, "binary {checksum} is marked bad for this namespace")
            }
            StateError::ActivityNotFound(id) => write!(f, "activity {id} is not pending"),
            StateError::ActivityNotStarted(id) => write!(f, "activity {id} has not started"),
            StateError::ActivityAlreadyStarted(id) => write!(f, "activity {id} already started"),
            StateError::TimerNotFound(id) => write!(f, "timer {id} is not pending"),
            StateError::InitiatedEventNotFound(id) => {
                write!(f, "no pending record for initiated event {id}")
            }
            StateError::BadScheduleActivityAttributes(msg)
            | StateError::BadStartTimerAttributes(msg)
            | StateError::BadCancelTimerAttributes(msg)
            | StateError::BadRequestCancelActivityAttributes(msg)
            | StateError::BadContinueAsNewAttributes(msg)
            | StateError::BadSignalExternalAttributes(msg)
            | StateError::BadRequestCancelExternalAttributes(msg)
            | StateError::BadStartChildAttributes(msg)
            | StateError::BadRecordMarkerAttributes(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for StateError {}

/// Current decision task. Absent when `schedule_id == EMPTY_EVENT_ID`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionInfo {
    pub schedule_id: u64,
    pub started_id: u64,
    pub request_id: String,
    pub attempt: i32,
    pub timeout_secs: i32,
    pub task_list: String,
    pub scheduled_time_ms: u64,
    /// First scheduling time of this decision chain; carried across attempts
    /// and heartbeat continuations to bound total decision latency.
    pub original_scheduled_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub schedule_id: u64,
    pub activity_id: String,
    pub activity_type: String,
    pub task_list: String,
    pub input: String,
    pub scheduled_time_ms: u64,
    pub started_id: u64,
    pub started_time_ms: u64,
    pub request_id: String,
    pub attempt: i32,
    pub schedule_to_close_timeout_secs: i32,
    pub schedule_to_start_timeout_secs: i32,
    pub start_to_close_timeout_secs: i32,
    pub heartbeat_timeout_secs: i32,
    pub cancel_requested: bool,
    pub cancel_requested_id: u64,
    pub last_heartbeat_details: String,
    pub last_heartbeat_time_ms: u64,
    pub last_failure_reason: String,
    pub last_failure_details: String,
    pub retry_policy: Option<RetryPolicy>,
    pub retry_expiration_ms: u64,
    /// Retry back-off elapsed while a decision was pending; re-dispatch is
    /// deferred until that decision completes.
    pub dispatch_parked: bool,
}

impl ActivityInfo {
    pub fn is_started(&self) -> bool {
        self.started_id != EMPTY_EVENT_ID
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub timer_id: String,
    pub started_id: u64,
    pub expiry_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    pub initiated_id: u64,
    pub started_id: u64,
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub workflow_type: String,
    pub parent_close_policy: ParentClosePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelInfo {
    pub initiated_id: u64,
    pub cancel_request_id: String,
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalExternalInfo {
    pub initiated_id: u64,
    pub request_id: String,
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: String,
    pub signal_name: String,
    pub input: String,
    pub control: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub key: ExecutionKey,
    pub workflow_type: String,
    pub task_list: String,
    pub sticky_task_list: Option<String>,
    pub sticky_schedule_to_start_timeout_secs: i32,
    pub execution_timeout_secs: i32,
    pub task_timeout_secs: i32,
    pub state: WorkflowState,
    pub status: WorkflowStatus,
    pub next_event_id: u64,
    pub last_processed_event_id: u64,
    pub branch_token: Vec<u8>,
    pub start_request_id: String,
    pub cron_schedule: Option<String>,
    pub memo: HashMap<String, String>,
    pub search_attributes: HashMap<String, String>,
    pub decision: DecisionInfo,
    /// Set by the bad-binary guard; a reset processor may act on it later.
    pub reset_eligible: bool,
}

/// Durable projection of [`MutableState`]: everything that survives a reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub info: ExecutionInfo,
    pub pending_activities: Vec<ActivityInfo>,
    pub pending_timers: Vec<TimerInfo>,
    pub pending_children: Vec<ChildExecutionInfo>,
    pub pending_request_cancels: Vec<RequestCancelInfo>,
    pub pending_external_signals: Vec<SignalExternalInfo>,
    pub signal_request_ids: Vec<String>,
    pub buffered_events: Vec<EventKind>,
}

/// Staged output of one transaction, ready for the persistence layer.
#[derive(Debug, Clone)]
pub struct ClosedTransaction {
    pub snapshot: WorkflowSnapshot,
    pub events: Vec<HistoryEvent>,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
    /// Next-event-id the state was loaded at: the optimistic-concurrency
    /// condition for the update.
    pub condition: u64,
}

/// Outcome of reporting an activity failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityFailureOutcome {
    /// Retry scheduled; no event appended, no decision needed.
    Retrying { backoff_secs: i64 },
    /// Retries exhausted (or none configured); ActivityTaskFailed appended.
    Failed,
}

#[derive(Clone)]
pub struct MutableState {
    info: ExecutionInfo,
    pending_activities: HashMap<u64, ActivityInfo>,
    activity_ids: HashMap<String, u64>,
    pending_timers: HashMap<String, TimerInfo>,
    pending_children: HashMap<u64, ChildExecutionInfo>,
    pending_request_cancels: HashMap<u64, RequestCancelInfo>,
    pending_external_signals: HashMap<u64, SignalExternalInfo>,
    signal_request_ids: HashSet<String>,
    builder: HistoryBuilder,
    transfer_tasks: Vec<TransferTask>,
    timer_tasks: Vec<TimerTask>,
    condition: u64,
    buffered_flushed: bool,
}

impl MutableState {
    /// Fresh state for a run that has no history yet.
    pub fn new(key: ExecutionKey) -> Self {
        let info = ExecutionInfo {
            key,
            workflow_type: String::new(),
            task_list: String::new(),
            sticky_task_list: None,
            sticky_schedule_to_start_timeout_secs: 0,
            execution_timeout_secs: 0,
            task_timeout_secs: 0,
            state: WorkflowState::Created,
            status: WorkflowStatus::Running,
            next_event_id: FIRST_EVENT_ID,
            last_processed_event_id: EMPTY_EVENT_ID,
            branch_token: Vec::new(),
            start_request_id: String::new(),
            cron_schedule: None,
            memo: HashMap::new(),
            search_attributes: HashMap::new(),
            decision: DecisionInfo::default(),
            reset_eligible: false,
        };
        Self {
            info,
            pending_activities: HashMap::new(),
            activity_ids: HashMap::new(),
            pending_timers: HashMap::new(),
            pending_children: HashMap::new(),
            pending_request_cancels: HashMap::new(),
            pending_external_signals: HashMap::new(),
            signal_request_ids: HashSet::new(),
            builder: HistoryBuilder::new(),
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
            condition: FIRST_EVENT_ID,
            buffered_flushed: false,
        }
    }

    pub fn from_snapshot(snapshot: WorkflowSnapshot) -> Self {
        let condition = snapshot.info.next_event_id;
        let mut state = Self::new(snapshot.info.key.clone());
        state.info = snapshot.info;
        for activity in snapshot.pending_activities {
            state
                .activity_ids
                .insert(activity.activity_id.clone(), activity.schedule_id);
            state
                .pending_activities
                .insert(activity.schedule_id, activity);
        }
        for timer in snapshot.pending_timers {
            state.pending_timers.insert(timer.timer_id.clone(), timer);
        }
        for child in snapshot.pending_children {
            state.pending_children.insert(child.initiated_id, child);
        }
        for cancel in snapshot.pending_request_cancels {
            state.pending_request_cancels.insert(cancel.initiated_id, cancel);
        }
        for signal in snapshot.pending_external_signals {
            state
                .pending_external_signals
                .insert(signal.initiated_id, signal);
        }
        state.signal_request_ids = snapshot.signal_request_ids.into_iter().collect();
        for kind in snapshot.buffered_events {
            state.builder.buffer(kind);
        }
        state.condition = condition;
        state
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        let mut pending_activities: Vec<_> = self.pending_activities.values().cloned().collect();
        pending_activities.sort_by_key(|a| a.schedule_id);
        let mut pending_timers: Vec<_> = self.pending_timers.values().cloned().collect();
        pending_timers.sort_by(|a, b| a.timer_id.cmp(&b.timer_id));
        let mut pending_children: Vec<_> = self.pending_children.values().cloned().collect();
        pending_children.sort_by_key(|c| c.initiated_id);
        let mut pending_request_cancels: Vec<_> =
            self.pending_request_cancels.values().cloned().collect();
        pending_request_cancels.sort_by_key(|c| c.initiated_id);
        let mut pending_external_signals: Vec<_> =
            self.pending_external_signals.values().cloned().collect();
        pending_external_signals.sort_by_key(|s| s.initiated_id);
        let mut signal_request_ids: Vec<_> = self.signal_request_ids.iter().cloned().collect();
        signal_request_ids.sort();

        WorkflowSnapshot {
            info: self.info.clone(),
            pending_activities,
            pending_timers,
            pending_children,
            pending_request_cancels,
            pending_external_signals,
            signal_request_ids,
            buffered_events: Vec::new(),
        }
    }

    // ---- accessors -------------------------------------------------------

    pub fn info(&self) -> &ExecutionInfo {
        &self.info
    }

    pub fn key(&self) -> &ExecutionKey {
        &self.info.key
    }

    pub fn next_event_id(&self) -> u64 {
        self.info.next_event_id
    }

    pub fn is_running(&self) -> bool {
        !self.info.status.is_terminal()
    }

    pub fn has_pending_decision(&self) -> bool {
        self.info.decision.schedule_id != EMPTY_EVENT_ID
    }

    pub fn has_started_decision(&self) -> bool {
        self.has_pending_decision() && self.info.decision.started_id != EMPTY_EVENT_ID
    }

    /// True once any decision task has completed: the first completion moves
    /// `last_processed_event_id` off the empty sentinel.
    pub fn has_completed_first_decision(&self) -> bool {
        self.info.last_processed_event_id != EMPTY_EVENT_ID
    }

    pub fn has_buffered_events(&self) -> bool {
        self.builder.has_buffered()
    }

    pub fn pending_activity(&self, schedule_id: u64) -> Option<&ActivityInfo> {
        self.pending_activities.get(&schedule_id)
    }

    pub fn pending_activity_by_id(&self, activity_id: &str) -> Option<&ActivityInfo> {
        self.activity_ids
            .get(activity_id)
            .and_then(|schedule_id| self.pending_activities.get(schedule_id))
    }

    pub fn pending_timer(&self, timer_id: &str) -> Option<&TimerInfo> {
        self.pending_timers.get(timer_id)
    }

    pub fn pending_activity_count(&self) -> usize {
        self.pending_activities.len()
    }

    // ---- event plumbing --------------------------------------------------

    fn push_event(&mut self, kind: EventKind) -> HistoryEvent {
        let event = HistoryEvent::new(self.info.next_event_id, kind);
        self.info.next_event_id += 1;
        self.builder.push(event.clone());
        event
    }

    /// Append directly, or buffer when a decision is in flight and the event
    /// kind is externally originated. Returns the event only when appended.
    fn push_or_buffer(&mut self, kind: EventKind) -> Option<HistoryEvent> {
        if self.has_started_decision() && kind.is_bufferable() {
            debug!(execution = %self.info.key, kind = kind.type_name(), "buffering event");
            self.builder.buffer(kind);
            None
        } else {
            Some(self.push_event(kind))
        }
    }

    fn flush_buffered_events(&mut self) {
        let buffered = self.builder.drain_buffered();
        if buffered.is_empty() {
            return;
        }
        debug!(
            execution = %self.info.key,
            count = buffered.len(),
            "flushing buffered events"
        );
        for kind in buffered {
            self.push_event(kind);
        }
        self.buffered_flushed = true;
    }

    fn ensure_running(&self) -> Result<(), StateError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(StateError::WorkflowTerminal)
        }
    }

    fn close(&mut self, status: WorkflowStatus) {
        self.info.state = WorkflowState::Completed;
        self.info.status = status;
        self.info.decision = DecisionInfo::default();
        self.transfer_tasks.push(TransferTask::CloseExecution {
            key: self.info.key.clone(),
        });
    }

    // ---- workflow lifecycle ---------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_workflow_execution_started_event(
        &mut self,
        workflow_type: String,
        task_list: String,
        input: String,
        execution_timeout_secs: i32,
        task_timeout_secs: i32,
        identity: String,
        start_request_id: String,
        continued_from_run_id: Option<String>,
        first_decision_backoff_secs: i32,
    ) -> Result<HistoryEvent, StateError> {
        if self.info.next_event_id != FIRST_EVENT_ID {
            return Err(StateError::AlreadyStarted);
        }
        self.info.workflow_type = workflow_type.clone();
        self.info.task_list = task_list.clone();
        self.info.execution_timeout_secs = execution_timeout_secs;
        self.info.task_timeout_secs = task_timeout_secs;
        self.info.start_request_id = start_request_id;
        self.info.state = WorkflowState::Created;
        self.info.status = WorkflowStatus::Running;
        self.info.branch_token = self.info.key.run_id.as_bytes().to_vec();

        let event = self.push_event(EventKind::WorkflowExecutionStarted {
            workflow_type,
            task_list,
            input,
            execution_timeout_secs,
            task_timeout_secs,
            identity,
            continued_from_run_id,
            first_decision_backoff_secs,
        });
        self.timer_tasks.push(TimerTask::WorkflowTimeout {
            key: self.info.key.clone(),
            fire_at_ms: now_ms() + (execution_timeout_secs.max(0) as u64) * 1000,
        });
        Ok(event)
    }

    pub fn add_workflow_execution_completed_event(
        &mut self,
        decision_completed_event_id: u64,
        result: String,
    ) -> Result<HistoryEvent, StateError> {
        self.ensure_running()?;
        let event = self.push_event(EventKind::WorkflowExecutionCompleted {
            result,
            decision_completed_event_id,
        });
        self.close(WorkflowStatus::Completed);
        Ok(event)
    }

    pub fn add_workflow_execution_failed_event(
        &mut self,
        decision_completed_event_id: u64,
        reason: String,
        details: String,
    ) -> Result<HistoryEvent, StateError> {
        self.ensure_running()?;
        let event = self.push_event(EventKind::WorkflowExecutionFailed {
            reason,
            details,
            decision_completed_event_id,
        });
        self.close(WorkflowStatus::Failed);
        Ok(event)
    }

    pub fn add_workflow_execution_canceled_event(
        &mut self,
        decision_completed_event_id: u64,
        details: String,
    ) -> Result<HistoryEvent, StateError> {
        self.ensure_running()?;
        let event = self.push_event(EventKind::WorkflowExecutionCanceled {
            details,
            decision_completed_event_id,
        });
        self.close(WorkflowStatus::Canceled);
        Ok(event)
    }

    pub fn add_workflow_execution_terminated_event(
        &mut self,
        reason: String,
        details: String,
        identity: String,
    ) -> Result<HistoryEvent, StateError> {
        self.ensure_running()?;
        let event = self.push_event(EventKind::WorkflowExecutionTerminated {
            reason,
            details,
            identity,
        });
        self.close(WorkflowStatus::Terminated);
        Ok(event)
    }

    pub fn add_workflow_execution_timed_out_event(&mut self) -> Result<HistoryEvent, StateError> {
        self.ensure_running()?;
        let event = self.push_event(EventKind::WorkflowExecutionTimedOut);
        self.close(WorkflowStatus::TimedOut);
        Ok(event)
    }

    pub fn add_workflow_execution_cancel_requested_event(
        &mut self,
        cause: String,
        identity: String,
    ) -> Result<Option<HistoryEvent>, StateError> {
        self.ensure_running()?;
        Ok(self.push_or_buffer(EventKind::WorkflowExecutionCancelRequested { cause, identity }))
    }

    /// Terminal for this run; the engine starts the successor run.
    pub fn add_continued_as_new_event(
        &mut self,
        decision_completed_event_id: u64,
        new_run_id: String,
        attributes: &ContinueAsNewWorkflowAttributes,
    ) -> Result<HistoryEvent, StateError> {
        self.ensure_running()?;
        if attributes.workflow_type.is_empty() {
            return Err(StateError::BadContinueAsNewAttributes(
                "continue-as-new requires a workflow type".into(),
            ));
        }
        let task_list = if attributes.task_list.is_empty() {
            self.info.task_list.clone()
        } else {
            attributes.task_list.clone()
        };
        let execution_timeout = if attributes.execution_timeout_secs > 0 {
            attributes.execution_timeout_secs
        } else {
            self.info.execution_timeout_secs
        };
        let task_timeout = if attributes.task_timeout_secs > 0 {
            attributes.task_timeout_secs
        } else {
            self.info.task_timeout_secs
        };
        let event = self.push_event(EventKind::WorkflowExecutionContinuedAsNew {
            new_run_id,
            workflow_type: attributes.workflow_type.clone(),
            task_list,
            input: attributes.input.clone(),
            execution_timeout_secs: execution_timeout,
            task_timeout_secs: task_timeout,
            decision_completed_event_id,
        });
        self.close(WorkflowStatus::ContinuedAsNew);
        Ok(event)
    }

    /// Signal with request-id dedup. Returns `Ok(None)` for duplicates (no
    /// event, no state change) and for buffered delivery.
    pub fn add_workflow_execution_signaled_event(
        &mut self,
        signal_name: String,
        input: String,
        identity: String,
        request_id: Option<String>,
    ) -> Result<Option<HistoryEvent>, StateError> {
        self.ensure_running()?;
        if let Some(request_id) = request_id {
            if !request_id.is_empty() {
                if self.signal_request_ids.contains(&request_id) {
                    debug!(execution = %self.info.key, request_id = %request_id, "duplicate signal dropped");
                    return Ok(None);
                }
                self.signal_request_ids.insert(request_id);
            }
        }
        Ok(self.push_or_buffer(EventKind::WorkflowExecutionSignaled {
            signal_name,
            input,
            identity,
        }))
    }

    pub fn remove_signal_request_id(&mut self, request_id: &str) {
        self.signal_request_ids.remove(request_id);
    }

    /// Worker affinity for decision dispatch. `None` clears stickiness.
    pub fn set_sticky_task_list(
        &mut self,
        task_list: Option<String>,
        schedule_to_start_timeout_secs: i32,
    ) {
        self.info.sticky_task_list = task_list;
        self.info.sticky_schedule_to_start_timeout_secs = schedule_to_start_timeout_secs;
    }

    // ---- decision task state machine ------------------------------------

    /// Schedule a decision task. With `backoff`, dispatch is deferred through
    /// a timer task instead of an immediate transfer task.
    pub fn add_decision_task_scheduled_event(
        &mut self,
        backoff: Option<Duration>,
    ) -> Result<u64, StateError> {
        self.ensure_running()?;
        if self.has_pending_decision() {
            return Err(StateError::DecisionAlreadyPending);
        }
        let task_list = self
            .info
            .sticky_task_list
            .clone()
            .unwrap_or_else(|| self.info.task_list.clone());
        let attempt = self.info.decision.attempt;
        let event = self.push_event(EventKind::DecisionTaskScheduled {
            task_list: task_list.clone(),
            start_to_close_timeout_secs: self.info.task_timeout_secs,
            attempt,
        });

        let now = now_ms();
        let original = if self.info.decision.original_scheduled_time_ms != 0 {
            self.info.decision.original_scheduled_time_ms
        } else {
            now
        };
        self.info.decision = DecisionInfo {
            schedule_id: event.event_id,
            started_id: EMPTY_EVENT_ID,
            request_id: String::new(),
            attempt,
            timeout_secs: self.info.task_timeout_secs,
            task_list: task_list.clone(),
            scheduled_time_ms: now,
            original_scheduled_time_ms: original,
        };
        self.info.state = WorkflowState::Running;

        match backoff {
            Some(delay) => self.timer_tasks.push(TimerTask::DelayedDecision {
                key: self.info.key.clone(),
                fire_at_ms: now + delay.as_millis() as u64,
            }),
            None => self.transfer_tasks.push(TransferTask::DecisionTask {
                key: self.info.key.clone(),
                task_list,
                schedule_id: event.event_id,
            }),
        }
        Ok(event.event_id)
    }

    pub fn add_decision_task_started_event(
        &mut self,
        schedule_id: u64,
        request_id: String,
        identity: String,
    ) -> Result<HistoryEvent, StateError> {
        self.ensure_running()?;
        if !self.has_pending_decision() {
            return Err(StateError::DecisionNotPending);
        }
        let current = self.info.decision.schedule_id;
        if current != schedule_id {
            return Err(StateError::DecisionStale {
                expected: current,
                got: schedule_id,
            });
        }
        if self.has_started_decision() {
            return Err(StateError::DecisionStale {
                expected: current,
                got: schedule_id,
            });
        }
        let event = self.push_event(EventKind::DecisionTaskStarted {
            scheduled_event_id: schedule_id,
            identity,
            request_id: request_id.clone(),
        });
        self.info.decision.started_id = event.event_id;
        self.info.decision.request_id = request_id;
        self.timer_tasks.push(TimerTask::DecisionTimeout {
            key: self.info.key.clone(),
            schedule_id,
            fire_at_ms: now_ms() + (self.info.decision.timeout_secs.max(0) as u64) * 1000,
        });
        Ok(event)
    }

    /// Validate that a worker-reported token refers to the current started
    /// decision; otherwise the task is stale.
    pub fn check_decision_token(&self, schedule_id: u64) -> Result<(), StateError> {
        if !self.has_started_decision() {
            return Err(StateError::DecisionNotStarted);
        }
        if self.info.decision.schedule_id != schedule_id {
            return Err(StateError::DecisionStale {
                expected: self.info.decision.schedule_id,
                got: schedule_id,
            });
        }
        Ok(())
    }

    /// Enforce the decision-heartbeat budget for `force_create_new_decision`.
    pub fn check_decision_heartbeat(&self, budget: Duration) -> Result<(), StateError> {
        let original = self.info.decision.original_scheduled_time_ms;
        if original == 0 {
            return Ok(());
        }
        let elapsed_ms = now_ms().saturating_sub(original);
        if elapsed_ms > budget.as_millis() as u64 {
            return Err(StateError::DecisionHeartbeatTimeout);
        }
        Ok(())
    }

    pub fn add_decision_task_completed_event(
        &mut self,
        identity: String,
        binary_checksum: String,
    ) -> Result<HistoryEvent, StateError> {
        if !self.has_started_decision() {
            return Err(StateError::DecisionNotStarted);
        }
        let schedule_id = self.info.decision.schedule_id;
        let started_id = self.info.decision.started_id;
        let event = self.push_event(EventKind::DecisionTaskCompleted {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            identity,
            binary_checksum,
        });
        self.info.last_processed_event_id = started_id;
        self.info.decision = DecisionInfo::default();
        self.flush_buffered_events();
        Ok(event)
    }

    pub fn add_decision_task_failed_event(
        &mut self,
        cause: DecisionFailCause,
        details: String,
        identity: String,
    ) -> Result<HistoryEvent, StateError> {
        if !self.has_pending_decision() {
            return Err(StateError::DecisionNotPending);
        }
        let schedule_id = self.info.decision.schedule_id;
        let started_id = self.info.decision.started_id;
        let attempt = self.info.decision.attempt;
        let original = self.info.decision.original_scheduled_time_ms;
        let event = self.push_event(EventKind::DecisionTaskFailed {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            cause,
            details,
            identity,
        });
        // The decision becomes re-schedulable; the attempt counter survives
        // so the next schedule can apply back-off.
        self.info.decision = DecisionInfo {
            attempt: attempt + 1,
            original_scheduled_time_ms: original,
            ..DecisionInfo::default()
        };
        if cause == DecisionFailCause::BadBinary {
            self.info.reset_eligible = true;
        }
        self.flush_buffered_events();
        Ok(event)
    }

    pub fn add_decision_task_timed_out_event(&mut self) -> Result<HistoryEvent, StateError> {
        if !self.has_pending_decision() {
            return Err(StateError::DecisionNotPending);
        }
        let schedule_id = self.info.decision.schedule_id;
        let started_id = self.info.decision.started_id;
        let attempt = self.info.decision.attempt;
        let event = self.push_event(EventKind::DecisionTaskTimedOut {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
        });
        self.info.decision = DecisionInfo {
            attempt: attempt + 1,
            ..DecisionInfo::default()
        };
        self.flush_buffered_events();
        Ok(event)
    }

    // ---- activity task state machine ------------------------------------

    /// Schedule an activity, deriving any omitted timeouts.
    pub fn add_activity_task_scheduled_event(
        &mut self,
        decision_completed_event_id: u64,
        attributes: &ScheduleActivityTaskAttributes,
    ) -> Result<(HistoryEvent, ActivityInfo), StateError> {
        self.ensure_running()?;
        if attributes.activity_id.is_empty() {
            return Err(StateError::BadScheduleActivityAttributes(
                "activity id is required".into(),
            ));
        }
        if attributes.activity_type.is_empty() {
            return Err(StateError::BadScheduleActivityAttributes(
                "activity type is required".into(),
            ));
        }
        if self.activity_ids.contains_key(&attributes.activity_id) {
            return Err(StateError::BadScheduleActivityAttributes(format!(
                "activity id {} is already in use",
                attributes.activity_id
            )));
        }
        let (schedule_to_close, schedule_to_start, start_to_close, heartbeat) =
            derive_activity_timeouts(attributes, self.info.execution_timeout_secs)?;

        let task_list = if attributes.task_list.is_empty() {
            self.info.task_list.clone()
        } else {
            attributes.task_list.clone()
        };
        let event = self.push_event(EventKind::ActivityTaskScheduled {
            activity_id: attributes.activity_id.clone(),
            activity_type: attributes.activity_type.clone(),
            task_list: task_list.clone(),
            input: attributes.input.clone(),
            schedule_to_close_timeout_secs: schedule_to_close,
            schedule_to_start_timeout_secs: schedule_to_start,
            start_to_close_timeout_secs: start_to_close,
            heartbeat_timeout_secs: heartbeat,
            decision_completed_event_id,
            retry_policy: attributes.retry_policy.clone(),
        });

        let now = now_ms();
        let retry_expiration_ms = attributes
            .retry_policy
            .as_ref()
            .map(|p| {
                if p.expiration_secs > 0 {
                    now + (p.expiration_secs as u64) * 1000
                } else {
                    0
                }
            })
            .unwrap_or(0);
        let info = ActivityInfo {
            schedule_id: event.event_id,
            activity_id: attributes.activity_id.clone(),
            activity_type: attributes.activity_type.clone(),
            task_list: task_list.clone(),
            input: attributes.input.clone(),
            scheduled_time_ms: now,
            started_id: EMPTY_EVENT_ID,
            started_time_ms: 0,
            request_id: String::new(),
            attempt: 0,
            schedule_to_close_timeout_secs: schedule_to_close,
            schedule_to_start_timeout_secs: schedule_to_start,
            start_to_close_timeout_secs: start_to_close,
            heartbeat_timeout_secs: heartbeat,
            cancel_requested: false,
            cancel_requested_id: EMPTY_EVENT_ID,
            last_heartbeat_details: String::new(),
            last_heartbeat_time_ms: 0,
            last_failure_reason: String::new(),
            last_failure_details: String::new(),
            retry_policy: attributes.retry_policy.clone(),
            retry_expiration_ms,
            dispatch_parked: false,
        };
        self.activity_ids
            .insert(info.activity_id.clone(), info.schedule_id);
        self.pending_activities.insert(info.schedule_id, info.clone());

        self.transfer_tasks.push(TransferTask::ActivityTask {
            key: self.info.key.clone(),
            task_list,
            schedule_id: info.schedule_id,
        });
        self.timer_tasks.push(TimerTask::ActivityTimeout {
            key: self.info.key.clone(),
            schedule_id: info.schedule_id,
            fire_at_ms: now + (schedule_to_close.max(0) as u64) * 1000,
        });
        Ok((event, info))
    }

    pub fn add_activity_task_started_event(
        &mut self,
        schedule_id: u64,
        request_id: String,
        identity: String,
    ) -> Result<HistoryEvent, StateError> {
        self.ensure_running()?;
        let attempt = {
            let activity = self
                .pending_activities
                .get(&schedule_id)
                .ok_or_else(|| StateError::ActivityNotFound(schedule_id.to_string()))?;
            if activity.is_started() {
                return Err(StateError::ActivityAlreadyStarted(
                    activity.activity_id.clone(),
                ));
            }
            activity.attempt
        };
        let event = self.push_event(EventKind::ActivityTaskStarted {
            scheduled_event_id: schedule_id,
            identity,
            request_id: request_id.clone(),
            attempt,
        });
        let activity = self
            .pending_activities
            .get_mut(&schedule_id)
            .expect("activity checked above");
        activity.started_id = event.event_id;
        activity.started_time_ms = now_ms();
        activity.request_id = request_id;
        Ok(event)
    }

    fn take_started_activity(&mut self, schedule_id: u64) -> Result<ActivityInfo, StateError> {
        let activity = self
            .pending_activities
            .get(&schedule_id)
            .ok_or_else(|| StateError::ActivityNotFound(schedule_id.to_string()))?;
        if !activity.is_started() {
            return Err(StateError::ActivityNotStarted(activity.activity_id.clone()));
        }
        let activity = self
            .pending_activities
            .remove(&schedule_id)
            .expect("activity checked above");
        self.activity_ids.remove(&activity.activity_id);
        Ok(activity)
    }

    pub fn add_activity_task_completed_event(
        &mut self,
        schedule_id: u64,
        result: String,
        identity: String,
    ) -> Result<(), StateError> {
        self.ensure_running()?;
        let activity = self.take_started_activity(schedule_id)?;
        self.push_or_buffer(EventKind::ActivityTaskCompleted {
            scheduled_event_id: schedule_id,
            started_event_id: activity.started_id,
            result,
            identity,
        });
        Ok(())
    }

    /// Report a failure; retries the activity in place when the policy allows.
    pub fn record_activity_task_failure(
        &mut self,
        schedule_id: u64,
        reason: String,
        details: String,
        identity: String,
    ) -> Result<ActivityFailureOutcome, StateError> {
        self.ensure_running()?;
        {
            let activity = self
                .pending_activities
                .get(&schedule_id)
                .ok_or_else(|| StateError::ActivityNotFound(schedule_id.to_string()))?;
            if !activity.is_started() {
                return Err(StateError::ActivityNotStarted(activity.activity_id.clone()));
            }
        }

        let retry_backoff = {
            let activity = self.pending_activities.get(&schedule_id).expect("checked");
            activity_retry_backoff(activity, &reason)
        };
        if let Some(backoff_secs) = retry_backoff {
            let key = self.info.key.clone();
            let activity = self.pending_activities.get_mut(&schedule_id).expect("checked");
            activity.attempt += 1;
            activity.started_id = EMPTY_EVENT_ID;
            activity.started_time_ms = 0;
            activity.request_id = String::new();
            activity.last_failure_reason = reason;
            activity.last_failure_details = details;
            let attempt = activity.attempt;
            debug!(
                execution = %key,
                schedule_id,
                attempt,
                backoff_secs,
                "retrying failed activity"
            );
            self.timer_tasks.push(TimerTask::ActivityRetry {
                key,
                schedule_id,
                attempt,
                fire_at_ms: now_ms() + (backoff_secs as u64) * 1000,
            });
            return Ok(ActivityFailureOutcome::Retrying { backoff_secs });
        }

        let activity = self.take_started_activity(schedule_id)?;
        self.push_or_buffer(EventKind::ActivityTaskFailed {
            scheduled_event_id: schedule_id,
            started_event_id: activity.started_id,
            reason,
            details,
            identity,
        });
        Ok(ActivityFailureOutcome::Failed)
    }

    /// Decision-driven cancel request. An unstarted activity is canceled on
    /// the spot; a started one is marked and the worker learns via heartbeat.
    pub fn add_activity_task_cancel_requested_event(
        &mut self,
        decision_completed_event_id: u64,
        activity_id: &str,
    ) -> Result<(), StateError> {
        self.ensure_running()?;
        let schedule_id = *self.activity_ids.get(activity_id).ok_or_else(|| {
            StateError::BadRequestCancelActivityAttributes(format!(
                "activity {activity_id} is not pending"
            ))
        })?;
        let event = self.push_event(EventKind::ActivityTaskCancelRequested {
            decision_completed_event_id,
            activity_id: activity_id.to_string(),
        });

        let started = self
            .pending_activities
            .get(&schedule_id)
            .map(|a| a.is_started())
            .unwrap_or(false);
        if started {
            let activity = self.pending_activities.get_mut(&schedule_id).expect("checked");
            activity.cancel_requested = true;
            activity.cancel_requested_id = event.event_id;
        } else {
            // Never dispatched to a worker: cancel completes immediately.
            let activity = self
                .pending_activities
                .remove(&schedule_id)
                .expect("checked");
            self.activity_ids.remove(&activity.activity_id);
            self.push_event(EventKind::ActivityTaskCanceled {
                scheduled_event_id: schedule_id,
                started_event_id: EMPTY_EVENT_ID,
                latest_cancel_requested_event_id: event.event_id,
                details: "activity canceled before start".into(),
                identity: String::new(),
            });
        }
        Ok(())
    }

    pub fn add_activity_task_canceled_event(
        &mut self,
        schedule_id: u64,
        details: String,
        identity: String,
    ) -> Result<(), StateError> {
        self.ensure_running()?;
        {
            let activity = self
                .pending_activities
                .get(&schedule_id)
                .ok_or_else(|| StateError::ActivityNotFound(schedule_id.to_string()))?;
            if !activity.cancel_requested {
                return Err(StateError::BadRequestCancelActivityAttributes(format!(
                    "activity {} has no cancel request",
                    activity.activity_id
                )));
            }
        }
        let activity = self.take_started_activity(schedule_id)?;
        self.push_or_buffer(EventKind::ActivityTaskCanceled {
            scheduled_event_id: schedule_id,
            started_event_id: activity.started_id,
            latest_cancel_requested_event_id: activity.cancel_requested_id,
            details,
            identity,
        });
        Ok(())
    }

    /// Heartbeat: record progress, no event. Returns whether cancellation has
    /// been requested for the activity.
    pub fn record_activity_heartbeat(
        &mut self,
        schedule_id: u64,
        details: String,
    ) -> Result<bool, StateError> {
        self.ensure_running()?;
        let activity = self
            .pending_activities
            .get_mut(&schedule_id)
            .ok_or_else(|| StateError::ActivityNotFound(schedule_id.to_string()))?;
        if !activity.is_started() {
            return Err(StateError::ActivityNotStarted(activity.activity_id.clone()));
        }
        activity.last_heartbeat_details = details;
        activity.last_heartbeat_time_ms = now_ms();
        Ok(activity.cancel_requested)
    }

    /// A retry back-off elapsed. Re-dispatch unless a decision is pending, in
    /// which case the dispatch is parked until that decision completes.
    pub fn on_activity_retry_timer_fired(&mut self, schedule_id: u64) -> Result<(), StateError> {
        self.ensure_running()?;
        let key = self.info.key.clone();
        let decision_pending = self.has_pending_decision();
        let activity = self
            .pending_activities
            .get_mut(&schedule_id)
            .ok_or_else(|| StateError::ActivityNotFound(schedule_id.to_string()))?;
        if activity.is_started() {
            // Stale timer from a previous attempt.
            return Ok(());
        }
        if decision_pending {
            activity.dispatch_parked = true;
            return Ok(());
        }
        let task_list = activity.task_list.clone();
        self.transfer_tasks.push(TransferTask::ActivityTask {
            key,
            task_list,
            schedule_id,
        });
        Ok(())
    }

    /// Re-dispatch activities whose retry fired while a decision was pending.
    /// Called by the decision-completion path.
    pub fn dispatch_parked_activities(&mut self) {
        let key = self.info.key.clone();
        let parked: Vec<(u64, String)> = self
            .pending_activities
            .values_mut()
            .filter(|a| a.dispatch_parked)
            .map(|a| {
                a.dispatch_parked = false;
                (a.schedule_id, a.task_list.clone())
            })
            .collect();
        for (schedule_id, task_list) in parked {
            self.transfer_tasks.push(TransferTask::ActivityTask {
                key: key.clone(),
                task_list,
                schedule_id,
            });
        }
    }

    // ---- timers ----------------------------------------------------------

    pub fn add_timer_started_event(
        &mut self,
        decision_completed_event_id: u64,
        timer_id: &str,
        start_to_fire_timeout_secs: i64,
    ) -> Result<(HistoryEvent, TimerInfo), StateError> {
        self.ensure_running()?;
        if timer_id.is_empty() {
            return Err(StateError::BadStartTimerAttributes(
                "timer id is required".into(),
            ));
        }
        if start_to_fire_timeout_secs <= 0 {
            return Err(StateError::BadStartTimerAttributes(format!(
                "timer {timer_id} duration must be positive"
            )));
        }
        if self.pending_timers.contains_key(timer_id) {
            return Err(StateError::BadStartTimerAttributes(format!(
                "timer id {timer_id} is already in use"
            )));
        }
        let event = self.push_event(EventKind::TimerStarted {
            timer_id: timer_id.to_string(),
            start_to_fire_timeout_secs,
            decision_completed_event_id,
        });
        let info = TimerInfo {
            timer_id: timer_id.to_string(),
            started_id: event.event_id,
            expiry_ms: now_ms() + (start_to_fire_timeout_secs as u64) * 1000,
        };
        self.pending_timers.insert(info.timer_id.clone(), info.clone());
        self.timer_tasks.push(TimerTask::UserTimer {
            key: self.info.key.clone(),
            timer_id: info.timer_id.clone(),
            fire_at_ms: info.expiry_ms,
        });
        Ok((event, info))
    }

    pub fn add_timer_fired_event(&mut self, timer_id: &str) -> Result<(), StateError> {
        self.ensure_running()?;
        let timer = self
            .pending_timers
            .remove(timer_id)
            .ok_or_else(|| StateError::TimerNotFound(timer_id.to_string()))?;
        self.push_or_buffer(EventKind::TimerFired {
            timer_id: timer.timer_id,
            started_event_id: timer.started_id,
        });
        Ok(())
    }

    pub fn add_timer_canceled_event(
        &mut self,
        decision_completed_event_id: u64,
        timer_id: &str,
        identity: String,
    ) -> Result<(), StateError> {
        self.ensure_running()?;
        let timer = self
            .pending_timers
            .remove(timer_id)
            .ok_or_else(|| StateError::TimerNotFound(timer_id.to_string()))?;
        // The durable timer task is left to fire; the processor drops it when
        // it finds no matching TimerInfo.
        self.push_event(EventKind::TimerCanceled {
            timer_id: timer.timer_id,
            started_event_id: timer.started_id,
            decision_completed_event_id,
            identity,
        });
        Ok(())
    }

    // ---- markers, search attributes -------------------------------------

    pub fn add_marker_recorded_event(
        &mut self,
        decision_completed_event_id: u64,
        marker_name: &str,
        details: String,
    ) -> Result<HistoryEvent, StateError> {
        self.ensure_running()?;
        if marker_name.is_empty() {
            return Err(StateError::BadRecordMarkerAttributes(
                "marker name is required".into(),
            ));
        }
        Ok(self.push_event(EventKind::MarkerRecorded {
            marker_name: marker_name.to_string(),
            details,
            decision_completed_event_id,
        }))
    }

    pub fn add_upsert_search_attributes_event(
        &mut self,
        decision_completed_event_id: u64,
        search_attributes: HashMap<String, String>,
    ) -> Result<HistoryEvent, StateError> {
        self.ensure_running()?;
        self.info
            .search_attributes
            .extend(search_attributes.clone());
        Ok(self.push_event(EventKind::UpsertWorkflowSearchAttributes {
            search_attributes,
            decision_completed_event_id,
        }))
    }

    // ---- external workflow operations -----------------------------------

    pub fn add_signal_external_initiated_event(
        &mut self,
        decision_completed_event_id: u64,
        attributes: &SignalExternalWorkflowAttributes,
        request_id: String,
    ) -> Result<(HistoryEvent, SignalExternalInfo), StateError> {
        self.ensure_running()?;
        if attributes.workflow_id.is_empty() {
            return Err(StateError::BadSignalExternalAttributes(
                "target workflow id is required".into(),
            ));
        }
        if attributes.signal_name.is_empty() {
            return Err(StateError::BadSignalExternalAttributes(
                "signal name is required".into(),
            ));
        }
        let event = self.push_event(EventKind::SignalExternalWorkflowExecutionInitiated {
            decision_completed_event_id,
            namespace: attributes.namespace.clone(),
            workflow_id: attributes.workflow_id.clone(),
            run_id: attributes.run_id.clone(),
            signal_name: attributes.signal_name.clone(),
            input: attributes.input.clone(),
            control: attributes.control.clone(),
        });
        let info = SignalExternalInfo {
            initiated_id: event.event_id,
            request_id,
            namespace: attributes.namespace.clone(),
            workflow_id: attributes.workflow_id.clone(),
            run_id: attributes.run_id.clone(),
            signal_name: attributes.signal_name.clone(),
            input: attributes.input.clone(),
            control: attributes.control.clone(),
        };
        self.pending_external_signals
            .insert(info.initiated_id, info.clone());
        self.transfer_tasks.push(TransferTask::SignalExecution {
            key: self.info.key.clone(),
            initiated_id: info.initiated_id,
            target_namespace: info.namespace.clone(),
            target_workflow_id: info.workflow_id.clone(),
            target_run_id: info.run_id.clone(),
        });
        Ok((event, info))
    }

    pub fn resolve_signal_external(
        &mut self,
        initiated_id: u64,
        failure_cause: Option<String>,
    ) -> Result<(), StateError> {
        self.ensure_running()?;
        let info = self
            .pending_external_signals
            .remove(&initiated_id)
            .ok_or(StateError::InitiatedEventNotFound(initiated_id))?;
        let kind = match failure_cause {
            None => EventKind::ExternalWorkflowExecutionSignaled {
                initiated_event_id: initiated_id,
                namespace: info.namespace,
                workflow_id: info.workflow_id,
                run_id: info.run_id,
                control: info.control,
            },
            Some(cause) => EventKind::SignalExternalWorkflowExecutionFailed {
                initiated_event_id: initiated_id,
                namespace: info.namespace,
                workflow_id: info.workflow_id,
                run_id: info.run_id,
                control: info.control,
                cause,
            },
        };
        self.push_or_buffer(kind);
        Ok(())
    }

    pub fn add_request_cancel_external_initiated_event(
        &mut self,
        decision_completed_event_id: u64,
        namespace: &str,
        workflow_id: &str,
        run_id: &str,
        control: String,
        cancel_request_id: String,
    ) -> Result<(HistoryEvent, RequestCancelInfo), StateError> {
        self.ensure_running()?;
        if workflow_id.is_empty() {
            return Err(StateError::BadRequestCancelExternalAttributes(
                "target workflow id is required".into(),
            ));
        }
        let event = self.push_event(EventKind::RequestCancelExternalWorkflowExecutionInitiated {
            decision_completed_event_id,
            namespace: namespace.to_string(),
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            control,
        });
        let info = RequestCancelInfo {
            initiated_id: event.event_id,
            cancel_request_id,
            namespace: namespace.to_string(),
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
        };
        self.pending_request_cancels
            .insert(info.initiated_id, info.clone());
        self.transfer_tasks.push(TransferTask::CancelExecution {
            key: self.info.key.clone(),
            initiated_id: info.initiated_id,
            target_namespace: info.namespace.clone(),
            target_workflow_id: info.workflow_id.clone(),
            target_run_id: info.run_id.clone(),
        });
        Ok((event, info))
    }

    pub fn resolve_request_cancel_external(
        &mut self,
        initiated_id: u64,
        failure_cause: Option<String>,
    ) -> Result<(), StateError> {
        self.ensure_running()?;
        let info = self
            .pending_request_cancels
            .remove(&initiated_id)
            .ok_or(StateError::InitiatedEventNotFound(initiated_id))?;
        let kind = match failure_cause {
            None => EventKind::ExternalWorkflowExecutionCancelRequested {
                initiated_event_id: initiated_id,
                namespace: info.namespace,
                workflow_id: info.workflow_id,
                run_id: info.run_id,
            },
            Some(cause) => EventKind::RequestCancelExternalWorkflowExecutionFailed {
                initiated_event_id: initiated_id,
                namespace: info.namespace,
                workflow_id: info.workflow_id,
                run_id: info.run_id,
                cause,
            },
        };
        self.push_or_buffer(kind);
        Ok(())
    }

    // ---- child workflows -------------------------------------------------

    pub fn add_child_workflow_initiated_event(
        &mut self,
        decision_completed_event_id: u64,
        attributes: &StartChildWorkflowAttributes,
    ) -> Result<(HistoryEvent, ChildExecutionInfo), StateError> {
        self.ensure_running()?;
        if attributes.workflow_id.is_empty() || attributes.workflow_type.is_empty() {
            return Err(StateError::BadStartChildAttributes(
                "child workflow id and type are required".into(),
            ));
        }
        let event = self.push_event(EventKind::StartChildWorkflowExecutionInitiated {
            decision_completed_event_id,
            namespace: attributes.namespace.clone(),
            workflow_id: attributes.workflow_id.clone(),
            workflow_type: attributes.workflow_type.clone(),
            task_list: attributes.task_list.clone(),
            input: attributes.input.clone(),
            parent_close_policy: attributes.parent_close_policy,
            control: attributes.control.clone(),
        });
        let info = ChildExecutionInfo {
            initiated_id: event.event_id,
            started_id: EMPTY_EVENT_ID,
            namespace: attributes.namespace.clone(),
            workflow_id: attributes.workflow_id.clone(),
            run_id: None,
            workflow_type: attributes.workflow_type.clone(),
            parent_close_policy: attributes.parent_close_policy,
        };
        self.pending_children.insert(info.initiated_id, info.clone());
        self.transfer_tasks.push(TransferTask::StartChildExecution {
            key: self.info.key.clone(),
            initiated_id: info.initiated_id,
            target_namespace: info.namespace.clone(),
            target_workflow_id: info.workflow_id.clone(),
        });
        Ok((event, info))
    }

    pub fn add_child_workflow_started_event(
        &mut self,
        initiated_id: u64,
        run_id: String,
    ) -> Result<(), StateError> {
        self.ensure_running()?;
        let (namespace, workflow_id, workflow_type) = {
            let child = self
                .pending_children
                .get(&initiated_id)
                .ok_or(StateError::InitiatedEventNotFound(initiated_id))?;
            (
                child.namespace.clone(),
                child.workflow_id.clone(),
                child.workflow_type.clone(),
            )
        };
        let event = self.push_or_buffer(EventKind::ChildWorkflowExecutionStarted {
            initiated_event_id: initiated_id,
            namespace,
            workflow_id,
            run_id: run_id.clone(),
            workflow_type,
        });
        let child = self.pending_children.get_mut(&initiated_id).expect("checked");
        child.run_id = Some(run_id);
        if let Some(event) = event {
            child.started_id = event.event_id;
        }
        Ok(())
    }

    pub fn add_child_workflow_completed_event(
        &mut self,
        initiated_id: u64,
        result: Result<String, (String, String)>,
    ) -> Result<(), StateError> {
        self.ensure_running()?;
        let child = self
            .pending_children
            .remove(&initiated_id)
            .ok_or(StateError::InitiatedEventNotFound(initiated_id))?;
        let kind = match result {
            Ok(result) => EventKind::ChildWorkflowExecutionCompleted {
                initiated_event_id: initiated_id,
                started_event_id: child.started_id,
                result,
            },
            Err((reason, details)) => EventKind::ChildWorkflowExecutionFailed {
                initiated_event_id: initiated_id,
                started_event_id: child.started_id,
                reason,
                details,
            },
        };
        self.push_or_buffer(kind);
        Ok(())
    }

    // ---- transaction boundary -------------------------------------------

    /// Whether this transaction flushed buffered events; a fresh decision must
    /// be scheduled to consume them.
    pub fn buffered_events_flushed(&self) -> bool {
        self.buffered_flushed
    }

    /// Finalize the staged batch into a persistence package and reset the
    /// transaction-scoped accumulators.
    pub fn close_transaction(&mut self) -> ClosedTransaction {
        let events = self.builder.drain_batch();
        let transfer_tasks = std::mem::take(&mut self.transfer_tasks);
        let timer_tasks = std::mem::take(&mut self.timer_tasks);
        let condition = self.condition;
        self.condition = self.info.next_event_id;
        self.buffered_flushed = false;

        let mut snapshot = self.snapshot();
        snapshot.buffered_events = {
            // Buffered-but-unflushed events persist with the snapshot so a
            // reload preserves them.
            let kinds = self.builder.drain_buffered();
            for kind in &kinds {
                self.builder.buffer(kind.clone());
            }
            kinds
        };

        ClosedTransaction {
            snapshot,
            events,
            transfer_tasks,
            timer_tasks,
            condition,
        }
    }
}

/// Apply the timeout-derivation rules for a ScheduleActivity decision.
///
/// Order matters: schedule-to-close is derived from the other two first, then
/// used as the default for whichever of them is missing, then everything is
/// capped to the workflow execution timeout and heartbeat is clamped to
/// schedule-to-close.
fn derive_activity_timeouts(
    attributes: &ScheduleActivityTaskAttributes,
    workflow_timeout_secs: i32,
) -> Result<(i32, i32, i32, i32), StateError> {
    let mut schedule_to_close = attributes.schedule_to_close_timeout_secs;
    let mut schedule_to_start = attributes.schedule_to_start_timeout_secs;
    let mut start_to_close = attributes.start_to_close_timeout_secs;
    let mut heartbeat = attributes.heartbeat_timeout_secs;

    if schedule_to_close < 0 || schedule_to_start < 0 || start_to_close < 0 || heartbeat < 0 {
        return Err(StateError::BadScheduleActivityAttributes(format!(
            "activity {} has a negative timeout",
            attributes.activity_id
        )));
    }
    if schedule_to_close == 0 {
        schedule_to_close = schedule_to_start + start_to_close;
    }
    if schedule_to_close == 0 {
        return Err(StateError::BadScheduleActivityAttributes(format!(
            "activity {} specifies no usable timeout",
            attributes.activity_id
        )));
    }
    if schedule_to_start == 0 {
        schedule_to_start = schedule_to_close;
    }
    if start_to_close == 0 {
        start_to_close = schedule_to_close;
    }
    if workflow_timeout_secs > 0 {
        schedule_to_close = schedule_to_close.min(workflow_timeout_secs);
        schedule_to_start = schedule_to_start.min(workflow_timeout_secs);
        start_to_close = start_to_close.min(workflow_timeout_secs);
    }
    heartbeat = heartbeat.min(schedule_to_close);
    Ok((schedule_to_close, schedule_to_start, start_to_close, heartbeat))
}

/// Back-off for the next retry attempt, or `None` when the activity must fail.
fn activity_retry_backoff(activity: &ActivityInfo, reason: &str) -> Option<i64> {
    let policy = activity.retry_policy.as_ref()?;
    if policy.non_retryable_reasons.iter().any(|r| r == reason) {
        return None;
    }
    // attempt is 0-based; max_attempts counts total tries.
    if policy.max_attempts > 0 && activity.attempt + 1 >= policy.max_attempts {
        return None;
    }
    let backoff = policy.backoff_interval_secs(activity.attempt);
    if activity.retry_expiration_ms > 0 {
        let fire_at = now_ms() + (backoff as u64) * 1000;
        if fire_at > activity.retry_expiration_ms {
            return None;
        }
    }
    Some(backoff)
}
