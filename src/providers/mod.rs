//! Persistence contract consumed by the engine.
//!
//! The store is a pure storage abstraction: it persists snapshots, event
//! batches, and side-effect task queues without interpreting workflow
//! semantics. All orchestration decisions are made by the mutable-state
//! builder; the store's only smarts are the optimistic-concurrency condition
//! on updates and the current-run index used for workflow-id routing.

use crate::state::WorkflowSnapshot;
use crate::{ExecutionKey, HistoryEvent, WorkflowState, WorkflowStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod in_memory;
pub use error::StoreError;

/// A side-effect task bound for the matching service or a cross-workflow
/// operation, enqueued atomically with the mutation that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferTask {
    /// Dispatch a decision task to matching on `task_list`.
    DecisionTask {
        key: ExecutionKey,
        task_list: String,
        schedule_id: u64,
    },
    /// Dispatch an activity task to matching on `task_list`.
    ActivityTask {
        key: ExecutionKey,
        task_list: String,
        schedule_id: u64,
    },
    /// Deliver a signal to another workflow execution.
    SignalExecution {
        key: ExecutionKey,
        initiated_id: u64,
        target_namespace: String,
        target_workflow_id: String,
        target_run_id: String,
    },
    /// Request cancellation of another workflow execution.
    CancelExecution {
        key: ExecutionKey,
        initiated_id: u64,
        target_namespace: String,
        target_workflow_id: String,
        target_run_id: String,
    },
    /// Start a child workflow execution.
    StartChildExecution {
        key: ExecutionKey,
        initiated_id: u64,
        target_namespace: String,
        target_workflow_id: String,
    },
    /// Reclaim the execution record after the close-retention window.
    CloseExecution { key: ExecutionKey },
}

/// A deadline task fired by the shard's timer queue at `fire_at_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimerTask {
    WorkflowTimeout {
        key: ExecutionKey,
        fire_at_ms: u64,
    },
    DecisionTimeout {
        key: ExecutionKey,
        schedule_id: u64,
        fire_at_ms: u64,
    },
    /// Covers schedule-to-start, schedule-to-close, start-to-close, and
    /// heartbeat deadlines; the processor re-reads state to pick the tightest.
    ActivityTimeout {
        key: ExecutionKey,
        schedule_id: u64,
        fire_at_ms: u64,
    },
    /// Re-dispatch of a retrying activity after its back-off.
    ActivityRetry {
        key: ExecutionKey,
        schedule_id: u64,
        attempt: i32,
        fire_at_ms: u64,
    },
    UserTimer {
        key: ExecutionKey,
        timer_id: String,
        fire_at_ms: u64,
    },
    /// Delayed decision schedule (attempt back-off, cron first decision).
    DelayedDecision {
        key: ExecutionKey,
        fire_at_ms: u64,
    },
}

/// Atomic creation package for a brand-new run.
#[derive(Debug, Clone)]
pub struct CreateWorkflowRequest {
    pub snapshot: WorkflowSnapshot,
    pub events: Vec<HistoryEvent>,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
}

/// Atomic mutation package for an existing run.
///
/// `condition` is the next-event-id the mutable state was loaded at; the store
/// must reject the update with [`StoreError::ConditionFailed`] when the stored
/// record has moved past it.
#[derive(Debug, Clone)]
pub struct WorkflowMutation {
    pub key: ExecutionKey,
    pub condition: u64,
    pub snapshot: WorkflowSnapshot,
    pub events: Vec<HistoryEvent>,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
}

/// The current-run index entry for a workflow id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentExecution {
    pub run_id: String,
    pub state: WorkflowState,
    pub status: WorkflowStatus,
    pub start_request_id: String,
}

/// Transactional persistence interface.
///
/// # Contract
///
/// - `create_workflow_execution` installs the snapshot, its first event batch,
///   and its side-effect tasks atomically, and points the current-run index at
///   the new run. If the index already holds an open run for the workflow id,
///   it fails with [`StoreError::CurrentRunConflict`] without writing.
/// - `update_workflow_execution` applies a [`WorkflowMutation`] atomically
///   under the optimistic-concurrency condition. Events were already appended
///   to the history branch by `append_history_events`; the update persists the
///   snapshot and tasks, and refreshes the current-run index state/status.
/// - `append_history_events` appends a batch to the branch addressed by the
///   snapshot's branch token. Appends may survive a failed update (the event
///   store is append-only; orphaned tails are invisible because the execution
///   record's next-event-id never advanced).
/// - All operations are safe for concurrent use; per-execution ordering is the
///   engine's responsibility (cache lease), not the store's.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowRequest,
    ) -> Result<(), StoreError>;

    async fn get_workflow_execution(
        &self,
        key: &ExecutionKey,
    ) -> Result<WorkflowSnapshot, StoreError>;

    async fn update_workflow_execution(&self, mutation: WorkflowMutation)
        -> Result<(), StoreError>;

    async fn get_current_execution(
        &self,
        namespace_id: &str,
        workflow_id: &str,
    ) -> Result<CurrentExecution, StoreError>;

    async fn append_history_events(
        &self,
        branch_token: &[u8],
        events: Vec<HistoryEvent>,
    ) -> Result<(), StoreError>;

    async fn read_history_branch(
        &self,
        branch_token: &[u8],
    ) -> Result<Vec<HistoryEvent>, StoreError>;
}
