//! In-memory [`ExecutionStore`] used by the test-suites.
//!
//! Faithful to the contract, not to any production backend: updates enforce
//! the optimistic-concurrency condition, creates enforce the current-run
//! index, history is branch-addressed. Task queues are plain vectors the
//! tests inspect directly.

use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{
    CreateWorkflowRequest, CurrentExecution, ExecutionStore, StoreError, TimerTask, TransferTask,
    WorkflowMutation,
};
use crate::state::WorkflowSnapshot;
use crate::{ExecutionKey, HistoryEvent, WorkflowState};

#[derive(Default)]
pub struct InMemoryExecutionStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    executions: HashMap<ExecutionKey, WorkflowSnapshot>,
    // (namespace_id, workflow_id) -> current run
    current: HashMap<(String, String), CurrentExecution>,
    branches: HashMap<Vec<u8>, Vec<HistoryEvent>>,
    transfer_tasks: Vec<TransferTask>,
    timer_tasks: Vec<TimerTask>,
}

impl InMemoryExecutionStore {
    /// Test hook: everything enqueued for the matching service so far.
    pub async fn transfer_tasks(&self) -> Vec<TransferTask> {
        self.inner.lock().await.transfer_tasks.clone()
    }

    /// Test hook: every deadline task enqueued so far.
    pub async fn timer_tasks(&self) -> Vec<TimerTask> {
        self.inner.lock().await.timer_tasks.clone()
    }

    /// Test hook: seed an execution directly, bypassing the create path.
    pub async fn put_execution(&self, snapshot: WorkflowSnapshot, events: Vec<HistoryEvent>) {
        let mut inner = self.inner.lock().await;
        let key = snapshot.info.key.clone();
        let current_key = (key.namespace_id.clone(), key.workflow_id.clone());
        inner.current.insert(
            current_key,
            CurrentExecution {
                run_id: key.run_id.clone(),
                state: snapshot.info.state,
                status: snapshot.info.status,
                start_request_id: snapshot.info.start_request_id.clone(),
            },
        );
        inner
            .branches
            .insert(snapshot.info.branch_token.clone(), events);
        inner.executions.insert(key, snapshot);
    }
}

#[async_trait::async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowRequest,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = request.snapshot.info.key.clone();
        let current_key = (key.namespace_id.clone(), key.workflow_id.clone());

        if let Some(current) = inner.current.get(&current_key) {
            if current.state != WorkflowState::Completed {
                return Err(StoreError::CurrentRunConflict {
                    workflow_id: key.workflow_id.clone(),
                    run_id: current.run_id.clone(),
                    start_request_id: current.start_request_id.clone(),
                });
            }
        }

        inner.current.insert(
            current_key,
            CurrentExecution {
                run_id: key.run_id.clone(),
                state: request.snapshot.info.state,
                status: request.snapshot.info.status,
                start_request_id: request.snapshot.info.start_request_id.clone(),
            },
        );
        inner
            .branches
            .entry(request.snapshot.info.branch_token.clone())
            .or_default()
            .extend(request.events);
        inner.executions.insert(key, request.snapshot);
        inner.transfer_tasks.extend(request.transfer_tasks);
        inner.timer_tasks.extend(request.timer_tasks);
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        key: &ExecutionKey,
    ) -> Result<WorkflowSnapshot, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .executions
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("execution {key}")))
    }

    async fn update_workflow_execution(
        &self,
        mutation: WorkflowMutation,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .executions
            .get(&mutation.key)
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", mutation.key)))?;
        if stored.info.next_event_id != mutation.condition {
            return Err(StoreError::ConditionFailed);
        }

        let current_key = (
            mutation.key.namespace_id.clone(),
            mutation.key.workflow_id.clone(),
        );
        if let Some(current) = inner.current.get_mut(&current_key) {
            if current.run_id == mutation.key.run_id {
                current.state = mutation.snapshot.info.state;
                current.status = mutation.snapshot.info.status;
            }
        }
        inner
            .executions
            .insert(mutation.key.clone(), mutation.snapshot);
        inner.transfer_tasks.extend(mutation.transfer_tasks);
        inner.timer_tasks.extend(mutation.timer_tasks);
        Ok(())
    }

    async fn get_current_execution(
        &self,
        namespace_id: &str,
        workflow_id: &str,
    ) -> Result<CurrentExecution, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .current
            .get(&(namespace_id.to_string(), workflow_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("current execution {namespace_id}/{workflow_id}"))
            })
    }

    async fn append_history_events(
        &self,
        branch_token: &[u8],
        events: Vec<HistoryEvent>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let branch = inner.branches.entry(branch_token.to_vec()).or_default();
        // Overwrite semantics: a retried transaction re-appends the same event
        // ids; the new batch replaces any orphaned tail from a failed update.
        if let Some(first) = events.first() {
            branch.retain(|e| e.event_id < first.event_id);
        }
        branch.extend(events);
        Ok(())
    }

    async fn read_history_branch(
        &self,
        branch_token: &[u8],
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .branches
            .get(branch_token)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("history branch".into()))
    }
}
