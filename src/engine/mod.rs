//! The per-shard engine facade.
//!
//! Every mutating operation follows the same pipeline: decode and validate
//! the request, acquire the cache lease for the execution, load mutable state,
//! invoke the handler, persist atomically (history append, then the execution
//! record under the optimistic-concurrency condition), retry on conflict with
//! an explicit reload, and publish a history-event notification on success.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{ExecutionLease, HistoryCache};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::matching::MatchingClient;
use crate::namespace::NamespaceRegistry;
use crate::notifier::{HistoryEventNotification, HistoryEventNotifier};
use crate::providers::{CreateWorkflowRequest, ExecutionStore, StoreError, WorkflowMutation};
use crate::query::QueryRegistry;
use crate::state::{MutableState, StateError};
use crate::{ExecutionKey, RetryPolicy, WorkflowState, WorkflowStatus};

mod activity;
mod decision;
mod query;

pub use activity::{
    RespondActivityTaskCanceledRequest, RespondActivityTaskCompletedRequest,
    RespondActivityTaskFailedRequest, RecordActivityTaskHeartbeatRequest,
};
pub use decision::{
    NewDecisionTask, RespondDecisionTaskCompletedRequest, RespondDecisionTaskCompletedResponse,
    RespondDecisionTaskFailedRequest,
};
pub use query::{
    QueryConsistencyLevel, QueryRejectCondition, QueryWorkflowRequest, QueryWorkflowResponse,
};

#[derive(Debug, Clone, Default)]
pub struct StartWorkflowRequest {
    pub namespace_id: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_list: String,
    pub input: String,
    pub execution_timeout_secs: i32,
    pub task_timeout_secs: i32,
    pub identity: String,
    /// Idempotence key: a retried start with the same request id returns the
    /// original run id without creating history.
    pub request_id: String,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: Option<String>,
    pub memo: HashMap<String, String>,
    pub search_attributes: HashMap<String, String>,
    /// Delay before the first decision task (cron-style starts).
    pub first_decision_backoff_secs: i32,
}

/// Read-model projection returned by the mutable-state read paths.
#[derive(Debug, Clone, PartialEq)]
pub struct MutableStateSnapshot {
    pub key: ExecutionKey,
    pub next_event_id: u64,
    pub previous_started_event_id: u64,
    pub branch_token: Vec<u8>,
    pub workflow_state: WorkflowState,
    pub workflow_status: WorkflowStatus,
    pub task_list: String,
    pub sticky_task_list: Option<String>,
    pub workflow_type: String,
    pub execution_timeout_secs: i32,
    pub task_timeout_secs: i32,
}

#[derive(Debug, Clone, Default)]
pub struct PollMutableStateRequest {
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: String,
    /// Return immediately once next-event-id reaches this value; `None` means
    /// return the current snapshot right away.
    pub expected_next_event_id: Option<u64>,
    pub current_branch_token: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

pub struct HistoryEngine {
    shard_id: u32,
    config: Arc<EngineConfig>,
    store: Arc<dyn ExecutionStore>,
    matching: Arc<dyn MatchingClient>,
    namespaces: Arc<dyn NamespaceRegistry>,
    cache: Arc<HistoryCache>,
    notifier: Arc<HistoryEventNotifier>,
}

impl HistoryEngine {
    pub fn new(
        shard_id: u32,
        config: Arc<EngineConfig>,
        store: Arc<dyn ExecutionStore>,
        matching: Arc<dyn MatchingClient>,
        namespaces: Arc<dyn NamespaceRegistry>,
    ) -> Arc<Self> {
        // Best-effort default subscriber; embedders that installed their own
        // win the race and this is a no-op.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        Arc::new(Self {
            shard_id,
            cache: Arc::new(HistoryCache::new(config.cache_max_size)),
            notifier: Arc::new(HistoryEventNotifier::new(config.notifier_shard_count)),
            config,
            store,
            matching,
            namespaces,
        })
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn notifier(&self) -> Arc<HistoryEventNotifier> {
        self.notifier.clone()
    }

    /// The per-execution query registry (in-memory only).
    pub fn query_registry(&self, key: &ExecutionKey) -> Arc<QueryRegistry> {
        self.cache.context(key).queries()
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn matching(&self) -> &Arc<dyn MatchingClient> {
        &self.matching
    }

    pub(crate) fn namespaces(&self) -> &Arc<dyn NamespaceRegistry> {
        &self.namespaces
    }

    // ---- start -----------------------------------------------------------

    pub async fn start_workflow_execution(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<String, EngineError> {
        if request.workflow_id.is_empty() {
            return Err(EngineError::InvalidArgument("workflow id is required".into()));
        }
        if request.workflow_type.is_empty() {
            return Err(EngineError::InvalidArgument("workflow type is required".into()));
        }
        if request.task_list.is_empty() {
            return Err(EngineError::InvalidArgument("task list is required".into()));
        }
        if request.request_id.is_empty() {
            return Err(EngineError::InvalidArgument("request id is required".into()));
        }
        if request.execution_timeout_secs <= 0 || request.task_timeout_secs <= 0 {
            return Err(EngineError::InvalidArgument(
                "execution and task timeouts must be positive".into(),
            ));
        }

        let run_id = Uuid::new_v4().to_string();
        let key = ExecutionKey::new(&request.namespace_id, &request.workflow_id, &run_id);
        let mut state = MutableState::new(key.clone());
        state.add_workflow_execution_started_event(
            request.workflow_type.clone(),
            request.task_list.clone(),
            request.input.clone(),
            request.execution_timeout_secs,
            request.task_timeout_secs,
            request.identity.clone(),
            request.request_id.clone(),
            None,
            request.first_decision_backoff_secs,
        )?;
        let backoff = (request.first_decision_backoff_secs > 0)
            .then(|| Duration::from_secs(request.first_decision_backoff_secs as u64));
        state.add_decision_task_scheduled_event(backoff)?;
        let txn = state.close_transaction();

        match self
            .store
            .create_workflow_execution(CreateWorkflowRequest {
                snapshot: txn.snapshot.clone(),
                events: txn.events,
                transfer_tasks: txn.transfer_tasks,
                timer_tasks: txn.timer_tasks,
            })
            .await
        {
            Ok(()) => {}
            Err(StoreError::CurrentRunConflict {
                workflow_id,
                run_id: existing_run_id,
                start_request_id,
            }) => {
                // Idempotent start: same request id maps to the prior run.
                if start_request_id == request.request_id {
                    debug!(workflow_id = %workflow_id, run_id = %existing_run_id, "duplicate start request");
                    return Ok(existing_run_id);
                }
                return Err(EngineError::WorkflowExecutionAlreadyStarted {
                    workflow_id,
                    run_id: existing_run_id,
                    start_request_id,
                });
            }
            Err(other) => return Err(other.into()),
        }

        // Warm the cache and announce the first events.
        let mut lease = self.cache.acquire(&key).await;
        lease.set_state(state);
        self.publish(&txn.snapshot.info.key, txn.condition, &txn.snapshot);
        drop(lease);

        debug!(execution = %key, "started workflow execution");
        Ok(run_id)
    }

    // ---- generic mutate-with-retry --------------------------------------

    /// Run `action` against loaded mutable state and persist the result,
    /// reloading and retrying on optimistic-concurrency conflicts up to the
    /// configured bound.
    pub(crate) async fn update_execution<T>(
        &self,
        key: &ExecutionKey,
        mut action: impl FnMut(&mut MutableState) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut lease = self.cache.acquire(key).await;
        let result = self.update_execution_locked(key, &mut lease, &mut action).await;
        if result.is_err() {
            lease.invalidate();
        }
        result
    }

    async fn update_execution_locked<T>(
        &self,
        key: &ExecutionKey,
        lease: &mut ExecutionLease,
        action: &mut impl FnMut(&mut MutableState) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        for attempt in 0..self.config.conditional_retry_count {
            if lease.state().is_none() {
                let snapshot = self
                    .with_store_retry("get_workflow_execution", || {
                        self.store.get_workflow_execution(key)
                    })
                    .await?;
                lease.set_state(MutableState::from_snapshot(snapshot));
            }
            let state = lease.state_mut().expect("state loaded above");
            let value = action(state)?;
            let txn = state.close_transaction();

            if !txn.events.is_empty() {
                self.with_store_retry("append_history_events", || {
                    self.store
                        .append_history_events(&txn.snapshot.info.branch_token, txn.events.clone())
                })
                .await?;
            }
            let mutation = WorkflowMutation {
                key: key.clone(),
                condition: txn.condition,
                snapshot: txn.snapshot.clone(),
                events: txn.events.clone(),
                transfer_tasks: txn.transfer_tasks.clone(),
                timer_tasks: txn.timer_tasks.clone(),
            };
            match self.store.update_workflow_execution(mutation).await {
                Ok(()) => {
                    self.publish(key, txn.condition, &txn.snapshot);
                    return Ok(value);
                }
                Err(StoreError::ConditionFailed) => {
                    warn!(
                        execution = %key,
                        attempt,
                        "optimistic concurrency conflict, reloading mutable state"
                    );
                    lease.invalidate();
                    continue;
                }
                Err(other) if other.is_retryable() => {
                    // One more pass through the bounded store retry.
                    let mutation = WorkflowMutation {
                        key: key.clone(),
                        condition: txn.condition,
                        snapshot: txn.snapshot.clone(),
                        events: txn.events.clone(),
                        transfer_tasks: txn.transfer_tasks.clone(),
                        timer_tasks: txn.timer_tasks.clone(),
                    };
                    self.with_store_retry("update_workflow_execution", || {
                        self.store.update_workflow_execution(mutation.clone())
                    })
                    .await?;
                    self.publish(key, txn.condition, &txn.snapshot);
                    return Ok(value);
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    fn publish(&self, key: &ExecutionKey, previous_next_event_id: u64, snapshot: &crate::state::WorkflowSnapshot) {
        self.notifier
            .notify_new_history_event(HistoryEventNotification {
                key: key.clone(),
                previous_next_event_id,
                next_event_id: snapshot.info.next_event_id,
                branch_token: snapshot.info.branch_token.clone(),
                workflow_state: snapshot.info.state,
                workflow_status: snapshot.info.status,
            });
    }

    /// Bounded exponential back-off over retryable store errors.
    pub(crate) async fn with_store_retry<T, F, Fut>(
        &self,
        operation: &str,
        mut f: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut backoff = self.config.store_retry_initial_backoff;
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    if attempt >= self.config.store_retry_max_attempts {
                        return Err(EngineError::ServiceUnavailable(format!(
                            "{operation}: {err}"
                        )));
                    }
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    // ---- read paths ------------------------------------------------------

    /// Resolve the run id through the current-execution index when absent.
    pub(crate) async fn resolve_run_id(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Result<String, EngineError> {
        match run_id {
            Some(run_id) if !run_id.is_empty() => Ok(run_id.to_string()),
            _ => {
                let current = self
                    .with_store_retry("get_current_execution", || {
                        self.store.get_current_execution(namespace_id, workflow_id)
                    })
                    .await?;
                Ok(current.run_id)
            }
        }
    }

    pub(crate) async fn load_snapshot(
        &self,
        key: &ExecutionKey,
    ) -> Result<MutableStateSnapshot, EngineError> {
        let mut lease = self.cache.acquire(key).await;
        if lease.state().is_none() {
            let snapshot = self
                .with_store_retry("get_workflow_execution", || {
                    self.store.get_workflow_execution(key)
                })
                .await?;
            lease.set_state(MutableState::from_snapshot(snapshot));
        }
        let state = lease.state().expect("state loaded above");
        Ok(Self::snapshot_of(state))
    }

    fn snapshot_of(state: &MutableState) -> MutableStateSnapshot {
        let info = state.info();
        MutableStateSnapshot {
            key: info.key.clone(),
            next_event_id: info.next_event_id,
            previous_started_event_id: info.last_processed_event_id,
            branch_token: info.branch_token.clone(),
            workflow_state: info.state,
            workflow_status: info.status,
            task_list: info.task_list.clone(),
            sticky_task_list: info.sticky_task_list.clone(),
            workflow_type: info.workflow_type.clone(),
            execution_timeout_secs: info.execution_timeout_secs,
            task_timeout_secs: info.task_timeout_secs,
        }
    }

    pub async fn get_mutable_state(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Result<MutableStateSnapshot, EngineError> {
        let run_id = self.resolve_run_id(namespace_id, workflow_id, run_id).await?;
        let key = ExecutionKey::new(namespace_id, workflow_id, run_id);
        self.load_snapshot(&key).await
    }

    /// Long-poll variant: waits until the execution's next-event-id reaches
    /// `expected_next_event_id` or its branch changes. On timeout, returns the
    /// latest snapshot without error.
    pub async fn poll_mutable_state(
        &self,
        request: PollMutableStateRequest,
    ) -> Result<MutableStateSnapshot, EngineError> {
        let run_id = self
            .resolve_run_id(
                &request.namespace_id,
                &request.workflow_id,
                Some(request.run_id.as_str()).filter(|r| !r.is_empty()),
            )
            .await?;
        let key = ExecutionKey::new(&request.namespace_id, &request.workflow_id, run_id);

        // Subscribe before the snapshot read so no notification can slip
        // between the two; unsubscribed on every exit by the guard.
        let (subscriber_id, mut receiver) = self.notifier.subscribe(&key);
        let _guard = UnsubscribeGuard {
            notifier: self.notifier.as_ref(),
            key: &key,
            id: subscriber_id,
        };

        let snapshot = self.load_snapshot(&key).await?;
        let Some(expected) = request.expected_next_event_id else {
            return Ok(snapshot);
        };
        // The caller waits for the event with id `expected` to exist, which
        // is the case once next-event-id moves past it.
        if snapshot.next_event_id > expected {
            return Ok(snapshot);
        }
        if let Some(branch) = &request.current_branch_token {
            if *branch != snapshot.branch_token {
                return Ok(snapshot);
            }
        }

        let timeout = request
            .timeout
            .unwrap_or(self.config.long_poll_default_timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notification =
                match tokio::time::timeout_at(deadline, receiver.recv()).await {
                    Ok(Some(notification)) => notification,
                    // Timeout (or a torn-down channel): latest snapshot, no error.
                    _ => return self.load_snapshot(&key).await,
                };
            if notification.next_event_id > expected {
                return self.load_snapshot(&key).await;
            }
            if notification.branch_token != snapshot.branch_token {
                // The branch moved under the poller (reset or replication
                // divergence); the snapshot is enough for it to re-read.
                return Ok(snapshot);
            }
        }
    }

    // ---- signal / cancel / terminate ------------------------------------

    pub async fn signal_workflow_execution(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: Option<&str>,
        signal_name: &str,
        input: &str,
        identity: &str,
        request_id: Option<&str>,
    ) -> Result<(), EngineError> {
        if signal_name.is_empty() {
            return Err(EngineError::InvalidArgument("signal name is required".into()));
        }
        let run_id = self.resolve_run_id(namespace_id, workflow_id, run_id).await?;
        let key = ExecutionKey::new(namespace_id, workflow_id, run_id);
        let signal_name = signal_name.to_string();
        let input = input.to_string();
        let identity = identity.to_string();
        let request_id = request_id.map(str::to_string);

        self.update_execution(&key, move |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            let appended = state.add_workflow_execution_signaled_event(
                signal_name.clone(),
                input.clone(),
                identity.clone(),
                request_id.clone(),
            )?;
            if appended.is_some() && !state.has_pending_decision() {
                state.add_decision_task_scheduled_event(None)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn remove_signal_mutable_state(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: &str,
        request_id: &str,
    ) -> Result<(), EngineError> {
        let key = ExecutionKey::new(namespace_id, workflow_id, run_id);
        let request_id = request_id.to_string();
        self.update_execution(&key, move |state| {
            state.remove_signal_request_id(&request_id);
            Ok(())
        })
        .await
    }

    pub async fn request_cancel_workflow_execution(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: Option<&str>,
        cause: &str,
        identity: &str,
    ) -> Result<(), EngineError> {
        let run_id = self.resolve_run_id(namespace_id, workflow_id, run_id).await?;
        let key = ExecutionKey::new(namespace_id, workflow_id, run_id);
        let cause = cause.to_string();
        let identity = identity.to_string();
        self.update_execution(&key, move |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            let appended = state
                .add_workflow_execution_cancel_requested_event(cause.clone(), identity.clone())?;
            if appended.is_some() && !state.has_pending_decision() {
                state.add_decision_task_scheduled_event(None)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn terminate_workflow_execution(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: Option<&str>,
        reason: &str,
        details: &str,
        identity: &str,
    ) -> Result<(), EngineError> {
        let run_id = self.resolve_run_id(namespace_id, workflow_id, run_id).await?;
        let key = ExecutionKey::new(namespace_id, workflow_id, run_id);
        let reason = reason.to_string();
        let details = details.to_string();
        let identity = identity.to_string();
        self.update_execution(&key, move |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            state.add_workflow_execution_terminated_event(
                reason.clone(),
                details.clone(),
                identity.clone(),
            )?;
            Ok(())
        })
        .await
    }

    // ---- collaborator-only operations -----------------------------------

    /// Transfer-queue collaborator: ensure a decision task is scheduled.
    pub async fn schedule_decision_task(&self, key: &ExecutionKey) -> Result<(), EngineError> {
        self.update_execution(key, |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            if !state.has_pending_decision() {
                state.add_decision_task_scheduled_event(None)?;
            }
            Ok(())
        })
        .await
    }

    /// Matching collaborator: a worker picked up the decision task.
    pub async fn record_decision_task_started(
        &self,
        key: &ExecutionKey,
        schedule_id: u64,
        request_id: &str,
        identity: &str,
    ) -> Result<MutableStateSnapshot, EngineError> {
        let request_id = request_id.to_string();
        let identity = identity.to_string();
        self.update_execution(key, move |state| {
            state
                .add_decision_task_started_event(schedule_id, request_id.clone(), identity.clone())
                .map_err(map_decision_state_error)?;
            Ok(Self::snapshot_of(state))
        })
        .await
    }

    /// Matching collaborator: a worker picked up the activity task.
    pub async fn record_activity_task_started(
        &self,
        key: &ExecutionKey,
        schedule_id: u64,
        request_id: &str,
        identity: &str,
    ) -> Result<(), EngineError> {
        let request_id = request_id.to_string();
        let identity = identity.to_string();
        self.update_execution(key, move |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            state
                .add_activity_task_started_event(schedule_id, request_id.clone(), identity.clone())
                .map_err(map_activity_state_error)?;
            Ok(())
        })
        .await
    }

    /// Timer-queue collaborator: a user timer reached its expiry.
    pub async fn record_timer_fired(
        &self,
        key: &ExecutionKey,
        timer_id: &str,
    ) -> Result<(), EngineError> {
        let timer_id = timer_id.to_string();
        self.update_execution(key, move |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            match state.add_timer_fired_event(&timer_id) {
                Ok(()) => {}
                // Canceled before firing: the stale task is a no-op.
                Err(StateError::TimerNotFound(_)) => return Ok(()),
                Err(other) => return Err(other.into()),
            }
            if !state.has_pending_decision() {
                state.add_decision_task_scheduled_event(None)?;
            }
            Ok(())
        })
        .await
    }

    /// Timer-queue collaborator: an activity retry back-off elapsed.
    pub async fn record_activity_retry_timer_fired(
        &self,
        key: &ExecutionKey,
        schedule_id: u64,
    ) -> Result<(), EngineError> {
        self.update_execution(key, move |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            match state.on_activity_retry_timer_fired(schedule_id) {
                Ok(()) => Ok(()),
                Err(StateError::ActivityNotFound(_)) => Ok(()),
                Err(other) => Err(other.into()),
            }
        })
        .await
    }

    /// Transfer-queue collaborator: the child workflow was started.
    pub async fn record_child_execution_started(
        &self,
        key: &ExecutionKey,
        initiated_id: u64,
        child_run_id: &str,
    ) -> Result<(), EngineError> {
        let child_run_id = child_run_id.to_string();
        self.update_execution(key, move |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            state
                .add_child_workflow_started_event(initiated_id, child_run_id.clone())
                .map_err(EngineError::from)?;
            if !state.has_pending_decision() {
                state.add_decision_task_scheduled_event(None)?;
            }
            Ok(())
        })
        .await
    }

    /// Transfer-queue collaborator: the child workflow closed.
    pub async fn record_child_execution_completed(
        &self,
        key: &ExecutionKey,
        initiated_id: u64,
        result: Result<String, (String, String)>,
    ) -> Result<(), EngineError> {
        self.update_execution(key, move |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            state
                .add_child_workflow_completed_event(initiated_id, result.clone())
                .map_err(EngineError::from)?;
            if !state.has_pending_decision() {
                state.add_decision_task_scheduled_event(None)?;
            }
            Ok(())
        })
        .await
    }

    /// Cross-cluster collaborator: the external signal was delivered (or not).
    pub async fn record_signal_external_resolved(
        &self,
        key: &ExecutionKey,
        initiated_id: u64,
        failure_cause: Option<String>,
    ) -> Result<(), EngineError> {
        self.update_execution(key, move |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            state
                .resolve_signal_external(initiated_id, failure_cause.clone())
                .map_err(EngineError::from)?;
            if !state.has_pending_decision() {
                state.add_decision_task_scheduled_event(None)?;
            }
            Ok(())
        })
        .await
    }

    /// Cross-cluster collaborator: the external cancel was delivered (or not).
    pub async fn record_request_cancel_resolved(
        &self,
        key: &ExecutionKey,
        initiated_id: u64,
        failure_cause: Option<String>,
    ) -> Result<(), EngineError> {
        self.update_execution(key, move |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            state
                .resolve_request_cancel_external(initiated_id, failure_cause.clone())
                .map_err(EngineError::from)?;
            if !state.has_pending_decision() {
                state.add_decision_task_scheduled_event(None)?;
            }
            Ok(())
        })
        .await
    }
}

/// Decision-token mismatches are stale tasks, surfaced as not-found.
pub(crate) fn map_decision_state_error(err: StateError) -> EngineError {
    match err {
        StateError::DecisionStale { .. }
        | StateError::DecisionNotPending
        | StateError::DecisionNotStarted => EngineError::stale_task("decision task"),
        other => other.into(),
    }
}

/// Activity lookups that miss are stale tasks, surfaced as not-found.
pub(crate) fn map_activity_state_error(err: StateError) -> EngineError {
    match err {
        StateError::ActivityNotFound(id) | StateError::ActivityNotStarted(id) => {
            EngineError::NotFound(format!("activity task {id} is no longer current"))
        }
        StateError::ActivityAlreadyStarted(id) => {
            EngineError::NotFound(format!("activity task {id} already started"))
        }
        other => other.into(),
    }
}

struct UnsubscribeGuard<'a> {
    notifier: &'a HistoryEventNotifier,
    key: &'a ExecutionKey,
    id: u64,
}

impl Drop for UnsubscribeGuard<'_> {
    fn drop(&mut self) {
        self.notifier.unsubscribe(self.key, self.id);
    }
}
