//! Shared test harness: an engine wired to the in-memory store, the recording
//! matching client, and a static namespace registry, plus helpers to walk an
//! execution through the standard start → decision lifecycle.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chronik::engine::{HistoryEngine, RespondDecisionTaskCompletedRequest};
use chronik::matching::RecordingMatchingClient;
use chronik::namespace::StaticNamespaceRegistry;
use chronik::providers::in_memory::InMemoryExecutionStore;
use chronik::providers::{
    CreateWorkflowRequest, CurrentExecution, ExecutionStore, StoreError, WorkflowMutation,
};
use chronik::state::WorkflowSnapshot;
use chronik::{
    Decision, EngineConfig, ExecutionKey, HistoryEvent, StartWorkflowRequest, TaskToken,
};

pub const NAMESPACE: &str = "test-namespace";
pub const TASK_LIST: &str = "test-task-list";
pub const IDENTITY: &str = "test-worker";

/// Store wrapper that fails the next N `update_workflow_execution` calls with
/// `ConditionFailed`, for exercising the engine's reload-and-retry loop.
pub struct ConflictInjectingStore {
    inner: Arc<InMemoryExecutionStore>,
    fail_updates: AtomicUsize,
}

impl ConflictInjectingStore {
    pub fn new(inner: Arc<InMemoryExecutionStore>) -> Self {
        Self {
            inner,
            fail_updates: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_updates(&self, count: usize) {
        self.fail_updates.store(count, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ExecutionStore for ConflictInjectingStore {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowRequest,
    ) -> Result<(), StoreError> {
        self.inner.create_workflow_execution(request).await
    }

    async fn get_workflow_execution(
        &self,
        key: &ExecutionKey,
    ) -> Result<WorkflowSnapshot, StoreError> {
        self.inner.get_workflow_execution(key).await
    }

    async fn update_workflow_execution(
        &self,
        mutation: WorkflowMutation,
    ) -> Result<(), StoreError> {
        let remaining = self.fail_updates.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .fail_updates
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StoreError::ConditionFailed);
        }
        self.inner.update_workflow_execution(mutation).await
    }

    async fn get_current_execution(
        &self,
        namespace_id: &str,
        workflow_id: &str,
    ) -> Result<CurrentExecution, StoreError> {
        self.inner.get_current_execution(namespace_id, workflow_id).await
    }

    async fn append_history_events(
        &self,
        branch_token: &[u8],
        events: Vec<HistoryEvent>,
    ) -> Result<(), StoreError> {
        self.inner.append_history_events(branch_token, events).await
    }

    async fn read_history_branch(
        &self,
        branch_token: &[u8],
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        self.inner.read_history_branch(branch_token).await
    }
}

pub struct TestHarness {
    pub engine: Arc<HistoryEngine>,
    pub store: Arc<InMemoryExecutionStore>,
    pub conflicts: Arc<ConflictInjectingStore>,
    pub matching: Arc<RecordingMatchingClient>,
    pub namespaces: Arc<StaticNamespaceRegistry>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryExecutionStore::default());
        let conflicts = Arc::new(ConflictInjectingStore::new(store.clone()));
        let matching = Arc::new(RecordingMatchingClient::default());
        let namespaces = Arc::new(StaticNamespaceRegistry::default());
        let engine = HistoryEngine::new(
            1,
            Arc::new(config),
            conflicts.clone(),
            matching.clone(),
            namespaces.clone(),
        );
        Self {
            engine,
            store,
            conflicts,
            matching,
            namespaces,
        }
    }

    /// Start a workflow with the standard fixture parameters (execution
    /// timeout 100s, task timeout 10s) and return its key.
    pub async fn start_workflow(&self, workflow_id: &str) -> ExecutionKey {
        let run_id = self
            .engine
            .start_workflow_execution(StartWorkflowRequest {
                namespace_id: NAMESPACE.into(),
                workflow_id: workflow_id.into(),
                workflow_type: "test-workflow-type".into(),
                task_list: TASK_LIST.into(),
                input: "input".into(),
                execution_timeout_secs: 100,
                task_timeout_secs: 10,
                identity: IDENTITY.into(),
                request_id: format!("start-{workflow_id}"),
                ..Default::default()
            })
            .await
            .expect("start workflow");
        ExecutionKey::new(NAMESPACE, workflow_id, run_id)
    }

    /// Current decision schedule id read back from the store.
    pub async fn current_decision_schedule_id(&self, key: &ExecutionKey) -> u64 {
        let snapshot = self
            .store
            .get_workflow_execution(key)
            .await
            .expect("execution in store");
        snapshot.info.decision.schedule_id
    }

    pub async fn snapshot(&self, key: &ExecutionKey) -> WorkflowSnapshot {
        self.store
            .get_workflow_execution(key)
            .await
            .expect("execution in store")
    }

    pub async fn history(&self, key: &ExecutionKey) -> Vec<HistoryEvent> {
        let snapshot = self.snapshot(key).await;
        self.store
            .read_history_branch(&snapshot.info.branch_token)
            .await
            .expect("history branch")
    }

    pub async fn history_types(&self, key: &ExecutionKey) -> Vec<&'static str> {
        self.history(key).await.iter().map(|e| e.type_name()).collect()
    }

    pub fn decision_token(&self, key: &ExecutionKey, schedule_id: u64) -> Vec<u8> {
        TaskToken::for_schedule(&key.workflow_id, &key.run_id, schedule_id, 0).serialize()
    }

    pub fn activity_token(&self, key: &ExecutionKey, schedule_id: u64) -> Vec<u8> {
        TaskToken::for_schedule(&key.workflow_id, &key.run_id, schedule_id, 0).serialize()
    }

    /// Drive the currently scheduled decision into the Started state.
    pub async fn start_decision(&self, key: &ExecutionKey) -> u64 {
        let schedule_id = self.current_decision_schedule_id(key).await;
        assert_ne!(schedule_id, 0, "no decision is scheduled");
        self.engine
            .record_decision_task_started(key, schedule_id, &format!("poll-{schedule_id}"), IDENTITY)
            .await
            .expect("record decision started");
        schedule_id
    }

    /// Complete the currently started decision with the given sub-decisions.
    pub async fn complete_decision(&self, key: &ExecutionKey, decisions: Vec<Decision>) {
        let schedule_id = self.current_decision_schedule_id(key).await;
        self.engine
            .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
                namespace_id: NAMESPACE.into(),
                task_token: self.decision_token(key, schedule_id),
                decisions,
                identity: IDENTITY.into(),
                ..Default::default()
            })
            .await
            .expect("complete decision");
    }

    /// Start the pending decision and complete it in one go.
    pub async fn run_decision(&self, key: &ExecutionKey, decisions: Vec<Decision>) {
        self.start_decision(key).await;
        self.complete_decision(key, decisions).await;
    }
}
