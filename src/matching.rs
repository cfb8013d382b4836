//! Contract with the matching service (external task-list dispatcher).
//!
//! The engine pushes decision, activity, and query tasks at matching; workers
//! pull them from matching's own queues, which are out of scope here.

use crate::query::{QueryResult, WorkflowQuery};
use crate::{EngineError, ExecutionKey};
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct AddDecisionTaskRequest {
    pub key: ExecutionKey,
    pub task_list: String,
    pub schedule_id: u64,
    pub task_token: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddActivityTaskRequest {
    pub key: ExecutionKey,
    pub task_list: String,
    pub schedule_id: u64,
    pub schedule_to_start_timeout_secs: i32,
    pub task_token: Vec<u8>,
}

/// Direct query dispatch, used for eventual consistency and for strong-query
/// fallback when the worker did not answer through a decision.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryWorkflowTaskRequest {
    pub key: ExecutionKey,
    pub task_list: String,
    pub query: WorkflowQuery,
}

#[async_trait]
pub trait MatchingClient: Send + Sync {
    async fn add_decision_task(&self, request: AddDecisionTaskRequest) -> Result<(), EngineError>;

    async fn add_activity_task(&self, request: AddActivityTaskRequest) -> Result<(), EngineError>;

    /// Dispatch a query on the task list and wait for the worker's answer.
    async fn query_workflow(
        &self,
        request: QueryWorkflowTaskRequest,
    ) -> Result<QueryResult, EngineError>;
}

/// Test double: records pushed tasks and answers queries from a scripted
/// response queue (empty queue answers with an echo of the query type).
#[derive(Default)]
pub struct RecordingMatchingClient {
    decision_tasks: Mutex<Vec<AddDecisionTaskRequest>>,
    activity_tasks: Mutex<Vec<AddActivityTaskRequest>>,
    query_requests: Mutex<Vec<QueryWorkflowTaskRequest>>,
    query_responses: Mutex<Vec<Result<QueryResult, EngineError>>>,
}

impl RecordingMatchingClient {
    pub fn decision_tasks(&self) -> Vec<AddDecisionTaskRequest> {
        self.decision_tasks.lock().expect("matching mutex").clone()
    }

    pub fn activity_tasks(&self) -> Vec<AddActivityTaskRequest> {
        self.activity_tasks.lock().expect("matching mutex").clone()
    }

    pub fn query_requests(&self) -> Vec<QueryWorkflowTaskRequest> {
        self.query_requests.lock().expect("matching mutex").clone()
    }

    /// Queue the next `query_workflow` outcome.
    pub fn push_query_response(&self, response: Result<QueryResult, EngineError>) {
        self.query_responses
            .lock()
            .expect("matching mutex")
            .push(response);
    }
}

#[async_trait]
impl MatchingClient for RecordingMatchingClient {
    async fn add_decision_task(&self, request: AddDecisionTaskRequest) -> Result<(), EngineError> {
        self.decision_tasks.lock().expect("matching mutex").push(request);
        Ok(())
    }

    async fn add_activity_task(&self, request: AddActivityTaskRequest) -> Result<(), EngineError> {
        self.activity_tasks.lock().expect("matching mutex").push(request);
        Ok(())
    }

    async fn query_workflow(
        &self,
        request: QueryWorkflowTaskRequest,
    ) -> Result<QueryResult, EngineError> {
        let scripted = {
            let mut responses = self.query_responses.lock().expect("matching mutex");
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        };
        let echo = QueryResult::answered(format!("echo:{}", request.query.query_type));
        self.query_requests.lock().expect("matching mutex").push(request);
        scripted.unwrap_or(Ok(echo))
    }
}
