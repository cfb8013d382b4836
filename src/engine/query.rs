//! QueryWorkflow: consistent (strong) and eventual query paths.
//!
//! Strong consistency buffers the query in the per-execution registry and
//! waits on its completion channel — with the mutable-state lease released —
//! until a worker answers through a decision, the query is unblocked for
//! direct dispatch, or the deadline passes.

use std::time::Duration;
use tracing::debug;

use super::HistoryEngine;
use crate::error::EngineError;
use crate::matching::QueryWorkflowTaskRequest;
use crate::query::{QueryResult, QueryResultType, QueryTerminationState, WorkflowQuery};
use crate::{ExecutionKey, WorkflowStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRejectCondition {
    /// Reject when the workflow is no longer open.
    NotOpen,
    /// Reject when the workflow closed with anything but Completed.
    NotCompletedCleanly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryConsistencyLevel {
    Eventual,
    Strong,
}

#[derive(Debug, Clone)]
pub struct QueryWorkflowRequest {
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub query: WorkflowQuery,
    pub reject_condition: Option<QueryRejectCondition>,
    pub consistency_level: QueryConsistencyLevel,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryWorkflowResponse {
    Result(QueryResult),
    /// The workflow closed and the reject condition matched; not an error.
    Rejected { status: WorkflowStatus },
}

impl HistoryEngine {
    pub async fn query_workflow(
        &self,
        request: QueryWorkflowRequest,
    ) -> Result<QueryWorkflowResponse, EngineError> {
        if request.consistency_level == QueryConsistencyLevel::Strong {
            let namespace = self.namespaces().get(&request.namespace_id).await?;
            if !self.config().enable_consistent_query || !namespace.enable_consistent_query {
                return Err(EngineError::ConsistentQueryNotEnabled);
            }
        }

        let run_id = self
            .resolve_run_id(
                &request.namespace_id,
                &request.workflow_id,
                request.run_id.as_deref(),
            )
            .await?;
        let key = ExecutionKey::new(&request.namespace_id, &request.workflow_id, run_id);
        let snapshot = self.load_snapshot(&key).await?;

        if snapshot.workflow_status.is_terminal() {
            let rejected = match request.reject_condition {
                Some(QueryRejectCondition::NotOpen) => true,
                Some(QueryRejectCondition::NotCompletedCleanly) => {
                    snapshot.workflow_status != WorkflowStatus::Completed
                }
                None => false,
            };
            if rejected {
                return Ok(QueryWorkflowResponse::Rejected {
                    status: snapshot.workflow_status,
                });
            }
        }

        // A workflow with no completed decision has no state a worker could
        // answer from.
        if snapshot.previous_started_event_id == crate::EMPTY_EVENT_ID {
            return Err(EngineError::QueryWorkflowBeforeFirstDecision);
        }

        match request.consistency_level {
            QueryConsistencyLevel::Eventual => {
                self.dispatch_query_direct(&key, &snapshot.task_list, request.query)
                    .await
            }
            QueryConsistencyLevel::Strong => {
                let registry = self.query_registry(&key);
                let (query_id, completion) = registry.buffer(
                    request.query.clone(),
                    self.config().consistent_query_buffer_size,
                )?;
                debug!(execution = %key, query = query_id, "buffered consistent query");

                let timeout = request
                    .timeout
                    .unwrap_or(self.config().long_poll_default_timeout);
                match tokio::time::timeout(timeout, completion).await {
                    Ok(Ok(QueryTerminationState::Completed(result))) => {
                        registry.remove(query_id);
                        query_result_to_response(result)
                    }
                    Ok(Ok(QueryTerminationState::Unblocked)) => {
                        registry.remove(query_id);
                        debug!(execution = %key, query = query_id, "query unblocked, dispatching directly");
                        self.dispatch_query_direct(&key, &snapshot.task_list, request.query)
                            .await
                    }
                    Ok(Ok(QueryTerminationState::Failed(err))) => {
                        registry.remove(query_id);
                        Err(err)
                    }
                    Ok(Err(_closed)) => {
                        registry.remove(query_id);
                        Err(EngineError::ServiceUnavailable(
                            "query completion channel closed".into(),
                        ))
                    }
                    // Deadline: the buffered query stays and is cleared by the
                    // next decision completion.
                    Err(_elapsed) => Err(EngineError::DeadlineExceeded),
                }
            }
        }
    }

    async fn dispatch_query_direct(
        &self,
        key: &ExecutionKey,
        task_list: &str,
        query: WorkflowQuery,
    ) -> Result<QueryWorkflowResponse, EngineError> {
        let result = self
            .matching()
            .query_workflow(QueryWorkflowTaskRequest {
                key: key.clone(),
                task_list: task_list.to_string(),
                query,
            })
            .await?;
        query_result_to_response(result)
    }
}

fn query_result_to_response(result: QueryResult) -> Result<QueryWorkflowResponse, EngineError> {
    match result.result_type {
        QueryResultType::Answered => Ok(QueryWorkflowResponse::Result(result)),
        QueryResultType::Failed => Err(EngineError::InvalidArgument(format!(
            "query failed: {}",
            result.error_message
        ))),
    }
}
