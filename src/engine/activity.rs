//! Activity task completion, failure, cancellation, and heartbeat.
//!
//! Tokens come in two shapes: full (workflow id, run id, schedule id) and
//! by-id (workflow id, activity id), where the run is resolved through the
//! current-execution record. Every path verifies the activity is Started
//! before applying the worker's report.

use tracing::debug;

use super::{map_activity_state_error, HistoryEngine};
use crate::error::EngineError;
use crate::state::{ActivityFailureOutcome, MutableState};
use crate::token::{TaskToken, TokenRouting};
use crate::ExecutionKey;

#[derive(Debug, Clone, Default)]
pub struct RespondActivityTaskCompletedRequest {
    pub namespace_id: String,
    pub task_token: Vec<u8>,
    pub result: String,
    pub identity: String,
}

#[derive(Debug, Clone, Default)]
pub struct RespondActivityTaskFailedRequest {
    pub namespace_id: String,
    pub task_token: Vec<u8>,
    pub reason: String,
    pub details: String,
    pub identity: String,
}

#[derive(Debug, Clone, Default)]
pub struct RespondActivityTaskCanceledRequest {
    pub namespace_id: String,
    pub task_token: Vec<u8>,
    pub details: String,
    pub identity: String,
}

#[derive(Debug, Clone, Default)]
pub struct RecordActivityTaskHeartbeatRequest {
    pub namespace_id: String,
    pub task_token: Vec<u8>,
    pub details: String,
    pub identity: String,
}

impl HistoryEngine {
    async fn resolve_activity_token(
        &self,
        namespace_id: &str,
        token: &TaskToken,
    ) -> Result<(ExecutionKey, TokenRouting), EngineError> {
        let run_id = match &token.run_id {
            Some(run_id) => run_id.clone(),
            None => {
                self.resolve_run_id(namespace_id, &token.workflow_id, None)
                    .await?
            }
        };
        let key = ExecutionKey::new(namespace_id, &token.workflow_id, run_id);
        Ok((key, token.routing.clone()))
    }

    /// Locate the schedule id within loaded state for either token shape.
    fn locate_activity(
        state: &MutableState,
        routing: &TokenRouting,
    ) -> Result<u64, EngineError> {
        match routing {
            TokenRouting::Schedule { schedule_id } => Ok(*schedule_id),
            TokenRouting::ActivityId { activity_id } => state
                .pending_activity_by_id(activity_id)
                .map(|a| a.schedule_id)
                .ok_or_else(|| {
                    EngineError::NotFound(format!(
                        "activity task {activity_id} is no longer current"
                    ))
                }),
        }
    }

    pub async fn respond_activity_task_completed(
        &self,
        request: RespondActivityTaskCompletedRequest,
    ) -> Result<(), EngineError> {
        let token = TaskToken::deserialize(&request.task_token)?;
        let (key, routing) = self
            .resolve_activity_token(&request.namespace_id, &token)
            .await?;

        self.update_execution(&key, |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            let schedule_id = Self::locate_activity(state, &routing)?;
            state
                .add_activity_task_completed_event(
                    schedule_id,
                    request.result.clone(),
                    request.identity.clone(),
                )
                .map_err(map_activity_state_error)?;
            if !state.has_pending_decision() {
                state.add_decision_task_scheduled_event(None)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn respond_activity_task_failed(
        &self,
        request: RespondActivityTaskFailedRequest,
    ) -> Result<(), EngineError> {
        let token = TaskToken::deserialize(&request.task_token)?;
        let (key, routing) = self
            .resolve_activity_token(&request.namespace_id, &token)
            .await?;

        self.update_execution(&key, |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            let schedule_id = Self::locate_activity(state, &routing)?;
            let outcome = state
                .record_activity_task_failure(
                    schedule_id,
                    request.reason.clone(),
                    request.details.clone(),
                    request.identity.clone(),
                )
                .map_err(map_activity_state_error)?;
            match outcome {
                ActivityFailureOutcome::Retrying { backoff_secs } => {
                    debug!(
                        execution = %state.key(),
                        schedule_id,
                        backoff_secs,
                        "activity failure absorbed by retry policy"
                    );
                }
                ActivityFailureOutcome::Failed => {
                    if !state.has_pending_decision() {
                        state.add_decision_task_scheduled_event(None)?;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn respond_activity_task_canceled(
        &self,
        request: RespondActivityTaskCanceledRequest,
    ) -> Result<(), EngineError> {
        let token = TaskToken::deserialize(&request.task_token)?;
        let (key, routing) = self
            .resolve_activity_token(&request.namespace_id, &token)
            .await?;

        self.update_execution(&key, |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            let schedule_id = Self::locate_activity(state, &routing)?;
            state
                .add_activity_task_canceled_event(
                    schedule_id,
                    request.details.clone(),
                    request.identity.clone(),
                )
                .map_err(map_activity_state_error)?;
            if !state.has_pending_decision() {
                state.add_decision_task_scheduled_event(None)?;
            }
            Ok(())
        })
        .await
    }

    /// Record progress. No event is appended; the response tells the worker
    /// whether a cancel has been requested for the activity.
    pub async fn record_activity_task_heartbeat(
        &self,
        request: RecordActivityTaskHeartbeatRequest,
    ) -> Result<bool, EngineError> {
        let token = TaskToken::deserialize(&request.task_token)?;
        let (key, routing) = self
            .resolve_activity_token(&request.namespace_id, &token)
            .await?;

        self.update_execution(&key, |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            let schedule_id = Self::locate_activity(state, &routing)?;
            state
                .record_activity_heartbeat(schedule_id, request.details.clone())
                .map_err(map_activity_state_error)
        })
        .await
    }
}
