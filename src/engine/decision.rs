//! Decision task completion and failure.
//!
//! A completed decision carries the token, an ordered list of sub-decisions,
//! optional query results, and the worker's binary checksum. Sub-decisions
//! are applied on a scratch copy of mutable state so a bad sub-decision can
//! fail the decision task without committing any of the batch.

use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{map_decision_state_error, HistoryEngine};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::query::{QueryId, QueryResult, QueryTerminationState};
use crate::state::{MutableState, StateError};
use crate::token::{TaskToken, TokenRouting};
use crate::{
    ContinueAsNewWorkflowAttributes, Decision, DecisionFailCause, EventKind, ExecutionKey,
};

#[derive(Debug, Clone, Default)]
pub struct RespondDecisionTaskCompletedRequest {
    pub namespace_id: String,
    pub task_token: Vec<u8>,
    pub decisions: Vec<Decision>,
    pub identity: String,
    pub binary_checksum: String,
    /// Answers to buffered consistent queries, keyed by registry id.
    pub query_results: HashMap<QueryId, QueryResult>,
    /// Decision heartbeat: schedule a fresh decision for the same worker even
    /// though no events require one.
    pub force_create_new_decision_task: bool,
    /// Attach the newly scheduled decision to the response (sticky dispatch).
    pub return_new_decision_task: bool,
    pub sticky_task_list: Option<String>,
    pub sticky_schedule_to_start_timeout_secs: i32,
}

#[derive(Debug, Clone)]
pub struct RespondDecisionTaskFailedRequest {
    pub namespace_id: String,
    pub task_token: Vec<u8>,
    pub cause: DecisionFailCause,
    pub details: String,
    pub identity: String,
}

/// The decision scheduled as part of handling a completion, for the worker
/// that asked to keep going.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDecisionTask {
    pub schedule_id: u64,
    pub attempt: i32,
    pub task_list: String,
    pub task_token: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RespondDecisionTaskCompletedResponse {
    pub new_decision_task: Option<NewDecisionTask>,
}

enum CompletionOutcome {
    Completed,
    DecisionFailed(DecisionFailCause),
    HeartbeatTimedOut,
}

/// Fields of the continued-as-new event needed to start the successor run.
struct ContinuedRun {
    new_run_id: String,
    workflow_type: String,
    task_list: String,
    input: String,
    execution_timeout_secs: i32,
    task_timeout_secs: i32,
}

impl HistoryEngine {
    pub async fn respond_decision_task_completed(
        &self,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<RespondDecisionTaskCompletedResponse, EngineError> {
        let token = TaskToken::deserialize(&request.task_token)?;
        let TokenRouting::Schedule { schedule_id } = token.routing else {
            return Err(EngineError::InvalidArgument(
                "decision task token must carry a schedule id".into(),
            ));
        };
        let run_id = token.run_id.clone().ok_or_else(|| {
            EngineError::InvalidArgument("decision task token must carry a run id".into())
        })?;
        let key = ExecutionKey::new(&request.namespace_id, &token.workflow_id, run_id);

        let namespace = self.namespaces().get(&request.namespace_id).await?;
        let bad_binary = !request.binary_checksum.is_empty()
            && namespace.bad_binaries.contains(&request.binary_checksum);
        let heartbeat_budget = self.config().decision_heartbeat_budget;

        let mut continued_run: Option<ContinuedRun> = None;
        let mut new_decision: Option<NewDecisionTask> = None;

        let outcome = self
            .update_execution(&key, |state| {
                continued_run = None;
                new_decision = None;

                if !state.is_running() {
                    return Err(EngineError::NotFound(
                        "workflow execution already completed".into(),
                    ));
                }
                state
                    .check_decision_token(schedule_id)
                    .map_err(map_decision_state_error)?;

                if request.force_create_new_decision_task
                    && state.check_decision_heartbeat(heartbeat_budget).is_err()
                {
                    warn!(execution = %state.key(), "decision heartbeat budget exceeded");
                    state.add_decision_task_timed_out_event()?;
                    state.add_decision_task_scheduled_event(None)?;
                    return Ok(CompletionOutcome::HeartbeatTimedOut);
                }

                if bad_binary {
                    warn!(
                        execution = %state.key(),
                        checksum = %request.binary_checksum,
                        "failing decision from bad binary"
                    );
                    state.add_decision_task_failed_event(
                        DecisionFailCause::BadBinary,
                        format!("binary {} is in the bad-binaries list", request.binary_checksum),
                        request.identity.clone(),
                    )?;
                    schedule_next_decision(state, self.config())?;
                    return Ok(CompletionOutcome::DecisionFailed(DecisionFailCause::BadBinary));
                }

                // Apply on a scratch copy: a bad sub-decision must not commit
                // any part of the batch.
                let mut scratch = state.clone();
                let completed = scratch
                    .add_decision_task_completed_event(
                        request.identity.clone(),
                        request.binary_checksum.clone(),
                    )
                    .map_err(map_decision_state_error)?;
                match apply_decisions(
                    &mut scratch,
                    completed.event_id,
                    &request.decisions,
                    &mut continued_run,
                ) {
                    Ok(()) => {
                        *state = scratch;
                        state.dispatch_parked_activities();

                        if let Some(sticky) = &request.sticky_task_list {
                            state.set_sticky_task_list(
                                Some(sticky.clone()),
                                request.sticky_schedule_to_start_timeout_secs,
                            );
                        }
                        let needs_new_decision = state.is_running()
                            && !state.has_pending_decision()
                            && (state.buffered_events_flushed()
                                || request.force_create_new_decision_task);
                        if needs_new_decision {
                            let schedule_id = state.add_decision_task_scheduled_event(None)?;
                            let info = state.info();
                            new_decision = Some(NewDecisionTask {
                                schedule_id,
                                attempt: info.decision.attempt,
                                task_list: info.decision.task_list.clone(),
                                task_token: TaskToken::for_schedule(
                                    &info.key.workflow_id,
                                    &info.key.run_id,
                                    schedule_id,
                                    info.decision.attempt,
                                )
                                .serialize(),
                            });
                        }
                        Ok(CompletionOutcome::Completed)
                    }
                    Err(state_err) => match state_err.fail_cause() {
                        Some(cause) => {
                            debug!(
                                execution = %state.key(),
                                cause = ?cause,
                                error = %state_err,
                                "failing decision from bad sub-decision attributes"
                            );
                            state.add_decision_task_failed_event(
                                cause,
                                state_err.to_string(),
                                request.identity.clone(),
                            )?;
                            schedule_next_decision(state, self.config())?;
                            Ok(CompletionOutcome::DecisionFailed(cause))
                        }
                        None => Err(map_decision_state_error(state_err)),
                    },
                }
            })
            .await?;

        match outcome {
            CompletionOutcome::HeartbeatTimedOut => Err(EngineError::DeadlineExceeded),
            CompletionOutcome::DecisionFailed(_) => {
                Ok(RespondDecisionTaskCompletedResponse::default())
            }
            CompletionOutcome::Completed => {
                if let Some(continued) = continued_run {
                    self.start_continued_run(&key, continued).await?;
                }
                self.complete_queries(&key, request.query_results);

                let new_decision_task = (request.force_create_new_decision_task
                    || request.return_new_decision_task)
                    .then_some(new_decision)
                    .flatten();
                Ok(RespondDecisionTaskCompletedResponse { new_decision_task })
            }
        }
    }

    pub async fn respond_decision_task_failed(
        &self,
        request: RespondDecisionTaskFailedRequest,
    ) -> Result<(), EngineError> {
        let token = TaskToken::deserialize(&request.task_token)?;
        let TokenRouting::Schedule { schedule_id } = token.routing else {
            return Err(EngineError::InvalidArgument(
                "decision task token must carry a schedule id".into(),
            ));
        };
        let run_id = token.run_id.clone().ok_or_else(|| {
            EngineError::InvalidArgument("decision task token must carry a run id".into())
        })?;
        let key = ExecutionKey::new(&request.namespace_id, &token.workflow_id, run_id);

        self.update_execution(&key, |state| {
            if !state.is_running() {
                return Err(EngineError::NotFound(
                    "workflow execution already completed".into(),
                ));
            }
            state
                .check_decision_token(schedule_id)
                .map_err(map_decision_state_error)?;
            state.add_decision_task_failed_event(
                request.cause,
                request.details.clone(),
                request.identity.clone(),
            )?;
            schedule_next_decision(state, self.config())?;
            Ok(())
        })
        .await
    }

    /// Terminate buffered queries after a decision completion: answered ones
    /// complete, the rest unblock for direct dispatch through matching.
    fn complete_queries(&self, key: &ExecutionKey, results: HashMap<QueryId, QueryResult>) {
        let registry = self.query_registry(key);
        for (id, result) in results {
            if let Err(err) =
                registry.set_termination_state(id, QueryTerminationState::Completed(result))
            {
                debug!(execution = %key, query = id, error = %err, "stale query result dropped");
            }
        }
        for id in registry.buffered_ids() {
            let _ = registry.set_termination_state(id, QueryTerminationState::Unblocked);
        }
    }

    async fn start_continued_run(
        &self,
        old_key: &ExecutionKey,
        continued: ContinuedRun,
    ) -> Result<(), EngineError> {
        let key = ExecutionKey::new(
            &old_key.namespace_id,
            &old_key.workflow_id,
            &continued.new_run_id,
        );
        let mut state = MutableState::new(key.clone());
        state.add_workflow_execution_started_event(
            continued.workflow_type,
            continued.task_list,
            continued.input,
            continued.execution_timeout_secs,
            continued.task_timeout_secs,
            String::new(),
            Uuid::new_v4().to_string(),
            Some(old_key.run_id.clone()),
            0,
        )?;
        state.add_decision_task_scheduled_event(None)?;
        let txn = state.close_transaction();
        self.with_store_retry("create_workflow_execution", || {
            self.store
                .create_workflow_execution(crate::providers::CreateWorkflowRequest {
                    snapshot: txn.snapshot.clone(),
                    events: txn.events.clone(),
                    transfer_tasks: txn.transfer_tasks.clone(),
                    timer_tasks: txn.timer_tasks.clone(),
                })
        })
        .await?;

        let mut lease = self.cache.acquire(&key).await;
        lease.set_state(state);
        drop(lease);
        debug!(execution = %key, continued_from = %old_key.run_id, "continued workflow as new run");
        Ok(())
    }
}

/// Schedule the follow-up decision after a failure, applying attempt back-off
/// past the configured threshold.
fn schedule_next_decision(
    state: &mut MutableState,
    config: &EngineConfig,
) -> Result<(), StateError> {
    if !state.is_running() || state.has_pending_decision() {
        return Ok(());
    }
    let backoff = (state.info().decision.attempt > config.decision_attempt_backoff_threshold)
        .then_some(config.decision_attempt_backoff);
    state.add_decision_task_scheduled_event(backoff)?;
    Ok(())
}

/// Apply the ordered sub-decisions. The first violation aborts the batch.
fn apply_decisions(
    state: &mut MutableState,
    decision_completed_event_id: u64,
    decisions: &[Decision],
    continued_run: &mut Option<ContinuedRun>,
) -> Result<(), StateError> {
    for decision in decisions {
        if !state.is_running() {
            return Err(StateError::UnhandledDecision);
        }
        match decision {
            Decision::ScheduleActivityTask(attributes) => {
                state.add_activity_task_scheduled_event(decision_completed_event_id, attributes)?;
            }
            Decision::RequestCancelActivityTask { activity_id } => {
                state.add_activity_task_cancel_requested_event(
                    decision_completed_event_id,
                    activity_id,
                )?;
            }
            Decision::StartTimer {
                timer_id,
                start_to_fire_timeout_secs,
            } => {
                state.add_timer_started_event(
                    decision_completed_event_id,
                    timer_id,
                    *start_to_fire_timeout_secs,
                )?;
            }
            Decision::CancelTimer { timer_id } => {
                state.add_timer_canceled_event(
                    decision_completed_event_id,
                    timer_id,
                    String::new(),
                )?;
            }
            Decision::CompleteWorkflowExecution { result } => {
                state.add_workflow_execution_completed_event(
                    decision_completed_event_id,
                    result.clone(),
                )?;
            }
            Decision::FailWorkflowExecution { reason, details } => {
                state.add_workflow_execution_failed_event(
                    decision_completed_event_id,
                    reason.clone(),
                    details.clone(),
                )?;
            }
            Decision::CancelWorkflowExecution { details } => {
                state.add_workflow_execution_canceled_event(
                    decision_completed_event_id,
                    details.clone(),
                )?;
            }
            Decision::ContinueAsNewWorkflowExecution(attributes) => {
                let new_run_id = Uuid::new_v4().to_string();
                let event = state.add_continued_as_new_event(
                    decision_completed_event_id,
                    new_run_id,
                    attributes,
                )?;
                *continued_run = Some(continued_run_from_event(&event.kind, attributes));
            }
            Decision::SignalExternalWorkflowExecution(attributes) => {
                state.add_signal_external_initiated_event(
                    decision_completed_event_id,
                    attributes,
                    Uuid::new_v4().to_string(),
                )?;
            }
            Decision::RequestCancelExternalWorkflowExecution {
                namespace,
                workflow_id,
                run_id,
                control,
            } => {
                state.add_request_cancel_external_initiated_event(
                    decision_completed_event_id,
                    namespace,
                    workflow_id,
                    run_id,
                    control.clone(),
                    Uuid::new_v4().to_string(),
                )?;
            }
            Decision::StartChildWorkflowExecution(attributes) => {
                state.add_child_workflow_initiated_event(decision_completed_event_id, attributes)?;
            }
            Decision::UpsertWorkflowSearchAttributes { search_attributes } => {
                state.add_upsert_search_attributes_event(
                    decision_completed_event_id,
                    search_attributes.clone(),
                )?;
            }
            Decision::RecordMarker {
                marker_name,
                details,
            } => {
                state.add_marker_recorded_event(
                    decision_completed_event_id,
                    marker_name,
                    details.clone(),
                )?;
            }
        }
    }
    Ok(())
}

fn continued_run_from_event(
    kind: &EventKind,
    attributes: &ContinueAsNewWorkflowAttributes,
) -> ContinuedRun {
    match kind {
        EventKind::WorkflowExecutionContinuedAsNew {
            new_run_id,
            workflow_type,
            task_list,
            input,
            execution_timeout_secs,
            task_timeout_secs,
            ..
        } => ContinuedRun {
            new_run_id: new_run_id.clone(),
            workflow_type: workflow_type.clone(),
            task_list: task_list.clone(),
            input: input.clone(),
            execution_timeout_secs: *execution_timeout_secs,
            task_timeout_secs: *task_timeout_secs,
        },
        // add_continued_as_new_event only produces the variant above.
        _ => ContinuedRun {
            new_run_id: Uuid::new_v4().to_string(),
            workflow_type: attributes.workflow_type.clone(),
            task_list: attributes.task_list.clone(),
            input: attributes.input.clone(),
            execution_timeout_secs: attributes.execution_timeout_secs,
            task_timeout_secs: attributes.task_timeout_secs,
        },
    }
}
