//! QueryWorkflow: consistent-query buffering, worker answers through decision
//! completion, unblocked fallback, rejection conditions, and guards.

use std::time::{Duration, Instant};

use chronik::engine::{
    QueryConsistencyLevel, QueryRejectCondition, QueryWorkflowRequest, QueryWorkflowResponse,
    RespondDecisionTaskCompletedRequest,
};
use chronik::query::{QueryResult, WorkflowQuery};
use chronik::{Decision, EngineConfig, EngineError, WorkflowStatus};

mod common;
use common::{TestHarness, IDENTITY, NAMESPACE};

fn query_request(key: &chronik::ExecutionKey, level: QueryConsistencyLevel) -> QueryWorkflowRequest {
    QueryWorkflowRequest {
        namespace_id: NAMESPACE.into(),
        workflow_id: key.workflow_id.clone(),
        run_id: Some(key.run_id.clone()),
        query: WorkflowQuery {
            query_type: "current-state".into(),
            query_args: String::new(),
        },
        reject_condition: None,
        consistency_level: level,
        timeout: Some(Duration::from_secs(10)),
    }
}

/// Start a workflow, complete its first decision, then schedule and start a
/// second decision (the shape consistent queries wait behind).
async fn workflow_with_second_decision_started(
    harness: &TestHarness,
    workflow_id: &str,
) -> chronik::ExecutionKey {
    let key = harness.start_workflow(workflow_id).await;
    harness.run_decision(&key, vec![]).await;
    harness
        .engine
        .schedule_decision_task(&key)
        .await
        .expect("schedule second decision");
    harness.start_decision(&key).await;
    key
}

#[tokio::test]
async fn strong_query_completed_by_worker_answer() {
    let harness = TestHarness::new();
    let key = workflow_with_second_decision_started(&harness, "wf-query-answer").await;

    let engine = harness.engine.clone();
    let querier_key = key.clone();
    let querier = tokio::spawn(async move {
        let started = Instant::now();
        let response = engine
            .query_workflow(query_request(&querier_key, QueryConsistencyLevel::Strong))
            .await;
        (response, started.elapsed())
    });

    // Worker answers through the decision completion after 2s.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let registry = harness.engine.query_registry(&key);
    let buffered = registry.buffered_ids();
    assert_eq!(buffered.len(), 1, "query must be buffered while waiting");
    let schedule_id = harness.current_decision_schedule_id(&key).await;
    harness
        .engine
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            namespace_id: NAMESPACE.into(),
            task_token: harness.decision_token(&key, schedule_id),
            identity: IDENTITY.into(),
            query_results: [(buffered[0], QueryResult::answered("[1,2,3]"))]
                .into_iter()
                .collect(),
            ..Default::default()
        })
        .await
        .expect("decision completion with query results");

    let (response, elapsed) = querier.await.expect("querier task");
    match response.expect("query result") {
        QueryWorkflowResponse::Result(result) => assert_eq!(result.answer, "[1,2,3]"),
        other => panic!("unexpected response: {other:?}"),
    }
    assert!(elapsed >= Duration::from_secs(1), "query answered too early");
    assert!(!registry.has_buffered_query());
    assert!(!registry.has_completed_query());
}

#[tokio::test]
async fn strong_query_unblocked_falls_back_to_matching() {
    let harness = TestHarness::new();
    let key = workflow_with_second_decision_started(&harness, "wf-query-unblock").await;
    harness
        .matching
        .push_query_response(Ok(QueryResult::answered("direct-answer")));

    let engine = harness.engine.clone();
    let querier_key = key.clone();
    let querier = tokio::spawn(async move {
        engine
            .query_workflow(query_request(&querier_key, QueryConsistencyLevel::Strong))
            .await
    });

    // The decision completes without answering; the buffered query unblocks
    // and is dispatched directly on the task list.
    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.complete_decision(&key, vec![]).await;

    match querier.await.expect("querier task").expect("query result") {
        QueryWorkflowResponse::Result(result) => assert_eq!(result.answer, "direct-answer"),
        other => panic!("unexpected response: {other:?}"),
    }
    assert_eq!(harness.matching.query_requests().len(), 1);
}

#[tokio::test]
async fn strong_query_buffer_full_is_rejected_without_state_change() {
    let harness = TestHarness::with_config(EngineConfig {
        consistent_query_buffer_size: 1,
        ..EngineConfig::default()
    });
    let key = workflow_with_second_decision_started(&harness, "wf-query-full").await;

    // Pre-buffer one query to fill the bound.
    let registry = harness.engine.query_registry(&key);
    let (_id, _rx) = registry
        .buffer(
            WorkflowQuery {
                query_type: "occupied".into(),
                query_args: String::new(),
            },
            1,
        )
        .expect("pre-buffer");
    let history_before = harness.history(&key).await;

    let err = harness
        .engine
        .query_workflow(query_request(&key, QueryConsistencyLevel::Strong))
        .await
        .expect_err("buffer is full");
    assert_eq!(err, EngineError::ConsistentQueryBufferExceeded);
    assert_eq!(harness.history(&key).await, history_before);
    assert_eq!(registry.buffered_ids().len(), 1);
}

#[tokio::test]
async fn query_before_first_decision_is_rejected() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-query-early").await;

    let err = harness
        .engine
        .query_workflow(query_request(&key, QueryConsistencyLevel::Strong))
        .await
        .expect_err("no decision has completed");
    assert_eq!(err, EngineError::QueryWorkflowBeforeFirstDecision);
}

#[tokio::test]
async fn strong_query_requires_consistent_query_enabled() {
    let harness = TestHarness::with_config(EngineConfig {
        enable_consistent_query: false,
        ..EngineConfig::default()
    });
    let key = harness.start_workflow("wf-query-disabled").await;

    let err = harness
        .engine
        .query_workflow(query_request(&key, QueryConsistencyLevel::Strong))
        .await
        .expect_err("kill switch is off");
    assert_eq!(err, EngineError::ConsistentQueryNotEnabled);
}

#[tokio::test]
async fn eventual_query_dispatches_directly() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-query-eventual").await;
    harness.run_decision(&key, vec![]).await;
    harness
        .matching
        .push_query_response(Ok(QueryResult::answered("eventual-answer")));

    match harness
        .engine
        .query_workflow(query_request(&key, QueryConsistencyLevel::Eventual))
        .await
        .expect("query result")
    {
        QueryWorkflowResponse::Result(result) => assert_eq!(result.answer, "eventual-answer"),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn closed_workflow_matching_reject_condition_returns_rejected() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-query-rejected").await;
    harness
        .run_decision(
            &key,
            vec![Decision::CompleteWorkflowExecution {
                result: "done".into(),
            }],
        )
        .await;

    let mut request = query_request(&key, QueryConsistencyLevel::Strong);
    request.reject_condition = Some(QueryRejectCondition::NotOpen);
    match harness
        .engine
        .query_workflow(request)
        .await
        .expect("rejection is not an error")
    {
        QueryWorkflowResponse::Rejected { status } => {
            assert_eq!(status, WorkflowStatus::Completed)
        }
        other => panic!("unexpected response: {other:?}"),
    }

    // NotCompletedCleanly does not match a clean completion; the query then
    // proceeds (and times out quickly here with no worker).
    let mut request = query_request(&key, QueryConsistencyLevel::Strong);
    request.reject_condition = Some(QueryRejectCondition::NotCompletedCleanly);
    request.timeout = Some(Duration::from_millis(200));
    let err = harness
        .engine
        .query_workflow(request)
        .await
        .expect_err("no worker will answer");
    assert_eq!(err, EngineError::DeadlineExceeded);
}
