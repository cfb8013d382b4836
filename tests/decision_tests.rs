//! Decision task completion: sub-decision application, timeout derivation,
//! conflict retry, bad attributes, bad binaries, and the heartbeat budget.

use std::time::Duration;

use chronik::engine::RespondDecisionTaskCompletedRequest;
use chronik::error::ErrorKind;
use chronik::namespace::NamespaceEntry;
use chronik::providers::{ExecutionStore, TransferTask};
use chronik::{
    ContinueAsNewWorkflowAttributes, Decision, EngineConfig, EngineError,
    ScheduleActivityTaskAttributes, WorkflowStatus, EMPTY_EVENT_ID,
};

mod common;
use common::{TestHarness, IDENTITY, NAMESPACE};

fn schedule_activity(activity_id: &str) -> Decision {
    Decision::ScheduleActivityTask(ScheduleActivityTaskAttributes {
        activity_id: activity_id.into(),
        activity_type: "test-activity-type".into(),
        task_list: common::TASK_LIST.into(),
        input: "activity-input".into(),
        schedule_to_close_timeout_secs: 100,
        schedule_to_start_timeout_secs: 10,
        start_to_close_timeout_secs: 50,
        heartbeat_timeout_secs: 5,
        retry_policy: None,
    })
}

#[tokio::test]
async fn completion_with_activity_schedule_survives_conflict() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-decision-conflict").await;
    harness.start_decision(&key).await;

    // First persistence attempt conflicts; the engine reloads and retries.
    harness.conflicts.fail_next_updates(1);
    harness
        .complete_decision(&key, vec![schedule_activity("activity-1")])
        .await;

    let snapshot = harness.snapshot(&key).await;
    assert_eq!(snapshot.info.next_event_id, 6);
    assert_eq!(snapshot.info.last_processed_event_id, 3);
    assert_eq!(snapshot.info.decision.schedule_id, EMPTY_EVENT_ID);

    let activity = &snapshot.pending_activities[0];
    assert_eq!(activity.schedule_id, 5);
    assert_eq!(activity.schedule_to_close_timeout_secs, 100);
    assert_eq!(activity.schedule_to_start_timeout_secs, 10);
    assert_eq!(activity.start_to_close_timeout_secs, 50);
    assert_eq!(activity.heartbeat_timeout_secs, 5);

    let types = harness.history_types(&key).await;
    assert_eq!(
        types,
        vec![
            "WorkflowExecutionStarted",
            "DecisionTaskScheduled",
            "DecisionTaskStarted",
            "DecisionTaskCompleted",
            "ActivityTaskScheduled",
        ]
    );
    // The new activity is on its way to matching.
    assert!(harness
        .store
        .transfer_tasks()
        .await
        .iter()
        .any(|t| matches!(t, TransferTask::ActivityTask { schedule_id: 5, .. })));
}

#[tokio::test]
async fn all_zero_activity_timeouts_fail_the_decision() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-decision-badattrs").await;
    harness.start_decision(&key).await;

    let bad = Decision::ScheduleActivityTask(ScheduleActivityTaskAttributes {
        activity_id: "activity-1".into(),
        activity_type: "test-activity-type".into(),
        ..Default::default()
    });
    harness.complete_decision(&key, vec![bad]).await;

    let snapshot = harness.snapshot(&key).await;
    // The decision failed instead of completing, and was rescheduled.
    assert_eq!(snapshot.info.last_processed_event_id, EMPTY_EVENT_ID);
    assert_ne!(snapshot.info.decision.schedule_id, EMPTY_EVENT_ID);
    assert_eq!(snapshot.info.decision.attempt, 1);
    assert!(snapshot.pending_activities.is_empty());

    let types = harness.history_types(&key).await;
    assert_eq!(
        types,
        vec![
            "WorkflowExecutionStarted",
            "DecisionTaskScheduled",
            "DecisionTaskStarted",
            "DecisionTaskFailed",
            "DecisionTaskScheduled",
        ]
    );
}

#[tokio::test]
async fn no_decision_in_batch_applies_after_bad_sub_decision() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-decision-atomic").await;
    harness.start_decision(&key).await;

    let bad = Decision::StartTimer {
        timer_id: "t1".into(),
        start_to_fire_timeout_secs: -5,
    };
    // A valid schedule before the bad timer must not survive.
    harness
        .complete_decision(&key, vec![schedule_activity("activity-1"), bad])
        .await;

    let snapshot = harness.snapshot(&key).await;
    assert!(snapshot.pending_activities.is_empty());
    assert!(snapshot.pending_timers.is_empty());
    let types = harness.history_types(&key).await;
    assert!(types.contains(&"DecisionTaskFailed"));
    assert!(!types.contains(&"ActivityTaskScheduled"));
}

#[tokio::test]
async fn bad_binary_fails_decision_and_marks_reset_eligible() {
    let harness = TestHarness::new();
    let mut namespace = NamespaceEntry::with_defaults(NAMESPACE);
    namespace.bad_binaries.insert("bad-checksum".into());
    harness.namespaces.insert(namespace);

    let key = harness.start_workflow("wf-decision-badbinary").await;
    let schedule_id = harness.start_decision(&key).await;

    harness
        .engine
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            namespace_id: NAMESPACE.into(),
            task_token: harness.decision_token(&key, schedule_id),
            decisions: vec![Decision::CompleteWorkflowExecution {
                result: "done".into(),
            }],
            identity: IDENTITY.into(),
            binary_checksum: "bad-checksum".into(),
            ..Default::default()
        })
        .await
        .expect("bad binary fails the decision, not the call");

    let snapshot = harness.snapshot(&key).await;
    assert!(snapshot.info.reset_eligible);
    assert_eq!(snapshot.info.status, WorkflowStatus::Running);
    assert!(harness
        .history_types(&key)
        .await
        .contains(&"DecisionTaskFailed"));
}

#[tokio::test]
async fn stale_decision_token_is_not_found() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-decision-stale").await;
    harness.start_decision(&key).await;

    let err = harness
        .engine
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            namespace_id: NAMESPACE.into(),
            task_token: harness.decision_token(&key, 99),
            identity: IDENTITY.into(),
            ..Default::default()
        })
        .await
        .expect_err("stale token must be rejected");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn heartbeat_within_budget_returns_new_decision() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-decision-heartbeat-ok").await;
    let schedule_id = harness.start_decision(&key).await;

    let response = harness
        .engine
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            namespace_id: NAMESPACE.into(),
            task_token: harness.decision_token(&key, schedule_id),
            identity: IDENTITY.into(),
            force_create_new_decision_task: true,
            ..Default::default()
        })
        .await
        .expect("heartbeat completion");

    let new_decision = response.new_decision_task.expect("fresh decision attached");
    assert_eq!(new_decision.schedule_id, 5);
    let snapshot = harness.snapshot(&key).await;
    assert_eq!(snapshot.info.decision.schedule_id, 5);
}

#[tokio::test]
async fn heartbeat_over_budget_is_rejected_with_timeout() {
    let harness = TestHarness::with_config(EngineConfig {
        decision_heartbeat_budget: Duration::from_millis(1),
        ..EngineConfig::default()
    });
    let key = harness.start_workflow("wf-decision-heartbeat-late").await;
    let schedule_id = harness.start_decision(&key).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = harness
        .engine
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            namespace_id: NAMESPACE.into(),
            task_token: harness.decision_token(&key, schedule_id),
            identity: IDENTITY.into(),
            force_create_new_decision_task: true,
            ..Default::default()
        })
        .await
        .expect_err("over-budget heartbeat must time out");
    assert_eq!(err, EngineError::DeadlineExceeded);

    // The decision timed out on record and a fresh one was scheduled.
    let types = harness.history_types(&key).await;
    assert!(types.contains(&"DecisionTaskTimedOut"));
    let snapshot = harness.snapshot(&key).await;
    assert_ne!(snapshot.info.decision.schedule_id, EMPTY_EVENT_ID);
}

#[tokio::test]
async fn continue_as_new_closes_run_and_starts_successor() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-decision-can").await;
    harness.start_decision(&key).await;

    harness
        .complete_decision(
            &key,
            vec![Decision::ContinueAsNewWorkflowExecution(
                ContinueAsNewWorkflowAttributes {
                    workflow_type: "test-workflow-type".into(),
                    input: "next-input".into(),
                    ..Default::default()
                },
            )],
        )
        .await;

    let old = harness.snapshot(&key).await;
    assert_eq!(old.info.status, WorkflowStatus::ContinuedAsNew);

    let current = harness
        .store
        .get_current_execution(NAMESPACE, &key.workflow_id)
        .await
        .expect("current execution");
    assert_ne!(current.run_id, key.run_id);
    assert_eq!(current.status, WorkflowStatus::Running);

    let new_key =
        chronik::ExecutionKey::new(NAMESPACE, key.workflow_id.clone(), current.run_id.clone());
    let types = harness.history_types(&new_key).await;
    assert_eq!(types, vec!["WorkflowExecutionStarted", "DecisionTaskScheduled"]);
}

#[tokio::test]
async fn sub_decision_after_terminal_fails_decision() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-decision-unhandled").await;
    harness.start_decision(&key).await;

    harness
        .complete_decision(
            &key,
            vec![
                Decision::CompleteWorkflowExecution {
                    result: "done".into(),
                },
                schedule_activity("too-late"),
            ],
        )
        .await;

    let snapshot = harness.snapshot(&key).await;
    // The whole batch was rejected; the workflow is still running.
    assert_eq!(snapshot.info.status, WorkflowStatus::Running);
    assert!(harness
        .history_types(&key)
        .await
        .contains(&"DecisionTaskFailed"));
}

#[tokio::test]
async fn buffered_signal_flushes_after_completion_and_schedules_decision() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-decision-buffered").await;
    harness.start_decision(&key).await;

    // Arrives mid-decision: buffered, not appended.
    harness
        .engine
        .signal_workflow_execution(
            NAMESPACE,
            &key.workflow_id,
            Some(&key.run_id),
            "signal-name",
            "payload",
            "signaler",
            None,
        )
        .await
        .expect("signal");
    let mid = harness.history_types(&key).await;
    assert!(!mid.contains(&"WorkflowExecutionSignaled"));

    harness.complete_decision(&key, vec![]).await;

    let types = harness.history_types(&key).await;
    assert_eq!(
        types,
        vec![
            "WorkflowExecutionStarted",
            "DecisionTaskScheduled",
            "DecisionTaskStarted",
            "DecisionTaskCompleted",
            "WorkflowExecutionSignaled",
            // Scheduled to consume the flushed signal.
            "DecisionTaskScheduled",
        ]
    );
    let snapshot = harness.snapshot(&key).await;
    assert_ne!(snapshot.info.decision.schedule_id, EMPTY_EVENT_ID);
}

#[tokio::test]
async fn exhausted_conflict_retries_surface_resource_exhaustion() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-decision-exhausted").await;
    harness.start_decision(&key).await;
    let schedule_id = harness.current_decision_schedule_id(&key).await;

    harness.conflicts.fail_next_updates(usize::MAX / 2);
    let err = harness
        .engine
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            namespace_id: NAMESPACE.into(),
            task_token: harness.decision_token(&key, schedule_id),
            identity: IDENTITY.into(),
            ..Default::default()
        })
        .await
        .expect_err("retries must exhaust");
    assert_eq!(err, EngineError::MaxAttemptsExceeded);
    harness.conflicts.fail_next_updates(0);
}
