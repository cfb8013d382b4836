//! Activity task paths: completion, failure with retry, cancellation,
//! heartbeat, by-id token routing, and terminal-workflow absorption.

use chronik::engine::{
    RecordActivityTaskHeartbeatRequest, RespondActivityTaskCanceledRequest,
    RespondActivityTaskCompletedRequest, RespondActivityTaskFailedRequest,
};
use chronik::error::ErrorKind;
use chronik::providers::{TimerTask, TransferTask};
use chronik::{
    Decision, RetryPolicy, ScheduleActivityTaskAttributes, TaskToken, WorkflowStatus,
    EMPTY_EVENT_ID,
};

mod common;
use common::{TestHarness, IDENTITY, NAMESPACE};

fn schedule_activity(activity_id: &str, retry_policy: Option<RetryPolicy>) -> Decision {
    Decision::ScheduleActivityTask(ScheduleActivityTaskAttributes {
        activity_id: activity_id.into(),
        activity_type: "test-activity-type".into(),
        task_list: common::TASK_LIST.into(),
        input: "activity-input".into(),
        schedule_to_close_timeout_secs: 60,
        schedule_to_start_timeout_secs: 10,
        start_to_close_timeout_secs: 30,
        heartbeat_timeout_secs: 5,
        retry_policy,
    })
}

/// Start a workflow and drive it to one started activity. Returns (key,
/// activity schedule id).
async fn started_activity(
    harness: &TestHarness,
    workflow_id: &str,
    retry_policy: Option<RetryPolicy>,
) -> (chronik::ExecutionKey, u64) {
    let key = harness.start_workflow(workflow_id).await;
    harness
        .run_decision(&key, vec![schedule_activity("activity-1", retry_policy)])
        .await;
    let snapshot = harness.snapshot(&key).await;
    let schedule_id = snapshot.pending_activities[0].schedule_id;
    harness
        .engine
        .record_activity_task_started(&key, schedule_id, "activity-poll", IDENTITY)
        .await
        .expect("record activity started");
    (key, schedule_id)
}

#[tokio::test]
async fn completion_appends_event_and_schedules_decision() {
    let harness = TestHarness::new();
    let (key, schedule_id) = started_activity(&harness, "wf-activity-complete", None).await;

    harness
        .engine
        .respond_activity_task_completed(RespondActivityTaskCompletedRequest {
            namespace_id: NAMESPACE.into(),
            task_token: harness.activity_token(&key, schedule_id),
            result: "activity-result".into(),
            identity: IDENTITY.into(),
        })
        .await
        .expect("activity completion");

    let snapshot = harness.snapshot(&key).await;
    assert!(snapshot.pending_activities.is_empty());
    assert_ne!(snapshot.info.decision.schedule_id, EMPTY_EVENT_ID);
    let types = harness.history_types(&key).await;
    assert!(types.contains(&"ActivityTaskCompleted"));
}

#[tokio::test]
async fn by_id_token_resolves_current_run() {
    let harness = TestHarness::new();
    let (key, _schedule_id) = started_activity(&harness, "wf-activity-byid", None).await;

    let token = TaskToken::for_activity_id(&key.workflow_id, "activity-1", 0).serialize();
    harness
        .engine
        .respond_activity_task_completed(RespondActivityTaskCompletedRequest {
            namespace_id: NAMESPACE.into(),
            task_token: token,
            result: "by-id-result".into(),
            identity: IDENTITY.into(),
        })
        .await
        .expect("by-id completion");
    assert!(harness.snapshot(&key).await.pending_activities.is_empty());
}

#[tokio::test]
async fn completion_on_closed_workflow_is_not_found_and_appends_nothing() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-activity-closed").await;
    harness
        .run_decision(
            &key,
            vec![Decision::CompleteWorkflowExecution {
                result: "done".into(),
            }],
        )
        .await;
    assert_eq!(
        harness.snapshot(&key).await.info.status,
        WorkflowStatus::Completed
    );
    let history_before = harness.history(&key).await;

    let err = harness
        .engine
        .respond_activity_task_completed(RespondActivityTaskCompletedRequest {
            namespace_id: NAMESPACE.into(),
            task_token: harness.activity_token(&key, 5),
            result: "too-late".into(),
            identity: IDENTITY.into(),
        })
        .await
        .expect_err("closed workflow must absorb the report");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(harness.history(&key).await, history_before);
}

#[tokio::test]
async fn failure_with_retry_policy_reschedules_without_event() {
    let harness = TestHarness::new();
    let policy = RetryPolicy {
        initial_interval_secs: 2,
        backoff_coefficient: 2.0,
        max_interval_secs: 60,
        max_attempts: 3,
        expiration_secs: 0,
        non_retryable_reasons: vec!["fatal".into()],
    };
    let (key, schedule_id) =
        started_activity(&harness, "wf-activity-retry", Some(policy)).await;

    harness
        .engine
        .respond_activity_task_failed(RespondActivityTaskFailedRequest {
            namespace_id: NAMESPACE.into(),
            task_token: harness.activity_token(&key, schedule_id),
            reason: "transient".into(),
            details: "boom".into(),
            identity: IDENTITY.into(),
        })
        .await
        .expect("retryable failure");

    let snapshot = harness.snapshot(&key).await;
    let activity = &snapshot.pending_activities[0];
    assert_eq!(activity.attempt, 1);
    assert_eq!(activity.started_id, EMPTY_EVENT_ID);
    assert_eq!(activity.last_failure_reason, "transient");
    // No event, no decision; just the back-off timer.
    assert!(!harness.history_types(&key).await.contains(&"ActivityTaskFailed"));
    assert_eq!(snapshot.info.decision.schedule_id, EMPTY_EVENT_ID);
    assert!(harness
        .store
        .timer_tasks()
        .await
        .iter()
        .any(|t| matches!(t, TimerTask::ActivityRetry { schedule_id: s, attempt: 1, .. } if *s == schedule_id)));

    // The back-off elapses with no decision pending: re-dispatch to matching.
    harness
        .engine
        .record_activity_retry_timer_fired(&key, schedule_id)
        .await
        .expect("retry fire");
    let dispatches = harness
        .store
        .transfer_tasks()
        .await
        .iter()
        .filter(|t| matches!(t, TransferTask::ActivityTask { schedule_id: s, .. } if *s == schedule_id))
        .count();
    assert_eq!(dispatches, 2, "original dispatch plus the retry");
}

#[tokio::test]
async fn non_retryable_failure_appends_event_and_schedules_decision() {
    let harness = TestHarness::new();
    let policy = RetryPolicy {
        initial_interval_secs: 2,
        backoff_coefficient: 2.0,
        max_interval_secs: 60,
        max_attempts: 3,
        expiration_secs: 0,
        non_retryable_reasons: vec!["fatal".into()],
    };
    let (key, schedule_id) =
        started_activity(&harness, "wf-activity-fatal", Some(policy)).await;

    harness
        .engine
        .respond_activity_task_failed(RespondActivityTaskFailedRequest {
            namespace_id: NAMESPACE.into(),
            task_token: harness.activity_token(&key, schedule_id),
            reason: "fatal".into(),
            details: "unrecoverable".into(),
            identity: IDENTITY.into(),
        })
        .await
        .expect("non-retryable failure");

    let snapshot = harness.snapshot(&key).await;
    assert!(snapshot.pending_activities.is_empty());
    assert_ne!(snapshot.info.decision.schedule_id, EMPTY_EVENT_ID);
    assert!(harness
        .history_types(&key)
        .await
        .contains(&"ActivityTaskFailed"));
}

#[tokio::test]
async fn cancel_requested_surfaces_via_heartbeat_then_cancel_completes() {
    let harness = TestHarness::new();
    let (key, schedule_id) = started_activity(&harness, "wf-activity-cancel", None).await;

    // Next decision requests the cancel; the activity is already started so
    // the worker must discover it through its heartbeat.
    harness
        .engine
        .schedule_decision_task(&key)
        .await
        .expect("schedule decision");
    harness
        .run_decision(
            &key,
            vec![Decision::RequestCancelActivityTask {
                activity_id: "activity-1".into(),
            }],
        )
        .await;

    let cancel_requested = harness
        .engine
        .record_activity_task_heartbeat(RecordActivityTaskHeartbeatRequest {
            namespace_id: NAMESPACE.into(),
            task_token: harness.activity_token(&key, schedule_id),
            details: "progress".into(),
            identity: IDENTITY.into(),
        })
        .await
        .expect("heartbeat");
    assert!(cancel_requested);
    // Heartbeats do not append events.
    assert!(!harness
        .history_types(&key)
        .await
        .iter()
        .any(|t| t.starts_with("ActivityTaskHeartbeat")));

    harness
        .engine
        .respond_activity_task_canceled(RespondActivityTaskCanceledRequest {
            namespace_id: NAMESPACE.into(),
            task_token: harness.activity_token(&key, schedule_id),
            details: "canceled by workflow".into(),
            identity: IDENTITY.into(),
        })
        .await
        .expect("cancel report");
    assert!(harness.snapshot(&key).await.pending_activities.is_empty());
    assert!(harness
        .history_types(&key)
        .await
        .contains(&"ActivityTaskCanceled"));
}

#[tokio::test]
async fn cancel_of_unstarted_activity_completes_without_worker() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-activity-cancel-scheduled").await;
    harness
        .run_decision(&key, vec![schedule_activity("activity-1", None)])
        .await;

    // Never dispatched; the cancel decision finishes it on the spot.
    harness
        .engine
        .schedule_decision_task(&key)
        .await
        .expect("schedule decision");
    harness
        .run_decision(
            &key,
            vec![Decision::RequestCancelActivityTask {
                activity_id: "activity-1".into(),
            }],
        )
        .await;

    let snapshot = harness.snapshot(&key).await;
    assert!(snapshot.pending_activities.is_empty());
    let types = harness.history_types(&key).await;
    assert!(types.contains(&"ActivityTaskCancelRequested"));
    assert!(types.contains(&"ActivityTaskCanceled"));
}
