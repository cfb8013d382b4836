//! Long-poll behavior of the mutable-state read path: wake-up on new events,
//! branch-change detection, and the snapshot-on-timeout contract.

use std::time::{Duration, Instant};

use chronik::engine::PollMutableStateRequest;
use chronik::notifier::HistoryEventNotification;
use chronik::{WorkflowState, WorkflowStatus};

mod common;
use common::{TestHarness, NAMESPACE};

#[tokio::test]
async fn poll_wakes_on_new_event() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-longpoll-wake").await;
    harness.start_decision(&key).await;

    // Preloaded at next-event-id=4: started, decision scheduled, decision
    // started.
    assert_eq!(harness.snapshot(&key).await.info.next_event_id, 4);

    let engine = harness.engine.clone();
    let poll_key = key.clone();
    let poller = tokio::spawn(async move {
        let started = Instant::now();
        let snapshot = engine
            .poll_mutable_state(PollMutableStateRequest {
                namespace_id: NAMESPACE.into(),
                workflow_id: poll_key.workflow_id.clone(),
                run_id: poll_key.run_id.clone(),
                expected_next_event_id: Some(4),
                timeout: Some(Duration::from_secs(20)),
                ..Default::default()
            })
            .await
            .expect("poll mutable state");
        (snapshot, started.elapsed())
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    harness.complete_decision(&key, vec![]).await;

    let (snapshot, elapsed) = poller.await.expect("poller task");
    assert_eq!(snapshot.next_event_id, 5);
    assert!(
        elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(4),
        "poll should return shortly after the completion, took {elapsed:?}"
    );
}

#[tokio::test]
async fn poll_returns_snapshot_on_branch_change() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-longpoll-branch").await;
    harness.start_decision(&key).await;
    let original_branch = harness.snapshot(&key).await.info.branch_token;

    let engine = harness.engine.clone();
    let poll_key = key.clone();
    let poller = tokio::spawn(async move {
        engine
            .poll_mutable_state(PollMutableStateRequest {
                namespace_id: NAMESPACE.into(),
                workflow_id: poll_key.workflow_id.clone(),
                run_id: poll_key.run_id.clone(),
                expected_next_event_id: Some(10),
                timeout: Some(Duration::from_secs(20)),
                ..Default::default()
            })
            .await
            .expect("poll mutable state")
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    // The branch moved without reaching the expected event id (reset or
    // replication divergence).
    harness
        .engine
        .notifier()
        .notify_new_history_event(HistoryEventNotification {
            key: key.clone(),
            previous_next_event_id: 4,
            next_event_id: 4,
            branch_token: vec![1],
            workflow_state: WorkflowState::Running,
            workflow_status: WorkflowStatus::Running,
        });

    let snapshot = poller.await.expect("poller task");
    // The poller gets the original snapshot back and re-reads to observe the
    // new branch.
    assert_eq!(snapshot.branch_token, original_branch);
    assert_eq!(snapshot.next_event_id, 4);
}

#[tokio::test]
async fn poll_without_expectation_returns_immediately() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-longpoll-now").await;

    let snapshot = harness
        .engine
        .poll_mutable_state(PollMutableStateRequest {
            namespace_id: NAMESPACE.into(),
            workflow_id: key.workflow_id.clone(),
            run_id: key.run_id.clone(),
            ..Default::default()
        })
        .await
        .expect("poll mutable state");
    assert_eq!(snapshot.next_event_id, 3);
    assert_eq!(snapshot.workflow_status, WorkflowStatus::Running);
}

#[tokio::test]
async fn poll_timeout_returns_latest_snapshot_without_error() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-longpoll-timeout").await;

    let snapshot = harness
        .engine
        .poll_mutable_state(PollMutableStateRequest {
            namespace_id: NAMESPACE.into(),
            workflow_id: key.workflow_id.clone(),
            run_id: key.run_id.clone(),
            // Far past the true next-event-id; nothing will publish.
            expected_next_event_id: Some(50),
            timeout: Some(Duration::from_millis(300)),
            ..Default::default()
        })
        .await
        .expect("timeout must not surface as an error");
    assert_eq!(snapshot.next_event_id, 3);
}

#[tokio::test]
async fn get_mutable_state_resolves_current_run() {
    let harness = TestHarness::new();
    let key = harness.start_workflow("wf-longpoll-current").await;

    let snapshot = harness
        .engine
        .get_mutable_state(NAMESPACE, &key.workflow_id, None)
        .await
        .expect("get mutable state");
    assert_eq!(snapshot.key, key);
    assert_eq!(snapshot.task_list, common::TASK_LIST);
}
