//! Pub/sub of "new history event appeared" notifications.
//!
//! Subscription tables are sharded by a hash of the execution key to bound
//! lock contention. Delivery is per-execution in next-event-id order: a
//! notification whose next-event-id is not past the last delivered value for
//! that execution is dropped.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{ExecutionKey, WorkflowState, WorkflowStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEventNotification {
    pub key: ExecutionKey,
    pub previous_next_event_id: u64,
    pub next_event_id: u64,
    pub branch_token: Vec<u8>,
    pub workflow_state: WorkflowState,
    pub workflow_status: WorkflowStatus,
}

pub type SubscriberId = u64;

#[derive(Default)]
struct ExecutionSubscribers {
    last_delivered_id: u64,
    next_subscriber_id: SubscriberId,
    senders: HashMap<SubscriberId, mpsc::UnboundedSender<HistoryEventNotification>>,
}

#[derive(Default)]
struct Shard {
    executions: HashMap<ExecutionKey, ExecutionSubscribers>,
}

pub struct HistoryEventNotifier {
    shards: Vec<Mutex<Shard>>,
}

impl HistoryEventNotifier {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Shard::default())).collect(),
        }
    }

    fn shard(&self, key: &ExecutionKey) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Subscribe to an execution's notifications. The receiver must be
    /// unsubscribed on every exit path; a leaked subscription only dies when
    /// its dead sender is noticed on the next publish.
    pub fn subscribe(
        &self,
        key: &ExecutionKey,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<HistoryEventNotification>) {
        let mut shard = self.shard(key).lock().expect("notifier shard lock");
        let subscribers = shard.executions.entry(key.clone()).or_default();
        subscribers.next_subscriber_id += 1;
        let id = subscribers.next_subscriber_id;
        let (tx, rx) = mpsc::unbounded_channel();
        subscribers.senders.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, key: &ExecutionKey, id: SubscriberId) {
        let mut shard = self.shard(key).lock().expect("notifier shard lock");
        if let Some(subscribers) = shard.executions.get_mut(key) {
            subscribers.senders.remove(&id);
            if subscribers.senders.is_empty() {
                shard.executions.remove(key);
            }
        }
    }

    /// Publish to all subscribers of the execution. Out-of-order publishes
    /// (next-event-id not past the last delivered) are dropped.
    pub fn notify_new_history_event(&self, notification: HistoryEventNotification) {
        let mut shard = self
            .shard(&notification.key)
            .lock()
            .expect("notifier shard lock");
        let Some(subscribers) = shard.executions.get_mut(&notification.key) else {
            return;
        };
        if notification.next_event_id <= subscribers.last_delivered_id {
            return;
        }
        subscribers.last_delivered_id = notification.next_event_id;
        subscribers.senders.retain(|id, tx| {
            if tx.send(notification.clone()).is_err() {
                warn!(
                    execution = %notification.key,
                    subscriber = id,
                    "notifier: receiver dropped, removing subscription"
                );
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ExecutionKey {
        ExecutionKey::new("ns", "wf", "22222222-2222-2222-2222-222222222222")
    }

    fn notification(next_event_id: u64) -> HistoryEventNotification {
        HistoryEventNotification {
            key: key(),
            previous_next_event_id: next_event_id - 1,
            next_event_id,
            branch_token: vec![0],
            workflow_state: WorkflowState::Running,
            workflow_status: WorkflowStatus::Running,
        }
    }

    #[tokio::test]
    async fn delivers_in_order_and_drops_stale() {
        let notifier = HistoryEventNotifier::new(4);
        let (id, mut rx) = notifier.subscribe(&key());

        notifier.notify_new_history_event(notification(5));
        notifier.notify_new_history_event(notification(5)); // duplicate
        notifier.notify_new_history_event(notification(4)); // regression
        notifier.notify_new_history_event(notification(6));

        assert_eq!(rx.recv().await.unwrap().next_event_id, 5);
        assert_eq!(rx.recv().await.unwrap().next_event_id, 6);
        assert!(rx.try_recv().is_err());

        notifier.unsubscribe(&key(), id);
        notifier.notify_new_history_event(notification(7));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let notifier = HistoryEventNotifier::new(1);
        let (_a, mut rx_a) = notifier.subscribe(&key());
        let (_b, mut rx_b) = notifier.subscribe(&key());

        notifier.notify_new_history_event(notification(9));
        assert_eq!(rx_a.recv().await.unwrap().next_event_id, 9);
        assert_eq!(rx_b.recv().await.unwrap().next_event_id, 9);
    }
}
