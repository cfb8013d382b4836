//! Engine tunables. All values have conservative defaults; services override
//! per deployment.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on reload-and-retry cycles after an optimistic-concurrency
    /// conflict before surfacing `MaxAttemptsExceeded`.
    pub conditional_retry_count: usize,

    /// Upper bound on buffered consistent queries per execution.
    pub consistent_query_buffer_size: usize,

    /// Global kill switch for consistent query. The namespace-scoped switch
    /// is checked in addition to this one.
    pub enable_consistent_query: bool,

    /// Wall-clock budget for decision heartbeats: a completion with
    /// `force_create_new_decision_task` whose original scheduled timestamp is
    /// older than this is rejected with a timeout.
    pub decision_heartbeat_budget: Duration,

    /// Failed decision attempts beyond this threshold schedule the next
    /// decision with a back-off delay instead of an immediate transfer task.
    pub decision_attempt_backoff_threshold: i32,
    pub decision_attempt_backoff: Duration,

    /// Soft limit on cached execution contexts; least-recently-used entries
    /// above it are evicted when their lease is free.
    pub cache_max_size: usize,

    /// Number of subscription-table shards in the history event notifier.
    pub notifier_shard_count: usize,

    /// Default wait for `poll_mutable_state` when the caller supplies none.
    pub long_poll_default_timeout: Duration,

    /// Bounded retry for retryable store/RPC errors, exponential back-off
    /// starting at `store_retry_initial_backoff`.
    pub store_retry_max_attempts: usize,
    pub store_retry_initial_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            conditional_retry_count: 5,
            consistent_query_buffer_size: 1,
            enable_consistent_query: true,
            decision_heartbeat_budget: Duration::from_secs(30 * 60),
            decision_attempt_backoff_threshold: 3,
            decision_attempt_backoff: Duration::from_secs(10),
            cache_max_size: 512,
            notifier_shard_count: 16,
            long_poll_default_timeout: Duration::from_secs(20),
            store_retry_max_attempts: 3,
            store_retry_initial_backoff: Duration::from_millis(50),
        }
    }
}
