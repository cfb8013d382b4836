//! Per-execution registry of pending consistent queries.
//!
//! Queries are buffered until a decision observes their effect (or the engine
//! falls back to direct dispatch). Each buffered query carries a one-shot
//! completion channel distinct from the mutable-state lease: the query path
//! releases the lease, then waits on the channel.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// A worker-executed computation over a running workflow's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowQuery {
    pub query_type: String,
    pub query_args: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryResultType {
    Answered,
    Failed,
}

/// A worker's answer to a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub result_type: QueryResultType,
    pub answer: String,
    pub error_message: String,
}

impl QueryResult {
    pub fn answered(answer: impl Into<String>) -> Self {
        Self {
            result_type: QueryResultType::Answered,
            answer: answer.into(),
            error_message: String::new(),
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            result_type: QueryResultType::Failed,
            answer: String::new(),
            error_message: error_message.into(),
        }
    }
}

/// Where a buffered query ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTerminationState {
    /// Worker returned an answer (or a query failure) through a decision.
    Completed(QueryResult),
    /// The next decision started without answering; re-dispatch directly.
    Unblocked,
    Failed(EngineError),
}

pub type QueryId = u64;

#[derive(Debug)]
struct QueryEntry {
    query: WorkflowQuery,
    termination: Option<QueryTerminationState>,
    completion_tx: Option<oneshot::Sender<QueryTerminationState>>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: QueryId,
    entries: HashMap<QueryId, QueryEntry>,
}

/// Registry of queries for one execution. In-memory only: it does not survive
/// cache eviction, and buffered queries are bounded to keep stuck workers from
/// growing it without limit.
#[derive(Default)]
pub struct QueryRegistry {
    inner: Mutex<RegistryInner>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a query. Fails without side effects when `limit` queries are
    /// already buffered.
    pub fn buffer(
        &self,
        query: WorkflowQuery,
        limit: usize,
    ) -> Result<(QueryId, oneshot::Receiver<QueryTerminationState>), EngineError> {
        let mut inner = self.inner.lock().expect("query registry lock");
        let buffered = inner
            .entries
            .values()
            .filter(|e| e.termination.is_none())
            .count();
        if buffered >= limit {
            return Err(EngineError::ConsistentQueryBufferExceeded);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let (tx, rx) = oneshot::channel();
        inner.entries.insert(
            id,
            QueryEntry {
                query,
                termination: None,
                completion_tx: Some(tx),
            },
        );
        Ok((id, rx))
    }

    /// Transition a buffered query to a termination state and signal its
    /// waiter. Terminated queries cannot transition again.
    pub fn set_termination_state(
        &self,
        id: QueryId,
        state: QueryTerminationState,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("query registry lock");
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("query {id}")))?;
        if entry.termination.is_some() {
            return Err(EngineError::InvalidArgument(format!(
                "query {id} already terminated"
            )));
        }
        entry.termination = Some(state.clone());
        if let Some(tx) = entry.completion_tx.take() {
            // A dropped receiver means the caller gave up; the termination
            // state is still recorded for the grouped accessors.
            let _ = tx.send(state);
        }
        Ok(())
    }

    pub fn get_termination_state(&self, id: QueryId) -> Option<QueryTerminationState> {
        let inner = self.inner.lock().expect("query registry lock");
        inner.entries.get(&id).and_then(|e| e.termination.clone())
    }

    pub fn get_query(&self, id: QueryId) -> Option<WorkflowQuery> {
        let inner = self.inner.lock().expect("query registry lock");
        inner.entries.get(&id).map(|e| e.query.clone())
    }

    fn ids_in_state(
        &self,
        predicate: impl Fn(&Option<QueryTerminationState>) -> bool,
    ) -> Vec<QueryId> {
        let inner = self.inner.lock().expect("query registry lock");
        let mut ids: Vec<QueryId> = inner
            .entries
            .iter()
            .filter(|(_, e)| predicate(&e.termination))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn buffered_ids(&self) -> Vec<QueryId> {
        self.ids_in_state(|t| t.is_none())
    }

    pub fn completed_ids(&self) -> Vec<QueryId> {
        self.ids_in_state(|t| matches!(t, Some(QueryTerminationState::Completed(_))))
    }

    pub fn unblocked_ids(&self) -> Vec<QueryId> {
        self.ids_in_state(|t| matches!(t, Some(QueryTerminationState::Unblocked)))
    }

    pub fn failed_ids(&self) -> Vec<QueryId> {
        self.ids_in_state(|t| matches!(t, Some(QueryTerminationState::Failed(_))))
    }

    pub fn has_buffered_query(&self) -> bool {
        !self.buffered_ids().is_empty()
    }

    pub fn has_completed_query(&self) -> bool {
        !self.completed_ids().is_empty()
    }

    pub fn has_unblocked_query(&self) -> bool {
        !self.unblocked_ids().is_empty()
    }

    pub fn has_failed_query(&self) -> bool {
        !self.failed_ids().is_empty()
    }

    /// Reap a query once its caller is done with it.
    pub fn remove(&self, id: QueryId) {
        let mut inner = self.inner.lock().expect("query registry lock");
        inner.entries.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> WorkflowQuery {
        WorkflowQuery {
            query_type: "state".into(),
            query_args: String::new(),
        }
    }

    #[test]
    fn buffer_respects_limit_without_side_effects() {
        let registry = QueryRegistry::new();
        let (id1, _rx1) = registry.buffer(query(), 1).unwrap();
        let err = registry.buffer(query(), 1).unwrap_err();
        assert_eq!(err, EngineError::ConsistentQueryBufferExceeded);
        assert_eq!(registry.buffered_ids(), vec![id1]);
    }

    #[tokio::test]
    async fn completion_signals_the_waiter() {
        let registry = QueryRegistry::new();
        let (id, rx) = registry.buffer(query(), 4).unwrap();
        registry
            .set_termination_state(
                id,
                QueryTerminationState::Completed(QueryResult::answered("[1,2,3]")),
            )
            .unwrap();
        match rx.await.unwrap() {
            QueryTerminationState::Completed(result) => assert_eq!(result.answer, "[1,2,3]"),
            other => panic!("unexpected termination: {other:?}"),
        }
        assert!(registry.has_completed_query());
        registry.remove(id);
        assert!(!registry.has_completed_query());
        assert!(!registry.has_buffered_query());
    }

    #[test]
    fn double_termination_is_rejected() {
        let registry = QueryRegistry::new();
        let (id, _rx) = registry.buffer(query(), 4).unwrap();
        registry
            .set_termination_state(id, QueryTerminationState::Unblocked)
            .unwrap();
        assert!(registry
            .set_termination_state(id, QueryTerminationState::Unblocked)
            .is_err());
        assert_eq!(registry.unblocked_ids(), vec![id]);
    }
}
