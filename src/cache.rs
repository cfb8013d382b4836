//! Per-shard cache of execution contexts.
//!
//! The cache serializes mutations: `acquire` hands out a lease backed by a
//! single-holder async lock, so at most one mutation proceeds per execution
//! key at a time. A lease released with an error clears the cached state and
//! the next acquirer reloads from storage — the cache never serves state that
//! might be stale.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::query::QueryRegistry;
use crate::state::MutableState;
use crate::ExecutionKey;

/// Shared context for one execution: the lockable mutable state plus the
/// query registry, which deliberately lives outside the state lock so query
/// waiters do not hold the lease.
pub struct ExecutionContext {
    key: ExecutionKey,
    state: Arc<Mutex<Option<MutableState>>>,
    queries: Arc<QueryRegistry>,
}

impl ExecutionContext {
    fn new(key: ExecutionKey) -> Self {
        Self {
            key,
            state: Arc::new(Mutex::new(None)),
            queries: Arc::new(QueryRegistry::new()),
        }
    }

    pub fn key(&self) -> &ExecutionKey {
        &self.key
    }

    pub fn queries(&self) -> Arc<QueryRegistry> {
        self.queries.clone()
    }
}

/// Exclusive lease over one execution's mutable state. Dropping the lease
/// releases the lock; [`ExecutionLease::invalidate`] is the release-with-error
/// path that forces the next holder to reload.
pub struct ExecutionLease {
    context: Arc<ExecutionContext>,
    guard: OwnedMutexGuard<Option<MutableState>>,
}

impl ExecutionLease {
    pub fn key(&self) -> &ExecutionKey {
        self.context.key()
    }

    pub fn queries(&self) -> Arc<QueryRegistry> {
        self.context.queries()
    }

    pub fn state(&self) -> Option<&MutableState> {
        self.guard.as_ref()
    }

    pub fn state_mut(&mut self) -> Option<&mut MutableState> {
        self.guard.as_mut()
    }

    pub fn set_state(&mut self, state: MutableState) -> &mut MutableState {
        *self.guard = Some(state);
        self.guard.as_mut().expect("state just installed")
    }

    /// Drop the cached state so the next acquirer reloads from storage.
    pub fn invalidate(&mut self) {
        debug!(execution = %self.context.key(), "invalidating cached mutable state");
        *self.guard = None;
    }
}

struct CacheInner {
    entries: HashMap<ExecutionKey, Arc<ExecutionContext>>,
    lru: VecDeque<ExecutionKey>,
}

/// Map from execution key to context with LRU eviction above a soft limit.
/// Eviction skips entries whose lease is currently held.
pub struct HistoryCache {
    max_size: usize,
    inner: StdMutex<CacheInner>,
}

impl HistoryCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            inner: StdMutex::new(CacheInner {
                entries: HashMap::new(),
                lru: VecDeque::new(),
            }),
        }
    }

    /// Get or create the context for `key` without leasing it. Used by the
    /// read paths that only need the query registry.
    pub fn context(&self, key: &ExecutionKey) -> Arc<ExecutionContext> {
        let mut inner = self.inner.lock().expect("cache lock");
        self.touch(&mut inner, key);
        if let Some(context) = inner.entries.get(key) {
            return context.clone();
        }
        let context = Arc::new(ExecutionContext::new(key.clone()));
        inner.entries.insert(key.clone(), context.clone());
        self.evict_over_limit(&mut inner);
        context
    }

    /// Acquire the single-holder lease for `key`, blocking while another
    /// caller holds it.
    pub async fn acquire(&self, key: &ExecutionKey) -> ExecutionLease {
        let context = self.context(key);
        let guard = context.state.clone().lock_owned().await;
        ExecutionLease { context, guard }
    }

    fn touch(&self, inner: &mut CacheInner, key: &ExecutionKey) {
        if let Some(pos) = inner.lru.iter().position(|k| k == key) {
            inner.lru.remove(pos);
        }
        inner.lru.push_back(key.clone());
    }

    fn evict_over_limit(&self, inner: &mut CacheInner) {
        while inner.entries.len() > self.max_size {
            let evictable = inner.lru.iter().position(|key| {
                inner
                    .entries
                    .get(key)
                    .map(|ctx| ctx.state.try_lock().is_ok())
                    .unwrap_or(true)
            });
            let Some(pos) = evictable else {
                // Every entry is leased; let the map run hot rather than
                // evicting state out from under a holder.
                return;
            };
            let Some(candidate) = inner.lru.remove(pos) else {
                return;
            };
            debug!(execution = %candidate, "evicting execution context");
            inner.entries.remove(&candidate);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("cache lock").entries.len()
    }
}
