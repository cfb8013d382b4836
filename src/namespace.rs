//! Namespace registry contract.
//!
//! The engine consults namespace metadata for the bad-binaries guard, the
//! consistent-query switch, and retention. The authoritative registry lives
//! outside the shard; this module carries the contract plus a static
//! implementation for embedding and tests.

use crate::EngineError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct NamespaceEntry {
    pub id: String,
    pub name: String,
    /// Worker binary checksums that must not complete decisions.
    pub bad_binaries: HashSet<String>,
    pub enable_consistent_query: bool,
    pub retention_days: i32,
    /// Global namespaces replicate across clusters; local ones do not.
    pub is_global: bool,
}

impl NamespaceEntry {
    pub fn with_defaults(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            bad_binaries: HashSet::new(),
            enable_consistent_query: true,
            retention_days: 7,
            is_global: false,
        }
    }
}

#[async_trait]
pub trait NamespaceRegistry: Send + Sync {
    async fn get(&self, namespace_id: &str) -> Result<NamespaceEntry, EngineError>;
}

/// Registry over a fixed table. Unknown namespaces resolve to a default entry
/// so embedders do not have to pre-register every namespace they exercise.
#[derive(Default)]
pub struct StaticNamespaceRegistry {
    entries: RwLock<HashMap<String, NamespaceEntry>>,
}

impl StaticNamespaceRegistry {
    pub fn insert(&self, entry: NamespaceEntry) {
        self.entries
            .write()
            .expect("namespace table lock")
            .insert(entry.id.clone(), entry);
    }
}

#[async_trait]
impl NamespaceRegistry for StaticNamespaceRegistry {
    async fn get(&self, namespace_id: &str) -> Result<NamespaceEntry, EngineError> {
        let entries = self.entries.read().expect("namespace table lock");
        Ok(entries
            .get(namespace_id)
            .cloned()
            .unwrap_or_else(|| NamespaceEntry::with_defaults(namespace_id)))
    }
}
