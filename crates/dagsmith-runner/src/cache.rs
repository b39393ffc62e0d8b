//! Run-scoped relation state
//!
//! Two pieces of mutable state are shared by every executor in a run:
//! - [`RelationCache`]: memoized `get_relation` answers, so each relation is
//!   looked up in the backend at most once per run
//! - [`RelationLocks`]: one async mutex per physical relation, so two nodes
//!   that resolve to the same relation never create or alter it concurrently
//!
//! Both are keyed case-insensitively. Neither outlives a run.

use dagsmith_adapter::{RelationInfo, RelationKind};
use dagsmith_core::RelationIdentifier;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::OwnedMutexGuard;

/// Cached existence of relations, keyed by [`RelationIdentifier::cache_key`]
///
/// `Some(None)` from [`RelationCache::get`] means the relation is known not
/// to exist; `None` means it has not been looked up yet.
///
/// The lock is only held for map access, never across a backend call.
///
/// ## Usage
///
/// ```rust,ignore
/// let cache = RelationCache::new();
///
/// if cache.get(&relation).is_none() {
///     let found = backend.get_relation(&relation).await?;
///     cache.insert(&relation, found);
/// }
/// ```
#[derive(Debug, Default)]
pub struct RelationCache {
    entries: RwLock<HashMap<String, Option<RelationInfo>>>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached lookup result, if any
    pub fn get(&self, relation: &RelationIdentifier) -> Option<Option<RelationInfo>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&relation.cache_key())
            .cloned()
    }

    /// Store a backend lookup result
    pub fn insert(&self, relation: &RelationIdentifier, info: Option<RelationInfo>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(relation.cache_key(), info);
    }

    /// Record that this run created `relation`
    pub fn record_created(&self, relation: &RelationIdentifier, kind: RelationKind) {
        self.insert(relation, Some(RelationInfo::new(relation.clone(), kind)));
    }

    /// Forget what is known about `relation` (after a drop or rename)
    pub fn invalidate(&self, relation: &RelationIdentifier) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&relation.cache_key());
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-relation critical sections, keyed by [`RelationIdentifier::lock_key`]
#[derive(Debug, Default)]
pub struct RelationLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RelationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `relation`
    ///
    /// The returned guard releases the relation when dropped.
    pub async fn acquire(&self, relation: &RelationIdentifier) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(relation.lock_key()).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of distinct relations locked so far in this run
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
