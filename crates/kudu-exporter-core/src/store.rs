//! Latest-value metric store shared by the fetch and report paths.
//!
//! Entries live in a sharded map and every value is an immutable
//! `Arc<MetricCollection>`. A write swaps one pointer under one shard lock;
//! a reader sees either the old collection or the new one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kudu_exporter_config::StoreConfig;

use crate::error::StoreError;
use crate::metric::{MetricCollection, NodeId, StoreSnapshot};

struct StoreInner {
    entries: DashMap<NodeId, Arc<MetricCollection>>,
    capacity: Option<usize>,
    /// Distinct nodes admitted so far. Entries are never removed, so this
    /// only grows.
    admitted: AtomicUsize,
}

/// Cheaply cloneable handle to the metric store.
#[derive(Clone)]
pub struct MetricStore {
    inner: Arc<StoreInner>,
}

impl MetricStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a store that admits at most `capacity` distinct nodes.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self::build(Some(capacity))
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::build(config.capacity)
    }

    fn build(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                capacity,
                admitted: AtomicUsize::new(0),
            }),
        }
    }

    /// Replace the stored collection for `node`.
    ///
    /// Replacing an existing node always succeeds. A never-seen node is
    /// rejected once the store is at capacity; existing entries are kept.
    pub fn put(&self, node: NodeId, collection: MetricCollection) -> Result<(), StoreError> {
        let collection = Arc::new(collection);
        match self.inner.entries.entry(node) {
            Entry::Occupied(mut entry) => {
                entry.insert(collection);
            }
            Entry::Vacant(entry) => {
                if let Some(capacity) = self.inner.capacity {
                    if !self.reserve_slot(capacity) {
                        let err = StoreError::CapacityExceeded { node, capacity };
                        tracing::warn!(%node, capacity, "Metric store full, dropping new node");
                        return Err(err);
                    }
                }
                entry.insert(collection);
            }
        }
        Ok(())
    }

    fn reserve_slot(&self, capacity: usize) -> bool {
        self.inner
            .admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_ok()
    }

    /// Current collection for `node`, or `None` if no fetch of it has ever
    /// succeeded.
    pub fn get(&self, node: NodeId) -> Option<Arc<MetricCollection>> {
        self.inner.entries.get(&node).map(|e| Arc::clone(e.value()))
    }

    /// Copy the whole store. No lock is held once this returns.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.inner
            .entries
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricStore")
            .field("len", &self.len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}
