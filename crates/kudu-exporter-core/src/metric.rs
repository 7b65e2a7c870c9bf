//! Node identity and the metric values fetched from a node.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of one configured node: its position in the configured node
/// list. Stable for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Position of this node in the configured node list.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::ops::Deref for NodeId {
    type Target = u32;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    #[inline]
    fn from(val: u32) -> Self {
        Self(val)
    }
}

impl From<NodeId> for u32 {
    #[inline]
    fn from(val: NodeId) -> Self {
        val.0
    }
}

impl TryFrom<usize> for NodeId {
    type Error = std::num::TryFromIntError;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        u32::try_from(index).map(Self)
    }
}

/// A flat bag of metric values sharing one label set.
///
/// For Kudu, one record is one metric entity (the server itself, a tablet,
/// a table); the labels identify the entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl MetricRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Everything one successful fetch of one node produced.
///
/// An empty `records` list is a real, empty result and is distinct from a
/// node that has never been fetched successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCollection {
    pub records: Vec<MetricRecord>,
    /// Address the collection was fetched from.
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

impl MetricCollection {
    pub fn new(source: impl Into<String>, records: Vec<MetricRecord>) -> Self {
        Self {
            records,
            source: source.into(),
            fetched_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a value by metric name in the first record that carries it.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.records.iter().find_map(|r| r.value(name))
    }
}

/// Point-in-time copy of the metric store.
///
/// Owns its entries: later writes to the store are never visible through a
/// snapshot that has already been taken.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    entries: BTreeMap<NodeId, Arc<MetricCollection>>,
}

impl StoreSnapshot {
    pub fn get(&self, node: NodeId) -> Option<&Arc<MetricCollection>> {
        self.entries.get(&node)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.entries.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Arc<MetricCollection>)> {
        self.entries.iter().map(|(node, c)| (*node, c))
    }
}

impl FromIterator<(NodeId, Arc<MetricCollection>)> for StoreSnapshot {
    fn from_iter<I: IntoIterator<Item = (NodeId, Arc<MetricCollection>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
