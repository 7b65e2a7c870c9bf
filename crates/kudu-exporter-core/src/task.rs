//! The pluggable fetch task contract and the registry that selects an
//! implementation from configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kudu_exporter_config::{ConfigError, ExporterConfig};

use crate::error::FetchError;
use crate::metric::NodeId;
use crate::store::MetricStore;

/// One fetch-and-store of one node.
///
/// `run` writes its own result: on success it calls [`MetricStore::put`],
/// on failure it returns the error and leaves the store alone.
#[async_trait]
pub trait FetchTask: Send {
    fn node(&self) -> NodeId;

    async fn run(self: Box<Self>) -> Result<(), FetchError>;
}

/// Builds a fetch task for one node of one cycle.
pub type FetchTaskFactory = Arc<
    dyn Fn(NodeId, Arc<ExporterConfig>, MetricStore) -> Result<Box<dyn FetchTask>, ConfigError>
        + Send
        + Sync,
>;

/// Maps plugin identifiers (the `fetcher.plugin` config value) to factories.
#[derive(Clone, Default)]
pub struct FetchTaskRegistry {
    factories: BTreeMap<String, FetchTaskFactory>,
}

impl FetchTaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every fetcher shipped with the exporter.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(crate::kudu::PLUGIN_NAME, crate::kudu::factory());
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, factory: FetchTaskFactory) -> &mut Self {
        let name = name.into();
        if self.factories.insert(name.clone(), factory).is_some() {
            tracing::debug!(plugin = %name, "Replaced fetcher plugin");
        }
        self
    }

    /// Look up the factory for `name`.
    pub fn resolve(&self, name: &str) -> Result<FetchTaskFactory, ConfigError> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownFetcher {
                name: name.to_string(),
                available: self.names(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl std::fmt::Debug for FetchTaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchTaskRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
