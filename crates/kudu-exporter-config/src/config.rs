//! Exporter configuration sections.

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kudu_exporter_logging::LogConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound on the fetch worker pool, regardless of node count.
pub const MAX_POOL_SIZE: usize = 256;

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// What the fetch scheduler does when the worker queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    /// Drop the task and log a warning; the scheduler never blocks.
    #[default]
    Drop,
    /// Wait for queue space before submitting the next task.
    Block,
}

/// URL scheme used to reach a node's metrics endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Configuration for the fetch scheduler and its worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Fetch task implementation, looked up in the fetcher registry.
    #[serde(default = "default_plugin")]
    pub plugin: String,

    /// Time between the starts of two fetch cycles.
    #[serde(default = "default_fetch_interval", with = "duration_secs")]
    pub interval: Duration,

    /// Upper bound on the lifetime of a single fetch task.
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,

    /// Number of fetch workers.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Maximum number of fetch tasks waiting for a worker.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub backpressure: Backpressure,

    #[serde(default)]
    pub scheme: Scheme,

    /// HTTP path of the node's JSON metrics endpoint.
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Metric names requested from the node. Empty means all metrics.
    #[serde(default)]
    pub metrics: Vec<String>,

    /// Metric names dropped after fetching.
    #[serde(default)]
    pub excluded_metrics: HashSet<String>,
}

fn default_plugin() -> String {
    "kudu-http".to_string()
}

fn default_fetch_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_pool_size() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            plugin: default_plugin(),
            interval: default_fetch_interval(),
            timeout: default_timeout(),
            pool_size: default_pool_size(),
            queue_capacity: default_queue_capacity(),
            backpressure: Backpressure::default(),
            scheme: Scheme::default(),
            metrics_path: default_metrics_path(),
            metrics: Vec::new(),
            excluded_metrics: HashSet::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of distinct nodes held. `None` means unbounded.
    #[serde(default)]
    pub capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// How the metric store is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReporterMode {
    /// Serve `/metrics` over HTTP and render on every scrape.
    #[default]
    Http,
    /// Log every sample on a timer.
    Log,
    /// Rewrite a text exposition file on a timer.
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReporterConfig {
    #[serde(default)]
    pub mode: ReporterMode,

    /// Listen address for `http` mode.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Publish interval for `log` and `file` modes.
    #[serde(default = "default_report_interval", with = "duration_secs")]
    pub interval: Duration,

    /// Output file for `file` mode.
    #[serde(default = "default_file_path")]
    pub file_path: PathBuf,

    /// Prefix prepended to every exported metric name.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9045))
}

fn default_report_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_file_path() -> PathBuf {
    PathBuf::from("./kudu_metrics.prom")
}

fn default_namespace() -> String {
    "kudu".to_string()
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            mode: ReporterMode::default(),
            listen_addr: default_listen_addr(),
            interval: default_report_interval(),
            file_path: default_file_path(),
            namespace: default_namespace(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Complete exporter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Addresses (`host:port`) of the nodes to poll. A node's position in
    /// this list is its identity for the lifetime of the process.
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Time given to in-flight fetches to finish on shutdown.
    #[serde(default = "default_shutdown_grace", with = "duration_secs")]
    pub shutdown_grace: Duration,

    #[serde(default)]
    pub fetcher: FetcherConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub reporter: ReporterConfig,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            shutdown_grace: default_shutdown_grace(),
            fetcher: FetcherConfig::default(),
            store: StoreConfig::default(),
            reporter: ReporterConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ExporterConfig {
    /// Load a configuration file without validating it, so that command line
    /// overrides can still be applied.
    pub fn load_unvalidated(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded exporter config");
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::load_unvalidated(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn fetch_interval(&self) -> Duration {
        self.fetcher.interval
    }

    pub fn task_timeout(&self) -> Duration {
        self.fetcher.timeout
    }

    /// Address of the node at `index`, if configured.
    pub fn node_address(&self, index: usize) -> Option<&str> {
        self.nodes.get(index).map(String::as_str)
    }

    /// Check every section for out-of-range or inconsistent values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("no nodes configured".into()));
        }
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            validate_node_address(node)?;
            if !seen.insert(node.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate node '{}'", node)));
            }
        }

        let fetcher = &self.fetcher;
        if fetcher.plugin.trim().is_empty() {
            return Err(ConfigError::Invalid("fetcher.plugin must not be empty".into()));
        }
        if fetcher.interval.is_zero() {
            return Err(ConfigError::Invalid("fetcher.interval must be positive".into()));
        }
        if fetcher.timeout.is_zero() {
            return Err(ConfigError::Invalid("fetcher.timeout must be positive".into()));
        }
        if fetcher.pool_size == 0 || fetcher.pool_size > MAX_POOL_SIZE {
            return Err(ConfigError::Invalid(format!(
                "fetcher.pool_size must be within 1..={}, got {}",
                MAX_POOL_SIZE, fetcher.pool_size
            )));
        }
        if fetcher.queue_capacity == 0 {
            return Err(ConfigError::Invalid("fetcher.queue_capacity must be positive".into()));
        }
        if !fetcher.metrics_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "fetcher.metrics_path must start with '/', got '{}'",
                fetcher.metrics_path
            )));
        }

        if let Some(capacity) = self.store.capacity {
            if capacity < self.nodes.len() {
                return Err(ConfigError::Invalid(format!(
                    "store.capacity ({}) is smaller than the number of nodes ({})",
                    capacity,
                    self.nodes.len()
                )));
            }
        }

        let reporter = &self.reporter;
        if reporter.mode != ReporterMode::Http && reporter.interval.is_zero() {
            return Err(ConfigError::Invalid("reporter.interval must be positive".into()));
        }
        if !is_valid_namespace(&reporter.namespace) {
            return Err(ConfigError::Invalid(format!(
                "reporter.namespace '{}' is not a valid metric name prefix",
                reporter.namespace
            )));
        }
        if self.shutdown_grace.is_zero() {
            return Err(ConfigError::Invalid("shutdown_grace must be positive".into()));
        }

        Ok(())
    }
}

fn validate_node_address(node: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::Invalid(format!("node '{}' is not a host:port address", node));
    let (host, port) = node.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.contains('/') || host.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(()),
        _ => Err(invalid()),
    }
}

fn is_valid_namespace(ns: &str) -> bool {
    let mut chars = ns.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Serde helper that serialises `Duration` as floating-point seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ExporterConfig {
        ExporterConfig {
            nodes: vec!["master-1:8051".into(), "tserver-1:8050".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = ExporterConfig::default();
        assert!(config.nodes.is_empty());
        assert_eq!(config.fetcher.plugin, "kudu-http");
        assert_eq!(config.fetch_interval(), Duration::from_secs(15));
        assert_eq!(config.task_timeout(), Duration::from_secs(10));
        assert_eq!(config.fetcher.pool_size, 8);
        assert_eq!(config.fetcher.backpressure, Backpressure::Drop);
        assert_eq!(config.reporter.mode, ReporterMode::Http);
        assert_eq!(config.reporter.listen_addr.port(), 9045);
        assert!(config.store.capacity.is_none());
    }

    #[test]
    fn test_default_config_has_no_nodes_and_fails_validation() {
        let err = ExporterConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("no nodes")));
    }

    #[test]
    fn test_valid_config_passes() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_from_toml_str() {
        let config = ExporterConfig::from_toml_str(
            r#"
            nodes = ["10.0.0.1:8050", "10.0.0.2:8050", "[::1]:8051"]

            [fetcher]
            interval = 5
            timeout = 2.5
            pool_size = 4
            backpressure = "block"
            excluded_metrics = ["threads_running"]

            [store]
            capacity = 3

            [reporter]
            mode = "file"
            file_path = "/tmp/kudu.prom"
            "#,
        )
        .unwrap();

        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.fetch_interval(), Duration::from_secs(5));
        assert_eq!(config.task_timeout(), Duration::from_millis(2500));
        assert_eq!(config.fetcher.backpressure, Backpressure::Block);
        assert!(config.fetcher.excluded_metrics.contains("threads_running"));
        assert_eq!(config.store.capacity, Some(3));
        assert_eq!(config.reporter.mode, ReporterMode::File);
        assert_eq!(config.reporter.namespace, "kudu");
        assert_eq!(config.node_address(2), Some("[::1]:8051"));
        assert_eq!(config.node_address(3), None);
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = ExporterConfig::from_toml_str("nodes = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejects_malformed_node_list() {
        for bad in ["no-port", ":8050", "host:notaport", "host:0", "http://host:8050"] {
            let mut config = valid();
            config.nodes.push(bad.to_string());
            assert!(config.validate().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_rejects_duplicate_nodes() {
        let mut config = valid();
        config.nodes.push("master-1:8051".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_zero_interval_and_timeout() {
        let mut config = valid();
        config.fetcher.interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.fetcher.timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_pool_size_out_of_range() {
        let mut config = valid();
        config.fetcher.pool_size = 0;
        assert!(config.validate().is_err());
        config.fetcher.pool_size = MAX_POOL_SIZE + 1;
        assert!(config.validate().is_err());
        config.fetcher.pool_size = MAX_POOL_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_capacity_below_node_count() {
        let mut config = valid();
        config.store.capacity = Some(1);
        assert!(config.validate().is_err());
        config.store.capacity = Some(2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_namespace() {
        let mut config = valid();
        config.reporter.namespace = "9kudu".into();
        assert!(config.validate().is_err());
        config.reporter.namespace = "kudu-cluster".into();
        assert!(config.validate().is_err());
        config.reporter.namespace = "kudu_prod".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_negative_duration_is_rejected_at_parse() {
        let err = ExporterConfig::from_toml_str(
            "nodes = [\"a:1\"]\n[fetcher]\ninterval = -1.0\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = valid();
        let text = config.to_toml_string().unwrap();
        let back = ExporterConfig::from_toml_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_serde_json_roundtrip() {
        let config = valid();
        let json = serde_json::to_string(&config).unwrap();
        let back: ExporterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nodes, config.nodes);
        assert_eq!(back.fetcher.timeout, config.fetcher.timeout);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = ExporterConfig::load("/nonexistent/kudu-exporter.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
