//! Prometheus text exposition of a store snapshot.

use std::collections::{BTreeMap, BTreeSet};

use kudu_exporter_config::ReporterConfig;
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

use crate::error::RenderError;
use crate::metric::{MetricRecord, StoreSnapshot};

/// Content type of the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const NODE_LABEL: &str = "node";
const EXPORTED_NODE_LABEL: &str = "exported_node";

/// Renders snapshots as gauges named `<namespace>_<metric>`.
#[derive(Debug, Clone)]
pub struct PrometheusRenderer {
    namespace: String,
}

#[derive(Default)]
struct Family {
    label_names: BTreeSet<String>,
    samples: Vec<(BTreeMap<String, String>, f64)>,
}

impl PrometheusRenderer {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn from_config(config: &ReporterConfig) -> Self {
        Self::new(config.namespace.clone())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Render every value in `snapshot`, plus the exporter's own
    /// `exporter_nodes` and `exporter_last_success_timestamp_seconds` gauges.
    pub fn render(&self, snapshot: &StoreSnapshot) -> Result<String, RenderError> {
        let nodes_name = self.metric_name("exporter_nodes");
        let last_success_name = self.metric_name("exporter_last_success_timestamp_seconds");

        let mut families: BTreeMap<String, Family> = BTreeMap::new();
        for (_, collection) in snapshot.iter() {
            for record in &collection.records {
                let labels = sample_labels(&collection.source, record);
                for (name, value) in &record.values {
                    let metric = self.metric_name(name);
                    if metric == nodes_name || metric == last_success_name {
                        tracing::debug!(metric = %metric, "Skipping metric shadowing an exporter gauge");
                        continue;
                    }
                    let family = families.entry(metric).or_default();
                    family.label_names.extend(labels.keys().cloned());
                    family.samples.push((labels.clone(), *value));
                }
            }
        }

        let registry = Registry::new();
        for (name, family) in &families {
            let label_names: Vec<&str> = family.label_names.iter().map(String::as_str).collect();
            let gauge = GaugeVec::new(Opts::new(name.as_str(), format!("Kudu metric {}", name)), &label_names)?;
            for (labels, value) in &family.samples {
                let values: Vec<&str> = label_names
                    .iter()
                    .map(|n| labels.get(*n).map(String::as_str).unwrap_or(""))
                    .collect();
                gauge.with_label_values(&values).set(*value);
            }
            registry.register(Box::new(gauge))?;
        }

        let nodes = Gauge::with_opts(Opts::new(nodes_name, "Number of nodes with stored metrics"))?;
        nodes.set(snapshot.len() as f64);
        registry.register(Box::new(nodes))?;

        if !snapshot.is_empty() {
            let last_success = GaugeVec::new(
                Opts::new(last_success_name, "Unix time of the last successful fetch per node"),
                &[NODE_LABEL],
            )?;
            for (_, collection) in snapshot.iter() {
                let seconds = collection.fetched_at.timestamp_millis() as f64 / 1000.0;
                last_success
                    .with_label_values(&[collection.source.as_str()])
                    .set(seconds);
            }
            registry.register(Box::new(last_success))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    fn metric_name(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            sanitize_metric_name(name)
        } else {
            sanitize_metric_name(&format!("{}_{}", self.namespace, name))
        }
    }
}

impl Default for PrometheusRenderer {
    fn default() -> Self {
        Self::from_config(&ReporterConfig::default())
    }
}

fn sample_labels(source: &str, record: &MetricRecord) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for (key, value) in &record.labels {
        let mut key = sanitize_label_name(key);
        if key == NODE_LABEL {
            key = EXPORTED_NODE_LABEL.to_string();
        }
        labels.insert(key, value.clone());
    }
    labels.insert(NODE_LABEL.to_string(), source.to_string());
    labels
}

/// Map `name` into `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn sanitize_metric_name(name: &str) -> String {
    sanitize(name, true)
}

/// Map `name` into `[a-zA-Z_][a-zA-Z0-9_]*`, avoiding the reserved `__`
/// prefix.
pub fn sanitize_label_name(name: &str) -> String {
    let sanitized = sanitize(name, false);
    if sanitized.starts_with("__") {
        format!("l{}", sanitized.trim_start_matches('_'))
    } else {
        sanitized
    }
}

fn sanitize(name: &str, allow_colon: bool) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    for (i, c) in name.chars().enumerate() {
        let valid = c.is_ascii_alphabetic() || c == '_' || (allow_colon && c == ':');
        if valid || (i > 0 && c.is_ascii_digit()) {
            out.push(c);
        } else if i == 0 && c.is_ascii_digit() {
            out.push('_');
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}
