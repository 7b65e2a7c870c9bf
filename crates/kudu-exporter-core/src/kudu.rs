//! Fetch task for the JSON `/metrics` endpoint of Kudu masters and tablet
//! servers.
//!
//! The endpoint returns an array of metric entities:
//!
//! ```text
//! [{"type": "tablet", "id": "3ab0…", "attributes": {"table_name": "t1"},
//!   "metrics": [{"name": "rows_inserted", "value": 42},
//!               {"name": "op_apply_run_time", "total_count": 7, "mean": 1.5, …}]}]
//! ```
//!
//! Each entity becomes one [`MetricRecord`] labelled with its type, id and
//! string attributes. Histogram metrics (no `value` field) are flattened into
//! one value per numeric field, named `<metric>_<field>`.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use kudu_exporter_config::{ConfigError, ExporterConfig};
use serde_json::Value;

use crate::error::FetchError;
use crate::metric::{MetricCollection, MetricRecord, NodeId};
use crate::store::MetricStore;
use crate::task::{FetchTask, FetchTaskFactory};

/// Registry name of this fetcher.
pub const PLUGIN_NAME: &str = "kudu-http";

/// Factory for [`KuduFetchTask`]. All tasks built by one factory share a
/// single HTTP connection pool.
pub fn factory() -> FetchTaskFactory {
    let client: Arc<OnceLock<reqwest::Client>> = Arc::default();
    Arc::new(
        move |node: NodeId,
              config: Arc<ExporterConfig>,
              store: MetricStore|
              -> Result<Box<dyn FetchTask>, ConfigError> {
            let client = match client.get() {
                Some(c) => c.clone(),
                None => {
                    let built = build_client(node)?;
                    client.get_or_init(|| built).clone()
                }
            };
            let task = KuduFetchTask::new(node, &config, client, store)?;
            Ok(Box::new(task))
        },
    )
}

fn build_client(node: NodeId) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .user_agent(concat!("kudu-exporter/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ConfigError::TaskConstruction {
            node: node.to_string(),
            reason: format!("failed to build HTTP client: {}", e),
        })
}

pub struct KuduFetchTask {
    node: NodeId,
    address: String,
    url: String,
    query: Vec<(&'static str, String)>,
    timeout: Duration,
    excluded: Arc<HashSet<String>>,
    client: reqwest::Client,
    store: MetricStore,
}

impl KuduFetchTask {
    pub fn new(
        node: NodeId,
        config: &ExporterConfig,
        client: reqwest::Client,
        store: MetricStore,
    ) -> Result<Self, ConfigError> {
        let address = config
            .node_address(node.index())
            .ok_or_else(|| ConfigError::TaskConstruction {
                node: node.to_string(),
                reason: format!("only {} nodes are configured", config.nodes.len()),
            })?
            .to_string();

        let fetcher = &config.fetcher;
        let url = format!("{}://{}{}", fetcher.scheme.as_str(), address, fetcher.metrics_path);
        reqwest::Url::parse(&url).map_err(|e| ConfigError::TaskConstruction {
            node: address.clone(),
            reason: format!("invalid metrics url '{}': {}", url, e),
        })?;

        let mut query = vec![("compact", "1".to_string())];
        if !fetcher.metrics.is_empty() {
            query.push(("metrics", fetcher.metrics.join(",")));
        }

        Ok(Self {
            node,
            address,
            url,
            query,
            timeout: config.task_timeout(),
            excluded: Arc::new(fetcher.excluded_metrics.clone()),
            client,
            store,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_payload(&self) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .query(&self.query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_decode() {
                FetchError::Parse(e.to_string())
            } else {
                self.map_request_error(e)
            }
        })
    }

    fn map_request_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Http {
                url: self.url.clone(),
                source: e,
            }
        }
    }
}

#[async_trait]
impl FetchTask for KuduFetchTask {
    fn node(&self) -> NodeId {
        self.node
    }

    async fn run(self: Box<Self>) -> Result<(), FetchError> {
        let payload = self.fetch_payload().await?;
        let records = parse_metrics_payload(&payload, &self.excluded)?;
        tracing::debug!(
            node = %self.node,
            address = %self.address,
            entities = records.len(),
            "Fetched Kudu metrics"
        );
        self.store
            .put(self.node, MetricCollection::new(self.address.clone(), records))?;
        Ok(())
    }
}

/// Convert a Kudu metrics document into records, dropping `excluded` metric
/// names and entities left without any numeric value.
pub fn parse_metrics_payload(
    payload: &Value,
    excluded: &HashSet<String>,
) -> Result<Vec<MetricRecord>, FetchError> {
    let entities = payload
        .as_array()
        .ok_or_else(|| FetchError::Parse("expected a JSON array of metric entities".into()))?;

    let mut records = Vec::with_capacity(entities.len());
    for entity in entities {
        let entity = entity
            .as_object()
            .ok_or_else(|| FetchError::Parse("metric entity is not an object".into()))?;

        let mut record = MetricRecord::new();
        for key in ["type", "id"] {
            if let Some(v) = entity.get(key).and_then(label_value) {
                record.labels.insert(key.to_string(), v);
            }
        }
        if let Some(attributes) = entity.get("attributes").and_then(Value::as_object) {
            for (k, v) in attributes {
                if let Some(v) = label_value(v) {
                    record.labels.entry(k.clone()).or_insert(v);
                }
            }
        }

        let metrics = match entity.get("metrics") {
            Some(Value::Array(metrics)) => metrics.as_slice(),
            Some(Value::Null) | None => &[],
            Some(_) => return Err(FetchError::Parse("entity 'metrics' is not an array".into())),
        };
        for metric in metrics {
            let name = metric
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| FetchError::Parse("metric without a name".into()))?;
            if excluded.contains(name) {
                continue;
            }
            match metric.get("value") {
                Some(v) => {
                    if let Some(v) = numeric_value(v) {
                        record.values.insert(name.to_string(), v);
                    }
                }
                None => {
                    // Histogram: one value per numeric summary field.
                    if let Some(fields) = metric.as_object() {
                        for (field, v) in fields {
                            if field == "name" {
                                continue;
                            }
                            if let Some(v) = v.as_f64() {
                                record.values.insert(format!("{}_{}", name, field), v);
                            }
                        }
                    }
                }
            }
        }

        if !record.is_empty() {
            records.push(record);
        }
    }
    Ok(records)
}

fn numeric_value(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn label_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
