//! Report sinks and the timer-driven report scheduler.
//!
//! The HTTP exposition path lives in [`crate::server`]; this module covers
//! the push-style modes where the exporter itself publishes on a timer:
//!
//! - `LogSink`: Logs every value via `tracing`.
//! - `FileSink`: Atomically replaces a Prometheus text file.
//! - `InMemorySink`: Keeps published snapshots for testing.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::ReportError;
use crate::metric::StoreSnapshot;
use crate::render::PrometheusRenderer;
use crate::store::MetricStore;
use crate::ticker::{shutdown_requested, Ticker};

/// Destination for one published snapshot.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, snapshot: &StoreSnapshot) -> Result<(), ReportError>;
}

/// Publishes snapshots by logging every value.
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn publish(&self, snapshot: &StoreSnapshot) -> Result<(), ReportError> {
        for (node, collection) in snapshot.iter() {
            for record in &collection.records {
                for (name, value) in &record.values {
                    tracing::info!(
                        %node,
                        source = %collection.source,
                        name = %name,
                        value = *value,
                        labels = ?record.labels,
                        fetched_at = %collection.fetched_at,
                        "metric sample"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Writes the rendered exposition to a file for a textfile collector.
///
/// The file is written next to its final path and renamed into place, so a
/// reader never sees a partial body.
pub struct FileSink {
    path: PathBuf,
    renderer: PrometheusRenderer,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, renderer: PrometheusRenderer) -> Self {
        Self {
            path: path.into(),
            renderer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[async_trait]
impl ReportSink for FileSink {
    async fn publish(&self, snapshot: &StoreSnapshot) -> Result<(), ReportError> {
        let body = self.renderer.render(snapshot)?;
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ReportError::Io { path, source }
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, body).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err(&self.path))?;
        Ok(())
    }
}

/// Stores published snapshots in memory for testing and inspection.
pub struct InMemorySink {
    snapshots: Mutex<Vec<StoreSnapshot>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(Vec::new()),
        }
    }

    /// Take all stored snapshots, leaving the buffer empty.
    pub fn take(&self) -> Vec<StoreSnapshot> {
        std::mem::take(&mut *self.snapshots.lock())
    }

    pub fn count(&self) -> usize {
        self.snapshots.lock().len()
    }
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReportSink for InMemorySink {
    async fn publish(&self, snapshot: &StoreSnapshot) -> Result<(), ReportError> {
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }
}

/// Publishes one store snapshot per tick. Never starts or waits on a fetch.
pub struct ReportScheduler {
    store: MetricStore,
    sink: Arc<dyn ReportSink>,
}

impl ReportScheduler {
    pub fn new(store: MetricStore, sink: Arc<dyn ReportSink>) -> Self {
        Self { store, sink }
    }

    /// Publish the current store contents once.
    pub async fn report_once(&self) -> Result<(), ReportError> {
        let snapshot = self.store.snapshot();
        self.sink.publish(&snapshot).await
    }

    /// Publish on every tick until `shutdown` fires or the ticker is
    /// exhausted. Returns the number of successful publishes.
    pub async fn run<T: Ticker>(self, mut ticker: T, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut published = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    tracing::info!(published, "Report scheduler interrupted");
                    break;
                }
                ticked = ticker.tick() => {
                    if !ticked {
                        tracing::info!(published, "Report ticker exhausted");
                        break;
                    }
                    match self.report_once().await {
                        Ok(()) => published += 1,
                        Err(e) => tracing::warn!(error = %e, "Failed to publish metrics"),
                    }
                }
            }
        }
        published
    }
}
