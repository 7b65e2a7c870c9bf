//! Fetch, store and report engine of the Kudu exporter.
//!
//! A [`FetchScheduler`] wakes up on a fixed interval and hands one
//! [`FetchTask`] per configured node to a bounded [`WorkerPool`]. Each task
//! fetches its node's metrics and writes them into the shared
//! [`MetricStore`], replacing the previous result for that node. The
//! report side ([`ReportServer`] for scrapes, [`ReportScheduler`] for timer
//! driven sinks) only ever reads store snapshots, so a slow or dead node
//! never blocks exposition.

pub mod error;
pub mod kudu;
pub mod metric;
pub mod pool;
pub mod render;
pub mod reporter;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod task;
pub mod ticker;

pub use error::{FetchError, RenderError, ReportError, StoreError, SubmitError};
pub use metric::{MetricCollection, MetricRecord, NodeId, StoreSnapshot};
pub use pool::{FetchJob, PoolConfig, PoolStats, WorkerPool};
pub use render::PrometheusRenderer;
pub use reporter::{FileSink, InMemorySink, LogSink, ReportScheduler, ReportSink};
pub use runner::BackgroundRunner;
pub use scheduler::{CycleReport, FetchScheduler};
pub use server::ReportServer;
pub use store::MetricStore;
pub use task::{FetchTask, FetchTaskFactory, FetchTaskRegistry};
pub use ticker::{IntervalTicker, ManualTicker, ManualTickerHandle, Ticker};
