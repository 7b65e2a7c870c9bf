//! Configuration for the Kudu exporter.
//!
//! The whole exporter is driven by one immutable [`ExporterConfig`] value,
//! loaded from TOML at start-up, optionally overridden from the command line,
//! and validated once before anything is started. After validation it is
//! shared read-only behind an `Arc`.

pub mod config;
pub mod error;

pub use config::{
    Backpressure, ExporterConfig, FetcherConfig, ReporterConfig, ReporterMode, Scheme,
    StoreConfig, MAX_POOL_SIZE,
};
pub use error::ConfigError;
pub use kudu_exporter_logging::LogConfig;
