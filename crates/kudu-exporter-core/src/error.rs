//! Error types for the fetch, store and report paths.

use std::path::PathBuf;
use std::time::Duration;

use crate::metric::NodeId;

/// A single fetch of a single node failed.
///
/// Fetch errors never escalate past the task that produced them: they are
/// logged with the node and cycle and the store is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transport-level failure (connect, TLS, reset).
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The node answered with a non-success status.
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// The task did not finish within the configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The payload could not be interpreted.
    #[error("malformed metrics payload: {0}")]
    Parse(String),

    /// The task panicked; the worker that ran it is unaffected.
    #[error("fetch task panicked")]
    Panicked,

    /// The node could not serve metrics for another reason.
    #[error("node unavailable: {0}")]
    Unavailable(String),

    /// The result was fetched but the store refused it.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store already holds `capacity` distinct nodes and `node` is new.
    #[error("store capacity {capacity} exceeded, rejecting new node {node}")]
    CapacityExceeded { node: NodeId, capacity: usize },
}

/// A fetch task could not be handed to the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("fetch queue full, dropping task for node {0}")]
    QueueFull(NodeId),

    #[error("worker pool is shut down")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("prometheus encoding failed: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("rendered exposition is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
