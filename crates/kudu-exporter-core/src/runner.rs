use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawns the exporter's long-running loops and stops them together.
pub struct BackgroundRunner {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundRunner {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn spawn<F, Fut>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rx = self.shutdown_tx.subscribe();
        tracing::debug!(task = name, "Spawning background task");
        self.handles.push((name, tokio::spawn(f(rx))));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every task and wait up to `timeout` for each; stragglers are
    /// aborted.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        for (name, mut handle) in self.handles {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "Background task stopped"),
                Ok(Err(e)) => tracing::error!(task = name, error = %e, "Background task failed"),
                Err(_) => {
                    tracing::warn!(task = name, ?timeout, "Background task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Default for BackgroundRunner {
    fn default() -> Self {
        Self::new()
    }
}
