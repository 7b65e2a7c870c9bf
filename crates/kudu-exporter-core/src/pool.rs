//! Fixed-size worker pool that executes fetch tasks.
//!
//! A bounded channel feeds `size` worker tasks that share its receiver. Every
//! job runs in its own spawned task under the per-task timeout, so a panic
//! or a hung node only costs that job, never the worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kudu_exporter_config::{Backpressure, FetcherConfig};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::{FetchError, SubmitError};
use crate::task::FetchTask;

/// A fetch task together with the cycle that submitted it.
pub struct FetchJob {
    pub cycle: u64,
    pub task: Box<dyn FetchTask>,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub queue_capacity: usize,
    pub task_timeout: Duration,
    pub backpressure: Backpressure,
}

impl From<&FetcherConfig> for PoolConfig {
    fn from(config: &FetcherConfig) -> Self {
        Self {
            size: config.pool_size,
            queue_capacity: config.queue_capacity,
            task_timeout: config.timeout,
            backpressure: config.backpressure,
        }
    }
}

/// Counters describing what the pool has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub dropped: u64,
}

impl PoolStats {
    /// Jobs that have left the pool, successfully or not.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.timed_out
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct WorkerPool {
    sender: mpsc::Sender<FetchJob>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
    backpressure: Backpressure,
}

impl WorkerPool {
    /// Spawn the workers. Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let shared_rx = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let size = config.size.max(1);
        let workers = (0..size)
            .map(|worker_id| {
                let rx = shared_rx.clone();
                let counters = counters.clone();
                let timeout = config.task_timeout;
                tokio::spawn(async move {
                    tracing::debug!(worker_id, "Fetch worker started");
                    loop {
                        let job = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        match job {
                            Some(job) => execute(job, timeout, &counters).await,
                            None => break,
                        }
                    }
                    tracing::debug!(worker_id, "Fetch worker stopped");
                })
            })
            .collect();

        tracing::info!(
            workers = size,
            queue_capacity = config.queue_capacity,
            timeout = ?config.task_timeout,
            backpressure = ?config.backpressure,
            "Fetch worker pool started"
        );

        Self {
            sender,
            workers,
            counters,
            backpressure: config.backpressure,
        }
    }

    /// Queue a job according to the backpressure policy.
    ///
    /// With [`Backpressure::Drop`] this never waits; a full queue drops the
    /// job. With [`Backpressure::Block`] it waits for queue space.
    pub async fn submit(&self, job: FetchJob) -> Result<(), SubmitError> {
        let node = job.task.node();
        match self.backpressure {
            Backpressure::Drop => match self.sender.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%node, cycle = job.cycle, "Fetch queue full, dropping task");
                    return Err(SubmitError::QueueFull(node));
                }
                Err(TrySendError::Closed(_)) => return Err(SubmitError::Closed),
            },
            Backpressure::Block => {
                self.sender.send(job).await.map_err(|_| SubmitError::Closed)?;
            }
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting jobs and give queued and running jobs up to `grace` to
    /// finish. Jobs still queued or running after that are aborted and never
    /// reach the store.
    ///
    /// Returns the final counters and whether the pool drained in time.
    pub async fn shutdown(self, grace: Duration) -> (PoolStats, bool) {
        let WorkerPool {
            sender,
            mut workers,
            counters,
            ..
        } = self;
        drop(sender);

        // Finished workers are popped so that only unfinished ones remain.
        let drained = tokio::time::timeout(grace, async {
            while let Some(worker) = workers.last_mut() {
                let _ = worker.await;
                workers.pop();
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!(?grace, "Fetch workers did not drain in time, aborting in-flight tasks");
            for worker in &workers {
                worker.abort();
            }
            // Dropping a worker's future aborts the job it was running.
            for worker in workers {
                let _ = worker.await;
            }
        }
        (counters.snapshot(), drained)
    }
}

/// Aborts the job task when the worker running it is itself aborted.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn execute(job: FetchJob, timeout: Duration, counters: &Counters) {
    let FetchJob { cycle, task } = job;
    let node = task.node();

    let handle = tokio::spawn(async move { tokio::time::timeout(timeout, task.run()).await });
    let _abort = AbortOnDrop(handle.abort_handle());
    match handle.await {
        Ok(Ok(Ok(()))) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%node, cycle, "Fetch task completed");
        }
        Ok(Ok(Err(e))) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%node, cycle, error = %e, "Fetch task failed");
        }
        Ok(Err(_elapsed)) => {
            counters.timed_out.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%node, cycle, error = %FetchError::Timeout(timeout), "Fetch task failed");
        }
        Err(e) if e.is_panic() => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(%node, cycle, error = %FetchError::Panicked, "Fetch task failed");
        }
        Err(_) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%node, cycle, "Fetch task cancelled");
        }
    }
}
