//! The fetch scheduler: one control loop that submits a fetch task per node
//! on every tick and never waits for them.

use std::sync::Arc;

use kudu_exporter_config::{ConfigError, ExporterConfig};
use tokio::sync::watch;

use crate::error::SubmitError;
use crate::metric::NodeId;
use crate::pool::{FetchJob, PoolConfig, PoolStats, WorkerPool};
use crate::store::MetricStore;
use crate::task::{FetchTaskFactory, FetchTaskRegistry};
use crate::ticker::{shutdown_requested, Ticker};

/// What one cycle managed to hand to the worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub submitted: usize,
    pub dropped: usize,
    /// Nodes whose task could not be built this cycle.
    pub skipped: usize,
    /// Shutdown fired before every node was submitted.
    pub interrupted: bool,
}

pub struct FetchScheduler {
    config: Arc<ExporterConfig>,
    store: MetricStore,
    factory: FetchTaskFactory,
    nodes: Vec<NodeId>,
    pool: WorkerPool,
}

impl FetchScheduler {
    /// Resolve the configured fetcher and check that a task can be built for
    /// every node. Any failure here is a configuration error that would
    /// recur every cycle, so the scheduler is not created.
    ///
    /// Spawns the worker pool, so it must be called within a tokio runtime.
    pub fn new(
        config: Arc<ExporterConfig>,
        store: MetricStore,
        registry: &FetchTaskRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let factory = registry.resolve(&config.fetcher.plugin)?;

        let nodes = (0..config.nodes.len())
            .map(|index| {
                NodeId::try_from(index)
                    .map_err(|_| ConfigError::Invalid(format!("too many nodes ({})", config.nodes.len())))
            })
            .collect::<Result<Vec<_>, _>>()?;
        for node in &nodes {
            factory(*node, config.clone(), store.clone())?;
        }

        let pool = WorkerPool::new(PoolConfig::from(&config.fetcher));
        tracing::info!(
            plugin = %config.fetcher.plugin,
            nodes = nodes.len(),
            interval = ?config.fetch_interval(),
            "Fetch scheduler ready"
        );

        Ok(Self {
            config,
            store,
            factory,
            nodes,
            pool,
        })
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Submit one fresh task per node without waiting for any of them.
    pub async fn run_cycle(&self, cycle: u64) -> CycleReport {
        self.submit_cycle(cycle, None).await
    }

    /// Like [`run_cycle`](Self::run_cycle), but a submission blocked on a
    /// full queue is abandoned, along with the rest of the cycle, once
    /// `shutdown` fires.
    async fn submit_cycle(&self, cycle: u64, mut shutdown: Option<&mut watch::Receiver<bool>>) -> CycleReport {
        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };

        for &node in &self.nodes {
            let task = match (self.factory)(node, self.config.clone(), self.store.clone()) {
                Ok(task) => task,
                Err(e) => {
                    report.skipped += 1;
                    tracing::error!(%node, cycle, error = %e, "Cannot build fetch task");
                    continue;
                }
            };
            let job = FetchJob { cycle, task };
            let result = match shutdown.as_deref_mut() {
                Some(rx) => tokio::select! {
                    biased;
                    _ = shutdown_requested(rx) => {
                        report.interrupted = true;
                        tracing::info!(%node, cycle, "Shutdown requested, abandoning rest of cycle");
                        break;
                    }
                    result = self.pool.submit(job) => result,
                },
                None => self.pool.submit(job).await,
            };
            match result {
                Ok(()) => report.submitted += 1,
                Err(SubmitError::QueueFull(_)) => report.dropped += 1,
                Err(SubmitError::Closed) => {
                    tracing::error!(cycle, "Worker pool closed, abandoning cycle");
                    break;
                }
            }
        }

        tracing::debug!(
            cycle,
            submitted = report.submitted,
            dropped = report.dropped,
            skipped = report.skipped,
            interrupted = report.interrupted,
            "Fetch cycle submitted"
        );
        report
    }

    /// Run cycles on every tick until `shutdown` fires or the ticker is
    /// exhausted, then shut the pool down with the configured grace period.
    pub async fn run<T: Ticker>(self, mut ticker: T, mut shutdown: watch::Receiver<bool>) -> PoolStats {
        let mut cycle = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    tracing::info!(cycles = cycle, "Fetch scheduler interrupted, no further cycles");
                    break;
                }
                ticked = ticker.tick() => {
                    if !ticked {
                        tracing::info!(cycles = cycle, "Fetch ticker exhausted");
                        break;
                    }
                    cycle += 1;
                    if self.submit_cycle(cycle, Some(&mut shutdown)).await.interrupted {
                        tracing::info!(cycles = cycle, "Fetch scheduler interrupted, no further cycles");
                        break;
                    }
                }
            }
        }
        self.shutdown().await
    }

    /// Stop the worker pool, giving in-flight fetches the configured grace.
    pub async fn shutdown(self) -> PoolStats {
        let grace = self.config.shutdown_grace;
        let (stats, drained) = self.pool.shutdown(grace).await;
        tracing::info!(
            completed = stats.completed,
            failed = stats.failed,
            timed_out = stats.timed_out,
            dropped = stats.dropped,
            drained,
            "Fetch scheduler stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_support::{Outcome, Script};
    use crate::task::FetchTask;
    use crate::ticker::manual_ticker;
    use std::time::Duration;

    fn config(nodes: usize) -> Arc<ExporterConfig> {
        let mut config = ExporterConfig {
            nodes: (0..nodes).map(|i| format!("node-{}:8050", i)).collect(),
            ..Default::default()
        };
        config.fetcher.plugin = "scripted".into();
        config.fetcher.interval = Duration::from_secs(5);
        config.fetcher.timeout = Duration::from_secs(1);
        config.fetcher.pool_size = 4;
        Arc::new(config)
    }

    async fn wait_for_finished(scheduler: &FetchScheduler, finished: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.pool_stats().finished() < finished {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fetch tasks did not finish");
    }

    #[tokio::test]
    async fn test_one_cycle_with_partial_failure() {
        let script = Script::default();
        script
            .set(0, vec![Outcome::Succeed(vec![("metric1", 10.0)])])
            .set(1, vec![Outcome::Succeed(vec![("metric1", 20.0)])])
            .set(2, vec![Outcome::Fail]);

        let store = MetricStore::new();
        let scheduler = FetchScheduler::new(config(3), store.clone(), &script.registry()).unwrap();

        let report = scheduler.run_cycle(1).await;
        assert_eq!(report.submitted, 3);
        wait_for_finished(&scheduler, 3).await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(NodeId(0)).unwrap().value("metric1"), Some(10.0));
        assert_eq!(snapshot.get(NodeId(1)).unwrap().value("metric1"), Some(20.0));
        assert!(snapshot.get(NodeId(2)).is_none());

        let stats = scheduler.shutdown().await;
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_stale_value() {
        let script = Script::default();
        script.set(0, vec![Outcome::Succeed(vec![("m", 1.0)]), Outcome::Fail]);

        let store = MetricStore::new();
        let scheduler = FetchScheduler::new(config(1), store.clone(), &script.registry()).unwrap();

        scheduler.run_cycle(1).await;
        wait_for_finished(&scheduler, 1).await;
        assert_eq!(store.get(NodeId(0)).unwrap().value("m"), Some(1.0));

        scheduler.run_cycle(2).await;
        wait_for_finished(&scheduler, 2).await;
        assert_eq!(scheduler.pool_stats().failed, 1);
        assert_eq!(store.get(NodeId(0)).unwrap().value("m"), Some(1.0));
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_fatal_at_start() {
        let script = Script::default();
        let mut cfg = (*config(2)).clone();
        cfg.fetcher.plugin = "missing".into();

        let result = FetchScheduler::new(Arc::new(cfg), MetricStore::new(), &script.registry());
        assert!(matches!(result, Err(ConfigError::UnknownFetcher { .. })));
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal_at_start() {
        let script = Script::default();
        let mut cfg = (*config(2)).clone();
        cfg.fetcher.timeout = Duration::ZERO;

        let result = FetchScheduler::new(Arc::new(cfg), MetricStore::new(), &script.registry());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_construction_failure_is_fatal_at_start() {
        let mut registry = FetchTaskRegistry::new();
        registry.register(
            "scripted",
            Arc::new(
                |node: NodeId,
                 _config: Arc<ExporterConfig>,
                 _store: MetricStore|
                 -> Result<Box<dyn FetchTask>, ConfigError> {
                    Err(ConfigError::TaskConstruction {
                        node: node.to_string(),
                        reason: "unsupported node type".into(),
                    })
                },
            ),
        );

        let result = FetchScheduler::new(config(2), MetricStore::new(), &registry);
        assert!(matches!(result, Err(ConfigError::TaskConstruction { .. })));
    }

    #[tokio::test]
    async fn test_run_until_shutdown_with_manual_ticker() {
        let script = Script::default();
        script
            .set(0, vec![Outcome::Succeed(vec![("m", 1.0)]), Outcome::Succeed(vec![("m", 2.0)])])
            .set(1, vec![Outcome::Fail]);

        let store = MetricStore::new();
        let scheduler = FetchScheduler::new(config(2), store.clone(), &script.registry()).unwrap();
        let (ticks, ticker) = manual_ticker();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(ticker, shutdown_rx));

        ticks.tick();
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get(NodeId(0)).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(store.get(NodeId(0)).unwrap().value("m"), Some(1.0));

        ticks.tick();
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get(NodeId(0)).unwrap().value("m") != Some(2.0) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 2);
        assert!(store.get(NodeId(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_blocked_submission() {
        let script = Script::default();
        for node in 0..3 {
            script.set(node, vec![Outcome::Sleep(Duration::from_secs(120))]);
        }

        let mut cfg = (*config(3)).clone();
        cfg.fetcher.backpressure = kudu_exporter_config::Backpressure::Block;
        cfg.fetcher.pool_size = 1;
        cfg.fetcher.queue_capacity = 1;
        cfg.fetcher.timeout = Duration::from_secs(30);
        cfg.shutdown_grace = Duration::from_secs(5);
        let scheduler = FetchScheduler::new(Arc::new(cfg), MetricStore::new(), &script.registry()).unwrap();

        let (ticks, ticker) = manual_ticker();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(ticker, shutdown_rx));

        // Node 0 runs, node 1 fills the queue, node 2 blocks the submitter.
        ticks.tick();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let requested_at = tokio::time::Instant::now();
        shutdown_tx.send(true).unwrap();

        let stats = handle.await.unwrap();
        assert_eq!(stats.submitted, 2);
        assert!(requested_at.elapsed() <= Duration::from_secs(6));
        assert_eq!(script.runs.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_node_does_not_affect_others() {
        let script = Script::default();
        script
            .set(0, vec![Outcome::Succeed(vec![("metric1", 10.0)])])
            .set(1, vec![Outcome::Panic])
            .set(2, vec![Outcome::Succeed(vec![("metric1", 30.0)])]);

        let store = MetricStore::new();
        let scheduler = FetchScheduler::new(config(3), store.clone(), &script.registry()).unwrap();

        scheduler.run_cycle(1).await;
        wait_for_finished(&scheduler, 3).await;
        scheduler.run_cycle(2).await;
        wait_for_finished(&scheduler, 6).await;

        assert_eq!(store.get(NodeId(0)).unwrap().value("metric1"), Some(10.0));
        assert_eq!(store.get(NodeId(2)).unwrap().value("metric1"), Some(30.0));
        assert!(store.get(NodeId(1)).is_none());

        let stats = scheduler.shutdown().await;
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetches_do_not_delay_next_cycle() {
        let script = Script::default();
        script.set(0, vec![Outcome::Sleep(Duration::from_millis(800))]);

        let mut cfg = (*config(1)).clone();
        cfg.fetcher.interval = Duration::from_millis(100);
        let cfg = Arc::new(cfg);
        let scheduler = FetchScheduler::new(cfg.clone(), MetricStore::new(), &script.registry()).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ticker = crate::ticker::IntervalTicker::new(cfg.fetch_interval());
        let handle = tokio::spawn(scheduler.run(ticker, shutdown_rx));

        // Five cycles are submitted within 450ms although every fetch takes
        // 800ms: four workers are busy and the fifth task waits in the queue.
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(script.runs.load(std::sync::atomic::Ordering::SeqCst), 4);

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.submitted, 5);
    }
}
