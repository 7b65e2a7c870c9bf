use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kudu_exporter_config::{ConfigError, ExporterConfig, ReporterMode};
use kudu_exporter_core::{
    BackgroundRunner, FetchScheduler, FetchTaskRegistry, FileSink, IntervalTicker, LogSink,
    MetricStore, PrometheusRenderer, ReportScheduler, ReportServer, ReportSink,
};
use tokio::net::TcpListener;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("application started before init")]
    NotInitialized,
}

/// Lifecycle of a long-running service.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    type Config: Clone + Send + Sync;

    fn name(&self) -> &str;
    async fn init(&mut self, config: &Self::Config) -> Result<(), AppError>;
    async fn start(&mut self) -> Result<(), AppError>;
    async fn stop(&mut self) -> Result<(), AppError>;
}

/// Wait for a shutdown signal (CTRL+C or SIGTERM).
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => { tracing::info!("Received CTRL+C"); }
                    _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM, waiting for CTRL+C only");
            }
        }
    }
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received CTRL+C"),
        Err(e) => tracing::error!(error = %e, "Cannot listen for CTRL+C, shutting down"),
    }
}

/// Run an application through its full lifecycle: init, start, wait for shutdown, stop.
pub async fn run_application<A: Application>(app: A, config: A::Config) -> Result<(), AppError> {
    run_until(app, config, wait_for_shutdown_signal()).await
}

/// Like [`run_application`], but stops when `signal` resolves.
pub async fn run_until<A, F>(mut app: A, config: A::Config, signal: F) -> Result<(), AppError>
where
    A: Application,
    F: Future<Output = ()>,
{
    app.init(&config).await?;
    app.start().await?;
    tracing::info!(app = app.name(), "Started");
    signal.await;
    tracing::info!(app = app.name(), "Stopping");
    app.stop().await?;
    Ok(())
}

/// The exporter: a fetch scheduler filling the store and one reporter
/// reading it.
pub struct ExporterApp {
    registry: FetchTaskRegistry,
    config: Option<Arc<ExporterConfig>>,
    store: MetricStore,
    runner: Option<BackgroundRunner>,
    local_addr: Option<SocketAddr>,
}

impl ExporterApp {
    pub fn new(registry: FetchTaskRegistry) -> Self {
        Self {
            registry,
            config: None,
            store: MetricStore::new(),
            runner: None,
            local_addr: None,
        }
    }

    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    /// Address the HTTP reporter is bound to, once started in `http` mode.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn start_fetcher(&self, config: &Arc<ExporterConfig>, runner: &mut BackgroundRunner) {
        let scheduler = match FetchScheduler::new(config.clone(), self.store.clone(), &self.registry) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                tracing::error!(error = %e, "Fetch scheduler failed to start, serving without fetching");
                return;
            }
        };
        let interval = config.fetch_interval();
        runner.spawn("fetch-scheduler", move |shutdown| async move {
            let stats = scheduler.run(IntervalTicker::new(interval), shutdown).await;
            tracing::info!(?stats, "Fetch scheduler finished");
        });
    }

    async fn start_reporter(
        &mut self,
        config: &Arc<ExporterConfig>,
        runner: &mut BackgroundRunner,
    ) -> Result<(), AppError> {
        let reporter = &config.reporter;
        let renderer = PrometheusRenderer::from_config(reporter);
        let sink: Arc<dyn ReportSink> = match reporter.mode {
            ReporterMode::Http => {
                let addr = reporter.listen_addr;
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|source| AppError::Bind { addr, source })?;
                self.local_addr = listener.local_addr().ok();
                let server = ReportServer::new(self.store.clone(), renderer);
                runner.spawn("report-server", move |shutdown| async move {
                    if let Err(e) = server.serve(listener, shutdown).await {
                        tracing::error!(error = %e, "Metrics server failed");
                    }
                });
                return Ok(());
            }
            ReporterMode::Log => Arc::new(LogSink),
            ReporterMode::File => Arc::new(FileSink::new(reporter.file_path.clone(), renderer)),
        };

        let interval = reporter.interval;
        let scheduler = ReportScheduler::new(self.store.clone(), sink);
        runner.spawn("report-scheduler", move |shutdown| async move {
            let published = scheduler.run(IntervalTicker::new(interval), shutdown).await;
            tracing::info!(published, "Report scheduler finished");
        });
        Ok(())
    }
}

#[async_trait]
impl Application for ExporterApp {
    type Config = ExporterConfig;

    fn name(&self) -> &str {
        "kudu-exporter"
    }

    async fn init(&mut self, config: &ExporterConfig) -> Result<(), AppError> {
        config.validate()?;
        self.store = MetricStore::from_config(&config.store);
        self.config = Some(Arc::new(config.clone()));
        tracing::info!(
            nodes = config.nodes.len(),
            plugin = %config.fetcher.plugin,
            mode = ?config.reporter.mode,
            "Exporter initialized"
        );
        Ok(())
    }

    async fn start(&mut self) -> Result<(), AppError> {
        let config = self.config.clone().ok_or(AppError::NotInitialized)?;
        let mut runner = BackgroundRunner::new();
        self.start_fetcher(&config, &mut runner);
        if let Err(e) = self.start_reporter(&config, &mut runner).await {
            runner.shutdown(config.shutdown_grace).await;
            return Err(e);
        }
        self.runner = Some(runner);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AppError> {
        let grace = self
            .config
            .as_ref()
            .map(|c| c.shutdown_grace)
            .unwrap_or(Duration::from_secs(5));
        if let Some(runner) = self.runner.take() {
            // The fetch loop spends up to `grace` draining its pool.
            runner.shutdown(grace * 2).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kudu_exporter_core::{FetchError, FetchTask, MetricCollection, MetricRecord, NodeId};

    struct ConstTask {
        node: NodeId,
        source: String,
        store: MetricStore,
    }

    #[async_trait]
    impl FetchTask for ConstTask {
        fn node(&self) -> NodeId {
            self.node
        }

        async fn run(self: Box<Self>) -> Result<(), FetchError> {
            let ConstTask { node, source, store } = *self;
            let record = MetricRecord::new().with_value("metric1", f64::from(*node) + 1.0);
            store.put(node, MetricCollection::new(source, vec![record]))?;
            Ok(())
        }
    }

    fn registry() -> FetchTaskRegistry {
        let mut registry = FetchTaskRegistry::new();
        registry.register(
            "const",
            Arc::new(
                |node: NodeId,
                 config: Arc<ExporterConfig>,
                 store: MetricStore|
                 -> Result<Box<dyn FetchTask>, ConfigError> {
                    let source = config.node_address(node.index()).unwrap_or_default().to_string();
                    Ok(Box::new(ConstTask { node, source, store }))
                },
            ),
        );
        registry
    }

    fn config(plugin: &str) -> ExporterConfig {
        let mut config = ExporterConfig {
            nodes: vec!["n0:8050".into(), "n1:8050".into()],
            ..Default::default()
        };
        config.fetcher.plugin = plugin.into();
        config.reporter.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.shutdown_grace = Duration::from_secs(1);
        config
    }

    #[tokio::test]
    async fn test_start_requires_init() {
        let mut app = ExporterApp::new(registry());
        assert!(matches!(app.start().await, Err(AppError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_init_rejects_invalid_config() {
        let mut app = ExporterApp::new(registry());
        let mut cfg = config("const");
        cfg.nodes.clear();
        assert!(matches!(app.init(&cfg).await, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_fetch_and_serve() {
        let mut app = ExporterApp::new(registry());
        app.init(&config("const")).await.unwrap();
        app.start().await.unwrap();
        let addr = app.local_addr().unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while app.store().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("kudu_metric1{node=\"n0:8050\"} 1"));
        assert!(body.contains("kudu_metric1{node=\"n1:8050\"} 2"));

        app.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_fetcher_still_serves() {
        let mut app = ExporterApp::new(registry());
        app.init(&config("missing")).await.unwrap();
        app.start().await.unwrap();
        let addr = app.local_addr().unwrap();

        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("kudu_exporter_nodes 0"));
        assert!(app.store().is_empty());

        app.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_until_signal() {
        let mut cfg = config("const");
        cfg.reporter.mode = ReporterMode::Log;
        cfg.reporter.interval = Duration::from_millis(10);
        let signal = tokio::time::sleep(Duration::from_millis(50));
        run_until(ExporterApp::new(registry()), cfg, signal).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = config("const");
        cfg.reporter.listen_addr = taken.local_addr().unwrap();

        let mut app = ExporterApp::new(registry());
        app.init(&cfg).await.unwrap();
        assert!(matches!(app.start().await, Err(AppError::Bind { .. })));
    }
}
