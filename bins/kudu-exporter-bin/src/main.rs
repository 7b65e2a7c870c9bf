use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kudu_exporter_app::{run_application, ExporterApp};
use kudu_exporter_config::ExporterConfig;
use kudu_exporter_core::FetchTaskRegistry;

/// Prometheus exporter for Apache Kudu masters and tablet servers
#[derive(Parser, Debug)]
#[command(name = "kudu-exporter", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma-separated host:port list of Kudu nodes
    #[arg(long, value_delimiter = ',')]
    nodes: Vec<String>,

    /// Fetch interval in seconds
    #[arg(long)]
    interval: Option<f64>,

    /// Address the metrics endpoint listens on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Fetcher plugin name
    #[arg(long)]
    fetcher: Option<String>,

    /// Dump default configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

impl Args {
    fn apply(&self, config: &mut ExporterConfig) -> anyhow::Result<()> {
        if !self.nodes.is_empty() {
            config.nodes = self.nodes.clone();
        }
        if let Some(secs) = self.interval {
            config.fetcher.interval = Duration::try_from_secs_f64(secs)
                .with_context(|| format!("invalid --interval {}", secs))?;
        }
        if let Some(addr) = self.listen {
            config.reporter.listen_addr = addr;
        }
        if let Some(plugin) = &self.fetcher {
            config.fetcher.plugin = plugin.clone();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        print!("{}", ExporterConfig::default().to_toml_string()?);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => ExporterConfig::load_unvalidated(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ExporterConfig::default(),
    };
    args.apply(&mut config)?;
    config.validate().context("invalid configuration")?;

    let _guard = kudu_exporter_logging::init_logging(&config.log)?;
    tracing::info!(
        config = ?args.config,
        nodes = config.nodes.len(),
        "Starting Kudu exporter"
    );

    let app = ExporterApp::new(FetchTaskRegistry::with_builtin());
    run_application(app, config).await?;
    tracing::info!("Kudu exporter stopped");
    Ok(())
}
