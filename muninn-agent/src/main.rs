#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use muninn_agent_lib::config::{load_from_path, Config, LoggingConfig};
use muninn_agent_lib::{
    ConnectionTracker, FramedTcpClient, NetworkStatusNotifier, ProcfsScraper, Scraper,
    StoppableWorker,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Muninn node agent (per-node network observability)")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "MUNINN_CONFIG",
        default_value = "config/agent.toml"
    )]
    config: PathBuf,

    /// Override the aggregator host:port
    #[arg(long, env = "MUNINN_AGGREGATOR")]
    aggregator: Option<String>,

    /// Override the procfs root to scrape
    #[arg(long, env = "MUNINN_PROC_ROOT")]
    proc_root: Option<PathBuf>,

    /// Override the scrape interval in seconds
    #[arg(long, env = "MUNINN_SCRAPE_INTERVAL")]
    scrape_interval: Option<u64>,

    /// Override the afterglow period in seconds (0 disables)
    #[arg(long, env = "MUNINN_AFTERGLOW_PERIOD")]
    afterglow_period: Option<u64>,
}

impl Cli {
    fn apply_overrides(&self, cfg: &mut Config) {
        if let Some(aggregator) = &self.aggregator {
            cfg.aggregator = aggregator.clone();
        }
        if let Some(proc_root) = &self.proc_root {
            cfg.scrape.proc_root = proc_root.clone();
        }
        if let Some(interval) = self.scrape_interval {
            cfg.scrape.interval_secs = interval;
        }
        if let Some(period) = self.afterglow_period {
            cfg.afterglow.period_secs = period;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut cfg = match load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            init_tracing(&LoggingConfig::default());
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    cli.apply_overrides(&mut cfg);
    init_tracing(&cfg.logging);

    let aggregator = match cfg.aggregator() {
        Ok(aggregator) => aggregator,
        Err(err) => {
            error!(%err, "invalid aggregator address");
            std::process::exit(1);
        }
    };
    info!(
        %aggregator,
        proc_root = %cfg.scrape.proc_root.display(),
        interval_secs = cfg.scrape.interval_secs,
        afterglow_secs = cfg.afterglow.period_secs,
        "configuration loaded"
    );

    let tracker = Arc::new(ConnectionTracker::new(cfg.afterglow_period()));
    let scraper: Arc<dyn Scraper> = Arc::new(
        ProcfsScraper::new(&cfg.scrape.proc_root)
            .with_listen_endpoints(cfg.scrape.listen_endpoints)
            .with_udp_listeners(cfg.scrape.udp_listen_endpoints),
    );
    let client = FramedTcpClient::new(aggregator, cfg.probe_timeout());

    let worker = StoppableWorker::new();
    let notifier = NetworkStatusNotifier::new(
        client,
        scraper,
        tracker,
        cfg.scrape_interval(),
        worker.token(),
    );
    worker.start(notifier.run());

    wait_for_signal().await;
    info!("shutdown signal received, stopping notifier");
    worker.stop().await;
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            error!(%err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(logging.show_target)
        .init();
}
