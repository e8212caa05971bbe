mod cluster;
mod collector;
mod config;
mod error;
mod export;
mod http;
mod kafka;
mod lifecycle;
mod metrics;
#[cfg(test)]
mod test_strategies;

use crate::cluster::ClusterManager;
use crate::config::{Config, Overrides};
use crate::export::prometheus::PrometheusExporter;
use crate::http::server::HttpServer;
use crate::kafka::{ClusterClient, KafkaClient};
use crate::lifecycle::Lifecycle;
use crate::metrics::store::MetricsStore;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Parser, Debug)]
#[command(name = "kafka-offset-exporter")]
#[command(about = "Kafka partition offset and consumer group lag exporter")]
#[command(version)]
struct Args {
    /// Path to an optional TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Comma-separated bootstrap brokers, `host[:port]`
    #[arg(long)]
    brokers: Option<String>,

    /// Regex selecting the topics to scrape; empty matches all
    #[arg(long)]
    topics: Option<String>,

    /// Regex selecting the consumer groups to scrape; empty matches none
    #[arg(long)]
    groups: Option<String>,

    /// HTTP listen port
    #[arg(long)]
    port: Option<u16>,

    /// HTTP path serving metrics
    #[arg(long)]
    path: Option<String>,

    /// Metadata refresh interval (e.g. "1m")
    #[arg(long, value_parser = humantime::parse_duration)]
    refresh: Option<Duration>,

    /// Minimum interval between fetches of the same offset
    #[arg(long, value_parser = humantime::parse_duration)]
    fetch_min: Option<Duration>,

    /// Maximum age of a fetched offset before it is re-fetched
    #[arg(long, value_parser = humantime::parse_duration)]
    fetch_max: Option<Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            brokers: self.brokers.clone(),
            topics: self.topics.clone(),
            groups: self.groups.clone(),
            port: self.port,
            path: self.path.clone(),
            refresh: self.refresh,
            fetch_min: self.fetch_min,
            fetch_max: self.fetch_max,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_format);

    info!("Starting kafka-offset-exporter");

    let config = Config::load(args.config.as_deref(), &args.overrides())?;
    info!(
        brokers = ?config.cluster.bootstrap_hosts(),
        refresh_interval = ?config.scrape.metadata_refresh_interval,
        fetch_min = ?config.scrape.fetch_offset_min_interval,
        fetch_max = ?config.scrape.fetch_offset_max_interval,
        "Configuration loaded"
    );

    let client: Arc<dyn ClusterClient> =
        Arc::new(KafkaClient::new(&config.cluster, config.scrape.kafka_timeout)?);
    let brokers = client.list_brokers().await?;
    let addrs: Vec<String> = brokers.iter().map(|b| b.addr()).collect();
    info!(brokers = ?addrs, "connected to cluster");

    let store = Arc::new(MetricsStore::new());
    let lifecycle = Lifecycle::new();

    let manager = ClusterManager::new(Arc::clone(&client), &config, Arc::clone(&store))?;
    manager.start(&lifecycle).await?;

    let http_server = HttpServer::new(
        &config.exporter.http_host,
        config.exporter.http_port,
        &config.exporter.metrics_path,
        PrometheusExporter::new(Arc::clone(&store)),
    )?;
    let server_token = lifecycle.token().clone();
    let server_lifecycle = lifecycle.clone();
    lifecycle.spawn(async move {
        if let Err(e) = http_server.run(server_token).await {
            error!(error = %e, "HTTP server error");
            // Without the endpoint there is nothing left to serve
            server_lifecycle.shutdown();
        }
    });

    tokio::select! {
        () = shutdown_signal() => info!("Shutdown signal received, stopping..."),
        () = lifecycle.token().cancelled() => info!("Stopping after an internal failure"),
    }

    lifecycle.shutdown();
    if !lifecycle.wait(config.exporter.shutdown_timeout).await {
        error!("Timeout waiting for in-flight fetches to finish");
    }

    info!("kafka-offset-exporter stopped");
    Ok(())
}

fn init_logging(level: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use signal::unix::{SignalKind, signal};

        let (mut term, mut hangup) =
            match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
                (Ok(term), Ok(hangup)) => (term, hangup),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handler");
                    return std::future::pending::<()>().await;
                }
            };

        tokio::select! {
            _ = term.recv() => {},
            _ = hangup.recv() => {},
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
