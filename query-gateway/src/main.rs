// ABOUTME: CLI entry point for the query gateway
// ABOUTME: Connects to the destination store and serves HTTP until SIGINT/SIGTERM

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ct_replicator::config::DestinationArgs;
use ct_replicator::shutdown::spawn_signal_handler;
use ct_replicator::tracking::PostgresDestination;
use ct_replicator::utils::parse_duration;
use query_gateway::{router, serve, DestinationExecutor, GatewayConfig};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "query-gateway")]
#[command(about = "HTTP query access to the replicated store", long_about = None)]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "GATEWAY_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
    #[command(flatten)]
    destination: DestinationArgs,
    /// Upper bound for one query request
    #[arg(long = "query-timeout", default_value = "30s", value_parser = parse_duration)]
    query_timeout: Duration,
    /// How long in-flight requests may drain on shutdown
    #[arg(long = "shutdown-timeout", default_value = "10s", value_parser = parse_duration)]
    shutdown_timeout: Duration,
    /// Rows fetched from the store per round trip
    #[arg(long = "page-size", default_value_t = 1000)]
    page_size: i32,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let destination_config = cli.destination.to_config();
    let target = destination_config.display_target();
    let destination = PostgresDestination::new(destination_config);

    // The store may still be starting; requests reconnect on demand
    match destination.query("SELECT 1", &[], 1).await {
        Ok(_) => tracing::info!("Destination store {} reachable", target),
        Err(e) => tracing::warn!("Destination store {} not reachable yet: {}", target, e),
    }

    let config = GatewayConfig {
        query_timeout: cli.query_timeout,
        shutdown_timeout: cli.shutdown_timeout,
    };
    let app = router(
        Arc::new(DestinationExecutor::new(destination, cli.page_size)),
        &config,
    );

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", cli.listen))?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    serve(listener, app, shutdown, config.shutdown_timeout).await
}
