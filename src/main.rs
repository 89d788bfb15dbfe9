// ABOUTME: CLI entry point for ct-replicator
// ABOUTME: Builds configuration, runs pre-flight checks, and drives the sync daemon

use anyhow::{bail, Context};
use clap::Parser;
use ct_replicator::config::{DestinationArgs, SyncConfig, TableFile, DEFAULT_KEY_COLUMN};
use ct_replicator::preflight::run_preflight_checks;
use ct_replicator::shutdown::spawn_signal_handler;
use ct_replicator::tracking::{
    DaemonConfig, FileWatermarkStore, PostgresDestination, SqlServerSource, SyncDaemon,
    SyncEngine, DEFAULT_BATCH_SIZE,
};
use ct_replicator::utils::{mask_connection_string, parse_duration, retry_with_backoff};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Startup connection attempts before giving up.
const CONNECT_RETRIES: u32 = 3;

#[derive(Parser)]
#[command(name = "ct-replicator")]
#[command(
    about = "Incremental SQL Server change-tracking replication into a distributed SQL store",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// SQL Server connection string (ADO.NET style)
    #[arg(long, env = "SQLSERVER_CONN", hide_env_values = true)]
    sqlserver: Option<String>,
    /// Tables to sync, comma separated: name[:key][=destination]
    #[arg(long, env = "SYNC_TABLES")]
    tables: Option<String>,
    /// Key column for tables that do not declare one
    #[arg(long = "default-key-column", default_value = DEFAULT_KEY_COLUMN)]
    default_key_column: String,
    #[command(flatten)]
    destination: DestinationArgs,
    /// Time between sync passes (e.g. 30s, 5m, 1h)
    #[arg(long, env = "SYNC_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    interval: Duration,
    /// Path of the watermark file
    #[arg(long = "state-file", env = "SYNC_STATE_FILE", default_value = "sync_state.json")]
    state_file: PathBuf,
    /// Rows per batch when fully loading a table
    #[arg(long = "batch-size", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    /// TOML file with additional [[tables]] entries
    #[arg(long = "config")]
    config_path: Option<PathBuf>,
    /// Run a single pass and exit
    #[arg(long)]
    once: bool,
    /// Skip the startup pre-flight checks
    #[arg(long = "skip-preflight")]
    skip_preflight: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let table_file = cli
        .config_path
        .as_deref()
        .map(TableFile::load)
        .transpose()
        .context("Failed to load table file")?;

    let config = SyncConfig::build(
        cli.sqlserver,
        cli.destination.to_config(),
        cli.tables.as_deref(),
        table_file,
        &cli.default_key_column,
        cli.interval,
        cli.state_file,
        cli.batch_size,
    )
    .context("Invalid configuration")?;

    tracing::info!(
        "Replicating {} table(s) from {} to {}",
        config.tables.len(),
        mask_connection_string(&config.source_conn),
        config.destination.display_target()
    );
    for table in &config.tables {
        tracing::info!(
            "  {} -> {} (key {})",
            table.source,
            table.destination,
            table.key_column
        );
    }

    if !cli.skip_preflight {
        let preflight = run_preflight_checks(&config).await?;
        if !preflight.all_passed() {
            preflight.print();
            bail!(
                "Pre-flight checks failed with {} issue(s)",
                preflight.failed_count()
            );
        }
        tracing::info!("Pre-flight checks passed");
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let source = retry_with_backoff(
        || SqlServerSource::connect(config.source_conn.clone()),
        CONNECT_RETRIES,
        Duration::from_secs(1),
    )
    .await
    .context("Failed to connect to SQL Server source")?;
    let destination = retry_with_backoff(
        || PostgresDestination::connect(config.destination.clone()),
        CONNECT_RETRIES,
        Duration::from_secs(1),
    )
    .await
    .context("Failed to connect to destination store")?;

    let store = FileWatermarkStore::new(&config.state_file);
    tracing::info!("Watermark file: {}", store.path().display());
    let engine = SyncEngine::new(source, destination, store, shutdown.clone())
        .with_batch_size(config.batch_size);
    let mut daemon = SyncDaemon::new(
        engine,
        DaemonConfig {
            interval: config.poll_interval,
            tables: config.tables.clone(),
        },
    )
    .await;

    let outcome = if cli.once {
        daemon
            .run_once()
            .await
            .map(|_| ())
            .context("Sync pass failed")
    } else {
        tracing::info!("Press Ctrl+C to stop");
        daemon.run(shutdown.clone()).await;
        Ok(())
    };

    // Stops the signal handler task as well
    shutdown.cancel();
    if tokio::time::timeout(config.shutdown_grace, daemon.close())
        .await
        .is_err()
    {
        tracing::warn!(
            "Connections did not close within {:?}, exiting anyway",
            config.shutdown_grace
        );
    }

    outcome
}
