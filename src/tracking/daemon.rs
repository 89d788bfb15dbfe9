// ABOUTME: SyncDaemon for change-tracking sync - runs replication passes on a fixed interval
// ABOUTME: Passes never overlap; failures are logged and retried on the next tick

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::TableSpec;
use crate::error::{Result, SyncError};

use super::engine::{PassOutcome, SyncEngine, SyncResult};
use super::reader::ChangeSource;
use super::state::{SyncState, WatermarkStore};
use super::writer::Destination;

/// Configuration for the SyncDaemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Interval between sync passes
    pub interval: Duration,
    /// Tables to sync, in order
    pub tables: Vec<TableSpec>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            tables: Vec::new(),
        }
    }
}

/// Statistics over the daemon's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub passes: u64,
    pub failed_passes: u64,
    pub changes_applied: u64,
}

/// SyncDaemon drives a [`SyncEngine`] until cancelled.
///
/// The first pass starts immediately. Later passes start at the later of the
/// next tick and the end of the previous pass.
pub struct SyncDaemon<S, D, W> {
    engine: SyncEngine<S, D, W>,
    config: DaemonConfig,
    state: SyncState,
    stats: DaemonStats,
}

impl<S, D, W> SyncDaemon<S, D, W>
where
    S: ChangeSource,
    D: Destination,
    W: WatermarkStore,
{
    /// Create a daemon, loading the persisted watermark.
    pub async fn new(engine: SyncEngine<S, D, W>, config: DaemonConfig) -> Self {
        let state = engine.load_state().await;
        Self {
            engine,
            config,
            state,
            stats: DaemonStats::default(),
        }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    /// Run a single pass.
    pub async fn run_once(&mut self) -> Result<SyncResult> {
        self.stats.passes += 1;
        let pass = self.stats.passes;
        let from = self.state.last_version;
        tracing::info!("Starting sync pass {} from version {}", pass, from);

        match self
            .engine
            .run_sync_pass(&self.config.tables, &mut self.state)
            .await
        {
            Ok(result) => {
                self.stats.changes_applied += result.total_changes();
                log_pass(pass, &result);
                Ok(result)
            }
            Err(e) => {
                if !matches!(e, SyncError::Cancelled) {
                    self.stats.failed_passes += 1;
                    tracing::error!(
                        kind = e.kind(),
                        retryable = e.is_retryable(),
                        "Sync pass {} failed (watermark stays at {}): {}",
                        pass,
                        self.state.last_version,
                        e
                    );
                    if e.is_defect() {
                        tracing::warn!(
                            "This failure repeats every pass until the destination schema or configuration is fixed"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Run passes on the configured interval until `shutdown` is cancelled.
    ///
    /// Pass failures never stop the loop; only cancellation does.
    pub async fn run(&mut self, shutdown: CancellationToken) -> DaemonStats {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Starting SyncDaemon with interval={:?} for {} table(s)",
            self.config.interval,
            self.config.tables.len()
        );

        loop {
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping SyncDaemon");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(SyncError::Cancelled) = self.run_once().await {
                        tracing::info!("Sync pass cancelled by shutdown");
                        break;
                    }
                }
            }
        }

        tracing::info!(
            "SyncDaemon stopped after {} passes ({} failed), watermark at {}",
            self.stats.passes,
            self.stats.failed_passes,
            self.state.last_version
        );
        self.stats.clone()
    }

    /// Close the engine's connections.
    pub async fn close(&mut self) {
        self.engine.close().await;
    }
}

fn log_pass(pass: u64, result: &SyncResult) {
    match result.outcome {
        PassOutcome::Bootstrapped => tracing::info!(
            "Sync pass {} bootstrapped {} table(s), {} rows at version {} in {:?}",
            pass,
            result.tables.len(),
            result.total_loaded_rows(),
            result.to_version,
            result.duration
        ),
        PassOutcome::Incremental => tracing::info!(
            "Sync pass {} applied {} changes for versions ({}, {}] in {:?}",
            pass,
            result.total_changes(),
            result.from_version,
            result.to_version,
            result.duration
        ),
        PassOutcome::NoChanges => tracing::info!(
            "Sync pass {} found no changes at version {}",
            pass,
            result.to_version
        ),
        PassOutcome::Regressed => tracing::warn!(
            "Sync pass {} skipped: source version {} behind watermark {}",
            pass,
            result.to_version,
            result.from_version
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::testing::{FakeDestination, FakeSource, MemoryStore};
    use crate::value::{Row, Value};

    fn daemon(
        source: &FakeSource,
        destination: &FakeDestination,
        store: &MemoryStore,
        cancel: CancellationToken,
    ) -> SyncEngine<FakeSource, FakeDestination, MemoryStore> {
        SyncEngine::new(source.clone(), destination.clone(), store.clone(), cancel)
    }

    fn config() -> DaemonConfig {
        DaemonConfig {
            interval: Duration::from_millis(10),
            tables: vec![TableSpec::new("orders", "Id")],
        }
    }

    #[tokio::test]
    async fn test_run_once_loads_persisted_state() {
        let source = FakeSource::default();
        source.set_version(40);
        let store = MemoryStore::with_state(SyncState::new(40));
        let engine = daemon(
            &source,
            &FakeDestination::default(),
            &store,
            CancellationToken::new(),
        );

        let mut daemon = SyncDaemon::new(engine, config()).await;
        assert_eq!(daemon.state().last_version, 40);

        let result = daemon.run_once().await.unwrap();
        assert_eq!(result.outcome, PassOutcome::NoChanges);
        assert_eq!(daemon.stats().passes, 1);
    }

    #[tokio::test]
    async fn test_run_survives_failures_until_shutdown() {
        let source = FakeSource::default();
        source.add_row(
            &TableSpec::new("orders", "Id"),
            Row::from_pairs([("Id", Value::Int(1))]),
        );
        source.set_version(10);
        source.set_unavailable(true);
        let destination = FakeDestination::default();
        let store = MemoryStore::default();
        let shutdown = CancellationToken::new();
        let engine = daemon(&source, &destination, &store, shutdown.clone());
        let mut daemon = SyncDaemon::new(engine, config()).await;

        let stopper = {
            let shutdown = shutdown.clone();
            let source = source.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(35)).await;
                source.set_unavailable(false);
                tokio::time::sleep(Duration::from_millis(35)).await;
                shutdown.cancel();
            }
        };
        let (stats, _) = tokio::join!(daemon.run(shutdown.clone()), stopper);

        assert!(stats.passes >= 2);
        assert!(stats.failed_passes >= 1);
        assert_eq!(store.saved_version(), Some(10));
        assert_eq!(destination.keys_of(&TableSpec::new("orders", "Id")), vec!["1"]);
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_already_cancelled() {
        let source = FakeSource::default();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let engine = daemon(
            &source,
            &FakeDestination::default(),
            &MemoryStore::default(),
            shutdown.clone(),
        );
        let mut daemon = SyncDaemon::new(engine, config()).await;

        let stats = daemon.run(shutdown).await;
        assert_eq!(stats.passes, 0);
    }
}
