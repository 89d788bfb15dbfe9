// ABOUTME: Change-tracking sync module for incremental SQL Server replication
// ABOUTME: Provides change detection using SQL Server change-tracking versions

pub mod daemon;
pub mod engine;
pub mod reader;
pub mod reconciler;
pub mod state;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use daemon::{DaemonConfig, DaemonStats, SyncDaemon};
pub use engine::{PassOutcome, SyncEngine, SyncResult, TableCounts, DEFAULT_BATCH_SIZE};
pub use reader::{ChangeOperation, ChangeRecord, ChangeSource, SqlServerSource};
pub use reconciler::{ReconcileResult, Reconciler};
pub use state::{FileWatermarkStore, SyncState, WatermarkStore};
pub use writer::{Destination, PostgresDestination, QueryOutput};
