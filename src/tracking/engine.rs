// ABOUTME: SyncEngine for change-tracking sync - one replication pass from source to destination
// ABOUTME: Bootstraps with a full load, then applies version-ranged deltas and advances the watermark

use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::TableSpec;
use crate::error::{Result, SyncError};
use crate::value::{normalize, Value};

use super::reader::{ChangeOperation, ChangeSource};
use super::reconciler::{key_fingerprint, Reconciler};
use super::state::{SyncState, WatermarkStore};
use super::writer::Destination;

/// Rows fetched per full-load batch unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// What a pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// First pass: every table was fully loaded
    Bootstrapped,
    /// Source version equals the watermark
    NoChanges,
    /// Deltas were applied and the watermark advanced
    Incremental,
    /// Source version is behind the watermark; nothing was written
    Regressed,
}

/// Per-table counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    /// Inserts/updates whose source row was gone by the time it was read
    pub skipped: u64,
    /// Rows copied by a full load of the table
    pub loaded_rows: u64,
    /// Table was fully reloaded because its change history expired
    pub reloaded: bool,
}

impl TableCounts {
    pub fn changes(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

/// Summary of a successful pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub outcome: PassOutcome,
    pub from_version: i64,
    pub to_version: i64,
    /// Counters keyed by source table name, in configured order
    pub tables: Vec<(String, TableCounts)>,
    pub duration: Duration,
}

impl SyncResult {
    fn new(outcome: PassOutcome, from_version: i64, to_version: i64, started: Instant) -> Self {
        Self {
            outcome,
            from_version,
            to_version,
            tables: Vec::new(),
            duration: started.elapsed(),
        }
    }

    pub fn total_changes(&self) -> u64 {
        self.tables.iter().map(|(_, c)| c.changes()).sum()
    }

    pub fn total_loaded_rows(&self) -> u64 {
        self.tables.iter().map(|(_, c)| c.loaded_rows).sum()
    }

    pub fn counts(&self, table: &str) -> Option<&TableCounts> {
        self.tables
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, counts)| counts)
    }
}

/// Race `operation` against cancellation.
async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = operation => result,
    }
}

/// Replication engine owning the source, destination and watermark store.
///
/// Each pass either applies every table's changes up to one source version
/// and persists that version, or fails and leaves the watermark untouched.
pub struct SyncEngine<S, D, W> {
    source: S,
    destination: D,
    store: W,
    cancel: CancellationToken,
    batch_size: usize,
}

impl<S, D, W> SyncEngine<S, D, W>
where
    S: ChangeSource,
    D: Destination,
    W: WatermarkStore,
{
    pub fn new(source: S, destination: D, store: W, cancel: CancellationToken) -> Self {
        Self {
            source,
            destination,
            store,
            cancel,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Load the persisted watermark (never fails; see [`WatermarkStore::load`]).
    pub async fn load_state(&self) -> SyncState {
        self.store.load().await
    }

    /// Run one replication pass over `tables`.
    ///
    /// `state` is replaced only after the new watermark has been persisted.
    pub async fn run_sync_pass(
        &mut self,
        tables: &[TableSpec],
        state: &mut SyncState,
    ) -> Result<SyncResult> {
        let started = Instant::now();
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let last = state.last_version;
        let current = cancellable(&self.cancel, self.source.current_version()).await?;

        if !state.is_bootstrapped() {
            tracing::info!(
                "No watermark found, performing full load of {} table(s) at version {}",
                tables.len(),
                current
            );
            let mut result = SyncResult::new(PassOutcome::Bootstrapped, last, current, started);
            for table in tables {
                let (loaded_rows, _) = self
                    .full_load(table, false)
                    .await
                    .map_err(|e| log_table_failure(table, last, current, e))?;
                result.tables.push((
                    table.source.clone(),
                    TableCounts {
                        loaded_rows,
                        ..TableCounts::default()
                    },
                ));
            }
            self.commit(state, current).await?;
            result.duration = started.elapsed();
            return Ok(result);
        }

        if current == last {
            tracing::debug!("Source at version {}, nothing to sync", current);
            return Ok(SyncResult::new(PassOutcome::NoChanges, last, current, started));
        }

        if current < last {
            tracing::warn!(
                "Source version {} is behind the watermark {} (was the source restored?). Skipping pass without writing.",
                current,
                last
            );
            return Ok(SyncResult::new(PassOutcome::Regressed, last, current, started));
        }

        let mut result = SyncResult::new(PassOutcome::Incremental, last, current, started);
        for table in tables {
            let counts = self
                .sync_table(table, last, current)
                .await
                .map_err(|e| log_table_failure(table, last, current, e))?;
            result.tables.push((table.source.clone(), counts));
        }

        self.commit(state, current).await?;
        result.duration = started.elapsed();
        Ok(result)
    }

    /// Apply the changes of one table in `(since, until]`.
    async fn sync_table(&mut self, table: &TableSpec, since: i64, until: i64) -> Result<TableCounts> {
        let changes = match cancellable(
            &self.cancel,
            self.source.changes_since(table, since, until),
        )
        .await
        {
            Ok(changes) => changes,
            Err(SyncError::SourceHistoryExpired { min_valid, .. }) => {
                tracing::warn!(
                    "Change history for {} expired (watermark {} < minimum valid version {}), reloading table",
                    table,
                    since,
                    min_valid
                );
                return self.reload_table(table).await;
            }
            Err(e) => return Err(e),
        };

        let mut counts = TableCounts::default();
        if changes.is_empty() {
            tracing::debug!("No changes for {} in ({}, {}]", table, since, until);
            return Ok(counts);
        }

        for change in changes {
            match (change.operation, change.row) {
                (ChangeOperation::Delete, _) => {
                    let key = normalize(change.key);
                    cancellable(&self.cancel, self.destination.delete(table, &key)).await?;
                    counts.deletes += 1;
                }
                (operation, Some(row)) => {
                    let row = row.normalized();
                    cancellable(
                        &self.cancel,
                        self.destination.upsert(table, &row.columns, &row.values),
                    )
                    .await?;
                    if operation == ChangeOperation::Insert {
                        counts.inserts += 1;
                    } else {
                        counts.updates += 1;
                    }
                }
                (operation, None) => {
                    // The row was deleted after this range; its delete lands in a later pass
                    tracing::debug!(
                        "Skipping {} of {} key {}: row no longer exists in source",
                        operation.as_str(),
                        table,
                        change.key
                    );
                    counts.skipped += 1;
                }
            }
        }

        tracing::info!(
            "Applied {} changes to {} in ({}, {}]: {} inserts, {} updates, {} deletes",
            counts.changes(),
            table,
            since,
            until,
            counts.inserts,
            counts.updates,
            counts.deletes
        );
        Ok(counts)
    }

    /// Full load of one table followed by deletion of rows no longer in the source.
    async fn reload_table(&mut self, table: &TableSpec) -> Result<TableCounts> {
        let (loaded_rows, source_keys) = self.full_load(table, true).await?;
        let reconciled = cancellable(
            &self.cancel,
            Reconciler::new(&self.destination).reconcile_table(table, &source_keys),
        )
        .await?;

        Ok(TableCounts {
            deletes: reconciled.deleted,
            loaded_rows,
            reloaded: true,
            ..TableCounts::default()
        })
    }

    /// Copy every source row of `table` in key-ordered batches.
    ///
    /// Returns the number of rows copied and, when `collect_keys` is set, the
    /// fingerprints of every key seen.
    async fn full_load(
        &mut self,
        table: &TableSpec,
        collect_keys: bool,
    ) -> Result<(u64, HashSet<String>)> {
        tracing::info!("Full load of {} into {}", table, table.destination);
        let mut after: Option<Value> = None;
        let mut total = 0u64;
        let mut keys = HashSet::new();

        loop {
            let batch = cancellable(
                &self.cancel,
                self.source.scan_batch(table, after.as_ref(), self.batch_size),
            )
            .await?;
            if batch.is_empty() {
                break;
            }
            let fetched = batch.len();

            let last_key = batch
                .last()
                .and_then(|row| row.get(&table.key_column))
                .filter(|key| !key.is_null())
                .cloned()
                .ok_or_else(|| SyncError::SourceUnavailable {
                    context: format!(
                        "key column {} missing or NULL in rows of {}",
                        table.key_column, table
                    ),
                    source: None,
                })?;

            let columns = batch[0].columns.clone();
            let mut rows = Vec::with_capacity(fetched);
            for row in batch {
                if collect_keys {
                    if let Some(key) = row.get(&table.key_column) {
                        keys.insert(key_fingerprint(key));
                    }
                }
                rows.push(row.normalized().values);
            }

            cancellable(
                &self.cancel,
                self.destination.upsert_batch(table, &columns, &rows),
            )
            .await?;

            total += fetched as u64;
            tracing::debug!("Loaded {} rows of {} so far", total, table);

            after = Some(last_key);
            if fetched < self.batch_size {
                break;
            }
        }

        tracing::info!("Loaded {} rows into {}", total, table.destination);
        Ok((total, keys))
    }

    /// Persist the advanced watermark, then adopt it.
    async fn commit(&self, state: &mut SyncState, version: i64) -> Result<()> {
        let next = state.advanced_to(version);
        self.store.save(&next).await?;
        *state = next;
        tracing::debug!("Watermark advanced to {}", version);
        Ok(())
    }

    /// Release source and destination connections.
    pub async fn close(&mut self) {
        self.source.close().await;
        self.destination.close().await;
    }
}

fn log_table_failure(table: &TableSpec, from: i64, to: i64, error: SyncError) -> SyncError {
    if !matches!(error, SyncError::Cancelled) {
        tracing::error!(
            table = %table,
            from_version = from,
            to_version = to,
            kind = error.kind(),
            "Failed to sync {} for versions ({}, {}]: {}",
            table,
            from,
            to,
            error
        );
    }
    error
}
