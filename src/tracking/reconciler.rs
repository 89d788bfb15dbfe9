// ABOUTME: Reconciler for change-tracking sync - removes rows that vanished from the source
// ABOUTME: Compares destination keys with the key set captured during a full table reload

use std::collections::HashSet;

use crate::config::TableSpec;
use crate::error::Result;
use crate::value::{normalize, Value};

use super::writer::Destination;

/// Result of reconciling one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub destination_keys: usize,
    pub deleted: u64,
}

/// Canonical form of a source key, comparable with destination keys.
pub fn key_fingerprint(key: &Value) -> String {
    normalize(key.clone()).key_string()
}

/// Reconciler detects rows that exist in the destination but not in the source.
///
/// Incremental passes learn about deletes from the change feed. When that feed
/// expired and a table was reloaded instead, deletes that happened in the gap
/// are only visible by comparing key sets.
pub struct Reconciler<'a, D: Destination + ?Sized> {
    destination: &'a D,
}

impl<'a, D: Destination + ?Sized> Reconciler<'a, D> {
    pub fn new(destination: &'a D) -> Self {
        Self { destination }
    }

    /// Destination keys absent from `source_keys` (fingerprints, see [`key_fingerprint`]).
    pub async fn find_orphaned_keys(
        &self,
        table: &TableSpec,
        source_keys: &HashSet<String>,
    ) -> Result<(usize, Vec<Value>)> {
        let destination_keys = self.destination.keys(table).await?;
        let total = destination_keys.len();
        let orphaned: Vec<Value> = destination_keys
            .into_iter()
            .filter(|key| !source_keys.contains(&key_fingerprint(key)))
            .collect();

        tracing::info!(
            "Found {} orphaned rows in {} that need deletion",
            orphaned.len(),
            table.destination
        );
        Ok((total, orphaned))
    }

    /// Delete every orphaned row from the destination table.
    pub async fn reconcile_table(
        &self,
        table: &TableSpec,
        source_keys: &HashSet<String>,
    ) -> Result<ReconcileResult> {
        let (destination_keys, orphaned) = self.find_orphaned_keys(table, source_keys).await?;

        let mut deleted = 0;
        for key in &orphaned {
            self.destination.delete(table, key).await?;
            deleted += 1;
        }

        if deleted > 0 {
            tracing::info!("Deleted {} orphaned rows from {}", deleted, table.destination);
        }
        Ok(ReconcileResult {
            destination_keys,
            deleted,
        })
    }
}
