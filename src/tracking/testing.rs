// ABOUTME: In-memory source, destination and watermark store used by engine and daemon tests
// ABOUTME: Records every destination operation so tests can assert on ordering

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::TableSpec;
use crate::error::{Result, SyncError};
use crate::value::{Row, Value};

use super::reader::{ChangeRecord, ChangeSource};
use super::state::{SyncState, WatermarkStore};
use super::writer::Destination;

#[derive(Debug, Default)]
pub struct SourceData {
    pub version: i64,
    pub min_valid: i64,
    pub rows: HashMap<String, Vec<Row>>,
    pub changes: HashMap<String, Vec<ChangeRecord>>,
    pub unavailable: bool,
    pub hang: bool,
    pub scans: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeSource {
    pub data: Arc<Mutex<SourceData>>,
}

/// Key order as SQL Server sorts it; decimal keys arrive as their text.
fn key_order(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Bytes(_), Value::Bytes(_)) => {
            match (decimal_text(a), decimal_text(b)) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.key_string().cmp(&b.key_string()),
            }
        }
        _ => a.key_string().cmp(&b.key_string()),
    }
}

fn decimal_text(value: &Value) -> Option<f64> {
    match value {
        Value::Bytes(b) => std::str::from_utf8(b).ok()?.parse().ok(),
        _ => None,
    }
}

impl FakeSource {
    pub fn set_version(&self, version: i64) {
        self.data.lock().unwrap().version = version;
    }

    pub fn set_min_valid(&self, version: i64) {
        self.data.lock().unwrap().min_valid = version;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.data.lock().unwrap().unavailable = unavailable;
    }

    pub fn set_hang(&self, hang: bool) {
        self.data.lock().unwrap().hang = hang;
    }

    pub fn add_row(&self, table: &TableSpec, row: Row) {
        self.data
            .lock()
            .unwrap()
            .rows
            .entry(table.source.clone())
            .or_default()
            .push(row);
    }

    pub fn remove_row(&self, table: &TableSpec, key: &Value) {
        if let Some(rows) = self.data.lock().unwrap().rows.get_mut(&table.source) {
            rows.retain(|r| r.get(&table.key_column) != Some(key));
        }
    }

    pub fn push_change(&self, table: &TableSpec, change: ChangeRecord) {
        self.data
            .lock()
            .unwrap()
            .changes
            .entry(table.source.clone())
            .or_default()
            .push(change);
    }

    pub fn scans(&self) -> usize {
        self.data.lock().unwrap().scans
    }

    fn check_available(&self) -> Result<()> {
        if self.data.lock().unwrap().unavailable {
            return Err(SyncError::SourceUnavailable {
                context: "fake source offline".to_string(),
                source: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeSource for FakeSource {
    async fn current_version(&mut self) -> Result<i64> {
        let hang = self.data.lock().unwrap().hang;
        if hang {
            std::future::pending::<()>().await;
        }
        self.check_available()?;
        Ok(self.data.lock().unwrap().version)
    }

    async fn changes_since(
        &mut self,
        table: &TableSpec,
        since: i64,
        until: i64,
    ) -> Result<Vec<ChangeRecord>> {
        self.check_available()?;
        let data = self.data.lock().unwrap();
        if since < data.min_valid {
            return Err(SyncError::SourceHistoryExpired {
                table: table.source.clone(),
                since,
                min_valid: data.min_valid,
            });
        }
        let mut changes: Vec<ChangeRecord> = data
            .changes
            .get(&table.source)
            .map(|c| {
                c.iter()
                    .filter(|c| c.version > since && c.version <= until)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        changes.sort_by_key(|c| c.version);
        Ok(changes)
    }

    async fn scan_batch(
        &mut self,
        table: &TableSpec,
        after: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.check_available()?;
        let mut data = self.data.lock().unwrap();
        data.scans += 1;
        let mut rows: Vec<Row> = data.rows.get(&table.source).cloned().unwrap_or_default();
        rows.sort_by(|a, b| {
            key_order(
                a.get(&table.key_column).unwrap_or(&Value::Null),
                b.get(&table.key_column).unwrap_or(&Value::Null),
            )
        });
        Ok(rows
            .into_iter()
            .filter(|row| match (after, row.get(&table.key_column)) {
                (Some(after), Some(key)) => key_order(key, after).is_gt(),
                _ => true,
            })
            .take(limit)
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct DestinationData {
    pub tables: HashMap<String, BTreeMap<String, Row>>,
    pub ops: Vec<String>,
    pub fail_on_key: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeDestination {
    pub data: Arc<Mutex<DestinationData>>,
}

impl FakeDestination {
    /// Seed a row without recording an operation.
    pub fn insert_row(&self, table: &TableSpec, row: Row) {
        let key = row
            .get(&table.key_column)
            .map(|k| k.key_string())
            .unwrap_or_default();
        self.data
            .lock()
            .unwrap()
            .tables
            .entry(table.destination.clone())
            .or_default()
            .insert(key, row);
    }

    pub fn keys_of(&self, table: &TableSpec) -> Vec<String> {
        self.data
            .lock()
            .unwrap()
            .tables
            .get(&table.destination)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &TableSpec, key: &str) -> Option<Row> {
        self.data
            .lock()
            .unwrap()
            .tables
            .get(&table.destination)
            .and_then(|t| t.get(key).cloned())
    }

    pub fn ops(&self) -> Vec<String> {
        self.data.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.data.lock().unwrap().ops.clear();
    }

    pub fn fail_on_key(&self, key: Option<Value>) {
        self.data.lock().unwrap().fail_on_key = key;
    }

    fn check_key(&self, key: &Value) -> Result<()> {
        if self.data.lock().unwrap().fail_on_key.as_ref() == Some(key) {
            return Err(SyncError::DestinationUnavailable {
                context: format!("fake destination refused key {}", key),
                source: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Destination for FakeDestination {
    async fn upsert(&self, table: &TableSpec, columns: &[String], values: &[Value]) -> Result<u64> {
        if columns.len() != values.len() {
            return Err(SyncError::destination_rejected("arity mismatch"));
        }
        let row = Row::new(columns.to_vec(), values.to_vec());
        let key = row
            .get(&table.key_column)
            .cloned()
            .ok_or_else(|| SyncError::destination_rejected("missing key"))?;
        self.check_key(&key)?;

        let mut data = self.data.lock().unwrap();
        data.ops
            .push(format!("upsert({},{})", table.destination, key.key_string()));
        data.tables
            .entry(table.destination.clone())
            .or_default()
            .insert(key.key_string(), row);
        Ok(1)
    }

    async fn delete(&self, table: &TableSpec, key: &Value) -> Result<u64> {
        self.check_key(key)?;
        let mut data = self.data.lock().unwrap();
        data.ops
            .push(format!("delete({},{})", table.destination, key.key_string()));
        let removed = data
            .tables
            .get_mut(&table.destination)
            .and_then(|t| t.remove(&key.key_string()))
            .is_some();
        Ok(u64::from(removed))
    }

    async fn execute(&self, sql: &str, _args: &[Value]) -> Result<u64> {
        self.data.lock().unwrap().ops.push(format!("execute({})", sql));
        Ok(0)
    }

    async fn keys(&self, table: &TableSpec) -> Result<Vec<Value>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .tables
            .get(&table.destination)
            .map(|t| {
                t.values()
                    .filter_map(|row| row.get(&table.key_column).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub saved: Arc<Mutex<Option<SyncState>>>,
    pub failing: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub fn with_state(state: SyncState) -> Self {
        let store = Self::default();
        *store.saved.lock().unwrap() = Some(state);
        store
    }

    pub fn saved_version(&self) -> Option<i64> {
        self.saved.lock().unwrap().map(|s| s.last_version)
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn load(&self) -> SyncState {
        self.saved.lock().unwrap().unwrap_or_default()
    }

    async fn save(&self, state: &SyncState) -> Result<()> {
        if *self.failing.lock().unwrap() {
            return Err(SyncError::StateUnwritable {
                path: "memory".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        *self.saved.lock().unwrap() = Some(*state);
        Ok(())
    }
}
