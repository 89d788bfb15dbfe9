// ABOUTME: Change source for change-tracking sync - reads versions, deltas, and full scans
// ABOUTME: SQL Server implementation built on CHANGETABLE and the change-tracking version functions

use async_trait::async_trait;
use futures::TryStreamExt;
use std::borrow::Cow;
use std::collections::HashSet;
use tiberius::{Client, ColumnData, ColumnType, Config, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::config::TableSpec;
use crate::error::{Result, SyncError};
use crate::utils::{mask_connection_string, quote_mssql_ident, quote_mssql_qualified};
use crate::value::{Row, Value};

/// Kind of change recorded by the source for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    /// Decode `SYS_CHANGE_OPERATION` (`I`, `U`, `D`).
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "I" | "i" => Some(ChangeOperation::Insert),
            "U" | "u" => Some(ChangeOperation::Update),
            "D" | "d" => Some(ChangeOperation::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

/// One net change for a key, as reported by the source's change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub operation: ChangeOperation,
    /// Change-tracking version of the last change to this key
    pub version: i64,
    pub key: Value,
    /// Current source row. `None` for deletes, and for inserts/updates whose
    /// row was deleted again after the range was read.
    pub row: Option<Row>,
}

impl ChangeRecord {
    pub fn insert(version: i64, key: impl Into<Value>, row: Row) -> Self {
        Self {
            operation: ChangeOperation::Insert,
            version,
            key: key.into(),
            row: Some(row),
        }
    }

    pub fn update(version: i64, key: impl Into<Value>, row: Row) -> Self {
        Self {
            operation: ChangeOperation::Update,
            version,
            key: key.into(),
            row: Some(row),
        }
    }

    pub fn delete(version: i64, key: impl Into<Value>) -> Self {
        Self {
            operation: ChangeOperation::Delete,
            version,
            key: key.into(),
            row: None,
        }
    }
}

/// Read side of replication.
#[async_trait]
pub trait ChangeSource: Send {
    /// Current change-tracking version of the source database.
    async fn current_version(&mut self) -> Result<i64>;

    /// Net changes for `table` with version in `(since, until]`, in version order.
    ///
    /// Fails with [`SyncError::SourceHistoryExpired`] when the source no longer
    /// retains history back to `since`.
    async fn changes_since(
        &mut self,
        table: &TableSpec,
        since: i64,
        until: i64,
    ) -> Result<Vec<ChangeRecord>>;

    /// Up to `limit` rows ordered by key, starting after `after` (exclusive).
    async fn scan_batch(
        &mut self,
        table: &TableSpec,
        after: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Release the connection.
    async fn close(&mut self) {}
}

type TdsClient = Client<Compat<TcpStream>>;

/// Change source backed by SQL Server Change Tracking.
///
/// The connection is opened lazily and dropped after any failure, so the
/// next call reconnects.
pub struct SqlServerSource {
    conn_str: String,
    client: Option<TdsClient>,
    /// Tables whose key column is DECIMAL/NUMERIC, learned from scanned rows
    fixed_point_keys: HashSet<String>,
}

impl SqlServerSource {
    pub fn new(conn_str: impl Into<String>) -> Self {
        Self {
            conn_str: conn_str.into(),
            client: None,
            fixed_point_keys: HashSet::new(),
        }
    }

    /// Open the connection now instead of on first use.
    pub async fn connect(conn_str: impl Into<String>) -> Result<Self> {
        let mut source = Self::new(conn_str);
        source.client().await?;
        Ok(source)
    }

    async fn open(&self) -> Result<TdsClient> {
        let masked = mask_connection_string(&self.conn_str);
        let config = Config::from_ado_string(&self.conn_str)
            .map_err(|e| SyncError::ConfigInvalid(format!("invalid SQL Server connection string {}: {}", masked, e)))?;

        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| SyncError::source_unavailable(format!("connect to {}", masked), e))?;
        tcp.set_nodelay(true)
            .map_err(|e| SyncError::source_unavailable("configure source socket", e))?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| SyncError::source_unavailable(format!("login to {}", masked), e))?;
        tracing::info!("Connected to SQL Server");
        Ok(client)
    }

    async fn client(&mut self) -> Result<&mut TdsClient> {
        if self.client.is_none() {
            self.client = Some(self.open().await?);
        }
        self.client
            .as_mut()
            .ok_or_else(|| SyncError::SourceUnavailable {
                context: "source connection not established".to_string(),
                source: None,
            })
    }

    /// Run a query and collect every row of its first result set.
    async fn query(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<tiberius::Row>> {
        let client = self.client().await?;
        let result = async {
            let stream = client.query(sql, params).await?;
            stream.into_row_stream().try_collect::<Vec<_>>().await
        }
        .await;
        match result {
            Ok(rows) => Ok(rows),
            Err(e) => {
                // The connection may be mid-stream; start fresh next time
                self.client = None;
                Err(SyncError::source_unavailable(
                    format!("query failed: {}", first_line(sql)),
                    e,
                ))
            }
        }
    }

    /// Whether the database and the table have change tracking enabled.
    pub async fn check_change_tracking(&mut self, table: &TableSpec) -> Result<bool> {
        let rows = self
            .query(
                "SELECT 1 FROM sys.change_tracking_tables WHERE object_id = OBJECT_ID(@P1)",
                &[&table.source.as_str()],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Whether change tracking is enabled for the connected database.
    pub async fn database_tracking_enabled(&mut self) -> Result<bool> {
        let rows = self
            .query(
                "SELECT 1 FROM sys.change_tracking_databases WHERE database_id = DB_ID()",
                &[],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn min_valid_version(&mut self, table: &TableSpec) -> Result<Option<i64>> {
        let rows = self
            .query(
                "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(OBJECT_ID(@P1))",
                &[&table.source.as_str()],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.try_get::<i64, _>(0).ok().flatten()))
    }
}

#[async_trait]
impl ChangeSource for SqlServerSource {
    async fn current_version(&mut self) -> Result<i64> {
        let rows = self
            .query("SELECT CHANGE_TRACKING_CURRENT_VERSION()", &[])
            .await?;
        rows.first()
            .and_then(|row| row.try_get::<i64, _>(0).ok().flatten())
            .ok_or_else(|| SyncError::SourceUnavailable {
                context: "CHANGE_TRACKING_CURRENT_VERSION() returned NULL; change tracking is not enabled for the database".to_string(),
                source: None,
            })
    }

    async fn changes_since(
        &mut self,
        table: &TableSpec,
        since: i64,
        until: i64,
    ) -> Result<Vec<ChangeRecord>> {
        let min_valid = self.min_valid_version(table).await?.ok_or_else(|| {
            SyncError::SourceUnavailable {
                context: format!("change tracking is not enabled for table {}", table.source),
                source: None,
            }
        })?;
        if since < min_valid {
            return Err(SyncError::SourceHistoryExpired {
                table: table.source.clone(),
                since,
                min_valid,
            });
        }

        let query = build_changes_query(table);
        let rows = self.query(&query, &[&since, &until]).await?;

        rows.into_iter()
            .map(|row| change_record_from_row(table, row))
            .collect()
    }

    async fn scan_batch(
        &mut self,
        table: &TableSpec,
        after: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let limit = limit as i64;
        let rows = match after {
            Some(key) => {
                let fixed_point = self.fixed_point_keys.contains(&table.source);
                let key = scan_key_param(key, fixed_point);
                let query = build_scan_query(table, true);
                self.query(&query, &[&limit, &key]).await?
            }
            None => {
                let query = build_scan_query(table, false);
                self.query(&query, &[&limit]).await?
            }
        };

        let key_type = rows.first().and_then(|row| {
            row.columns()
                .iter()
                .find(|c| c.name().eq_ignore_ascii_case(&table.key_column))
                .map(|c| c.column_type())
        });
        if key_type.map(is_fixed_point).unwrap_or(false) {
            self.fixed_point_keys.insert(table.source.clone());
        }

        Ok(rows.into_iter().map(row_from_tds).collect())
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                tracing::debug!("Error closing SQL Server connection: {}", e);
            }
        }
    }
}

fn first_line(sql: &str) -> &str {
    sql.trim().lines().next().unwrap_or("")
}

const OP_COLUMN: &str = "__ct_operation";
const VERSION_COLUMN: &str = "__ct_version";
const KEY_COLUMN: &str = "__ct_key";
const META_COLUMNS: usize = 3;

/// Build the change feed query for one table.
///
/// Joins the change table to the base table so inserts and updates carry the
/// current row. Rows deleted after the range was read come back with a NULL
/// base key.
fn build_changes_query(table: &TableSpec) -> String {
    let name = quote_mssql_qualified(&table.source);
    let key = quote_mssql_ident(&table.key_column);
    format!(
        "SELECT CT.SYS_CHANGE_OPERATION AS {op}, CT.SYS_CHANGE_VERSION AS {ver}, CT.{key} AS {ct_key}, T.*
         FROM CHANGETABLE(CHANGES {name}, @P1) AS CT
         LEFT OUTER JOIN {name} AS T ON T.{key} = CT.{key}
         WHERE CT.SYS_CHANGE_VERSION <= @P2
         ORDER BY CT.SYS_CHANGE_VERSION, CT.{key}",
        op = quote_mssql_ident(OP_COLUMN),
        ver = quote_mssql_ident(VERSION_COLUMN),
        ct_key = quote_mssql_ident(KEY_COLUMN),
        key = key,
        name = name,
    )
}

/// Build a keyset-paginated full scan query.
fn build_scan_query(table: &TableSpec, after_key: bool) -> String {
    let name = quote_mssql_qualified(&table.source);
    let key = quote_mssql_ident(&table.key_column);
    if after_key {
        format!(
            "SELECT TOP (@P1) * FROM {} WHERE {} > @P2 ORDER BY {}",
            name, key, key
        )
    } else {
        format!("SELECT TOP (@P1) * FROM {} ORDER BY {}", name, key)
    }
}

fn change_record_from_row(table: &TableSpec, row: tiberius::Row) -> Result<ChangeRecord> {
    let Row { columns, mut values } = row_from_tds(row);
    if values.len() < META_COLUMNS {
        return Err(SyncError::SourceUnavailable {
            context: format!("malformed change feed row for {}", table.source),
            source: None,
        });
    }

    let data_columns = columns[META_COLUMNS..].to_vec();
    let data_values = values.split_off(META_COLUMNS);
    let mut meta = values.into_iter();
    let op = meta.next().unwrap_or(Value::Null);
    let version = meta.next().unwrap_or(Value::Null);
    let key = meta.next().unwrap_or(Value::Null);

    let operation = match &op {
        Value::String(code) => ChangeOperation::from_code(code),
        _ => None,
    }
    .ok_or_else(|| SyncError::SourceUnavailable {
        context: format!("unexpected change operation {} for {}", op, table.source),
        source: None,
    })?;
    let version = match version {
        Value::Int(v) => v,
        other => {
            return Err(SyncError::SourceUnavailable {
                context: format!("unexpected change version {} for {}", other, table.source),
                source: None,
            })
        }
    };

    let data = Row::new(data_columns, data_values);
    let row = match operation {
        ChangeOperation::Delete => None,
        _ => match data.get(&table.key_column) {
            Some(value) if !value.is_null() => Some(data),
            _ => None,
        },
    };

    Ok(ChangeRecord {
        operation,
        version,
        key,
        row,
    })
}

fn is_fixed_point(column_type: ColumnType) -> bool {
    matches!(column_type, ColumnType::Decimaln | ColumnType::Numericn)
}

/// Parameter for the `after` key of a keyset scan.
///
/// Fixed-point keys come back as the bytes of their decimal text. They are
/// bound as that text, which SQL Server converts to the column's type;
/// binding them as bytes would compare against varbinary.
fn scan_key_param(key: &Value, fixed_point: bool) -> Value {
    match key {
        Value::Bytes(bytes) if fixed_point => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        other => other.clone(),
    }
}

/// Convert a driver row into a [`Row`].
pub fn row_from_tds(row: tiberius::Row) -> Row {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let values = row.into_iter().map(value_from_column).collect();
    Row::new(columns, values)
}

/// Convert one driver value.
///
/// Fixed-point numerics are surfaced as the bytes of their decimal text; the
/// normalizer turns them into floats before they reach the destination.
pub fn value_from_column(data: ColumnData<'static>) -> Value {
    let value = match &data {
        ColumnData::U8(v) => v.map(|n| Value::Int(i64::from(n))),
        ColumnData::I16(v) => v.map(|n| Value::Int(i64::from(n))),
        ColumnData::I32(v) => v.map(|n| Value::Int(i64::from(n))),
        ColumnData::I64(v) => v.map(Value::Int),
        ColumnData::F32(v) => v.map(|n| Value::Float(f64::from(n))),
        ColumnData::F64(v) => v.map(Value::Float),
        ColumnData::Bit(v) => v.map(Value::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| Value::String(s.to_string())),
        ColumnData::Guid(v) => v.map(|g| Value::String(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|b| Value::Bytes(b.to_vec())),
        ColumnData::Numeric(v) => v.map(|n| Value::Bytes(n.to_string().into_bytes())),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| Value::String(x.as_ref().clone().into_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            chrono::NaiveDateTime::from_sql(&data)
                .ok()
                .flatten()
                .map(Value::Timestamp)
        }
        ColumnData::Date(_) => chrono::NaiveDate::from_sql(&data)
            .ok()
            .flatten()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(Value::Timestamp),
        ColumnData::Time(_) => chrono::NaiveTime::from_sql(&data)
            .ok()
            .flatten()
            .map(|t| Value::String(t.to_string())),
        ColumnData::DateTimeOffset(_) => {
            chrono::DateTime::<chrono::Utc>::from_sql(&data)
                .ok()
                .flatten()
                .map(|dt| Value::Timestamp(dt.naive_utc()))
        }
    };
    value.unwrap_or(Value::Null)
}

impl ToSql for Value {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            Value::Null => ColumnData::String(None),
            Value::Bool(b) => ColumnData::Bit(Some(*b)),
            Value::Int(i) => ColumnData::I64(Some(*i)),
            Value::Float(f) => ColumnData::F64(Some(*f)),
            Value::String(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
            Value::Bytes(b) => ColumnData::Binary(Some(Cow::Borrowed(b.as_slice()))),
            Value::Timestamp(ts) => ts.to_sql(),
        }
    }
}
