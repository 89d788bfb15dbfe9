// ABOUTME: Destination adapter for change-tracking sync - applies changes to the target store
// ABOUTME: Uses INSERT ... ON CONFLICT DO UPDATE for idempotent upserts over the PostgreSQL protocol

use std::error::Error as StdError;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::BytesMut;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::Client;

use crate::config::TableSpec;
use crate::error::{Result, SyncError};
use crate::postgres::{classify_error, connect, DestinationConfig};
use crate::utils::{quote_ident, quote_qualified};
use crate::value::Value;

/// PostgreSQL caps a statement at 65535 bind parameters.
const MAX_PARAMS: usize = 65000;

/// Rows returned by an ad-hoc query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Write side of replication.
///
/// Every operation is idempotent so a pass that is replayed after a failure
/// converges on the same destination state.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Insert or replace the row identified by the table's key column.
    ///
    /// `columns` and `values` must have the same length and include the key.
    async fn upsert(&self, table: &TableSpec, columns: &[String], values: &[Value]) -> Result<u64>;

    /// Upsert many rows sharing one column layout.
    async fn upsert_batch(
        &self,
        table: &TableSpec,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64> {
        let mut affected = 0;
        for values in rows {
            affected += self.upsert(table, columns, values).await?;
        }
        Ok(affected)
    }

    /// Delete the row with `key`. Deleting an absent row succeeds.
    async fn delete(&self, table: &TableSpec, key: &Value) -> Result<u64>;

    /// Execute a raw statement and return the affected row count.
    async fn execute(&self, sql: &str, args: &[Value]) -> Result<u64>;

    /// Every key currently present in the destination table.
    async fn keys(&self, table: &TableSpec) -> Result<Vec<Value>>;

    async fn close(&self) {}
}

/// Destination reached over the PostgreSQL wire protocol.
///
/// Holds a single connection that is (re)opened on demand, so a dropped
/// connection surfaces as one failed pass and the next pass reconnects.
pub struct PostgresDestination {
    config: DestinationConfig,
    client: Mutex<Option<Client>>,
}

impl PostgresDestination {
    /// Create an adapter that connects on first use.
    pub fn new(config: DestinationConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    /// Create an adapter and open its connection immediately.
    pub async fn connect(config: DestinationConfig) -> Result<Self> {
        let destination = Self::new(config);
        destination.client().await?;
        Ok(destination)
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    async fn client(&self) -> Result<MappedMutexGuard<'_, Client>> {
        let mut slot = self.client.lock().await;
        let usable = slot.as_ref().map(|c| !c.is_closed()).unwrap_or(false);
        if !usable {
            if slot.is_some() {
                tracing::warn!("Destination connection lost, reconnecting");
            }
            *slot = Some(connect(&self.config).await?);
        }
        MutexGuard::try_map(slot, |c| c.as_mut()).map_err(|_| SyncError::DestinationUnavailable {
            context: "destination connection not established".to_string(),
            source: None,
        })
    }

    /// Bound a driver future by the operation timeout and classify its failure.
    async fn timed<T, F>(&self, context: impl Into<String>, operation: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, tokio_postgres::Error>>,
    {
        let context = context.into();
        match tokio::time::timeout(self.config.operation_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_error(context, e)),
            Err(_) => Err(SyncError::DestinationUnavailable {
                context: format!(
                    "{} timed out after {:?}",
                    context, self.config.operation_timeout
                ),
                source: None,
            }),
        }
    }

    async fn execute_params(&self, context: String, sql: &str, args: &[Value]) -> Result<u64> {
        let client = self.client().await?;
        let params = as_params(args);
        self.timed(context, client.execute(sql, &params)).await
    }

    /// Run a read query, fetching the result in pages of `page_size` rows
    /// through a portal. All pages are collected before returning.
    pub async fn query(&self, sql: &str, args: &[Value], page_size: i32) -> Result<QueryOutput> {
        let mut client = self.client().await?;
        let page_size = page_size.max(1);
        let operation = async {
            let txn = client.transaction().await?;
            let statement = txn.prepare(sql).await?;
            let columns: Vec<String> = statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            let params = as_params(args);
            let portal = txn.bind(&statement, &params).await?;

            let mut rows = Vec::new();
            loop {
                let page = txn.query_portal(&portal, page_size).await?;
                let fetched = page.len();
                rows.extend(page);
                if fetched < page_size as usize {
                    break;
                }
            }
            txn.commit().await?;
            Ok::<_, tokio_postgres::Error>((columns, rows))
        };
        let (columns, rows) = self.timed("query", operation).await?;
        let rows = rows.iter().map(row_values).collect::<Result<Vec<_>>>()?;
        Ok(QueryOutput { columns, rows })
    }
}

#[async_trait]
impl Destination for PostgresDestination {
    async fn upsert(&self, table: &TableSpec, columns: &[String], values: &[Value]) -> Result<u64> {
        let key_index = check_row(table, columns, values)?;
        let query = build_upsert_query(&table.destination, &table.key_column, key_index, columns, 1);
        self.execute_params(format!("upsert into {}", table.destination), &query, values)
            .await
    }

    async fn upsert_batch(
        &self,
        table: &TableSpec,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut key_index = 0;
        for values in rows {
            key_index = check_row(table, columns, values)?;
        }

        let rows_per_statement = std::cmp::max(1, MAX_PARAMS / columns.len().max(1));
        let mut affected = 0u64;
        for chunk in rows.chunks(rows_per_statement) {
            let query = build_upsert_query(
                &table.destination,
                &table.key_column,
                key_index,
                columns,
                chunk.len(),
            );
            let values: Vec<Value> = chunk.iter().flatten().cloned().collect();
            affected += self
                .execute_params(
                    format!("upsert batch into {}", table.destination),
                    &query,
                    &values,
                )
                .await?;
        }
        Ok(affected)
    }

    async fn delete(&self, table: &TableSpec, key: &Value) -> Result<u64> {
        if key.is_null() {
            return Err(SyncError::destination_rejected(format!(
                "delete from {} with a NULL key",
                table.destination
            )));
        }
        let query = build_delete_query(&table.destination, &table.key_column, 1);
        self.execute_params(
            format!("delete from {}", table.destination),
            &query,
            std::slice::from_ref(key),
        )
        .await
    }

    async fn execute(&self, sql: &str, args: &[Value]) -> Result<u64> {
        self.execute_params("execute".to_string(), sql, args).await
    }

    async fn keys(&self, table: &TableSpec) -> Result<Vec<Value>> {
        let query = format!(
            "SELECT {} FROM {}",
            quote_ident(&table.key_column),
            quote_qualified(&table.destination)
        );
        let client = self.client().await?;
        let rows = self
            .timed(
                format!("list keys of {}", table.destination),
                client.query(query.as_str(), &[]),
            )
            .await?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            let key = value_at(row, 0)?;
            if !key.is_null() {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            tracing::info!("Closed destination connection");
        }
    }
}

/// Check a row against the table contract and return the position of the key
/// column in `columns`. Source column names match the key case-insensitively.
fn check_row(table: &TableSpec, columns: &[String], values: &[Value]) -> Result<usize> {
    if columns.len() != values.len() {
        return Err(SyncError::destination_rejected(format!(
            "upsert into {}: {} columns but {} values",
            table.destination,
            columns.len(),
            values.len()
        )));
    }
    let position = columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case(&table.key_column))
        .ok_or_else(|| {
            SyncError::destination_rejected(format!(
                "upsert into {}: key column {} missing from row",
                table.destination, table.key_column
            ))
        })?;
    if values[position].is_null() {
        return Err(SyncError::destination_rejected(format!(
            "upsert into {}: key column {} is NULL",
            table.destination, table.key_column
        )));
    }
    Ok(position)
}

fn as_params(args: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    args.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

/// Build an upsert statement keyed on a single column.
///
/// The column at `key_index` is written as `key_column`, the same spelling
/// deletes and key listings use. Generates a query like:
/// ```sql
/// INSERT INTO "schema"."table" ("id", "name")
/// VALUES ($1, $2), ($3, $4)
/// ON CONFLICT ("id") DO UPDATE SET "name" = EXCLUDED."name"
/// ```
fn build_upsert_query(
    table: &str,
    key_column: &str,
    key_index: usize,
    columns: &[String],
    num_rows: usize,
) -> String {
    let quoted_columns: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| if i == key_index { quote_ident(key_column) } else { quote_ident(c) })
        .collect();

    let num_cols = columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    let update_columns: Vec<String> = columns
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != key_index)
        .map(|(_, c)| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let update_clause = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {}",
        quote_qualified(table),
        quoted_columns.join(", "),
        value_rows.join(", "),
        quote_ident(key_column),
        update_clause
    )
}

/// Build a delete by key for `num_keys` keys:
/// `DELETE FROM "table" WHERE "id" IN ($1, $2, ...)`
fn build_delete_query(table: &str, key_column: &str, num_keys: usize) -> String {
    let placeholders: Vec<String> = (1..=num_keys).map(|i| format!("${}", i)).collect();
    format!(
        "DELETE FROM {} WHERE {} IN ({})",
        quote_qualified(table),
        quote_ident(key_column),
        placeholders.join(", ")
    )
}

/// Convert a driver row into values, dispatching on each column's type.
pub fn row_values(row: &tokio_postgres::Row) -> Result<Vec<Value>> {
    (0..row.len()).map(|idx| value_at(row, idx)).collect()
}

/// Accepts any column type; only used to tell NULL from a present value.
struct Present;

impl<'a> FromSql<'a> for Present {
    fn from_sql(_: &Type, _: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(Present)
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// Whether [`value_at`] can decode columns of this type.
fn is_decodable(ty: &Type) -> bool {
    [
        Type::BOOL,
        Type::CHAR,
        Type::INT2,
        Type::INT4,
        Type::INT8,
        Type::OID,
        Type::FLOAT4,
        Type::FLOAT8,
        Type::NUMERIC,
        Type::TIMESTAMP,
        Type::TIMESTAMPTZ,
        Type::DATE,
        Type::TIME,
        Type::UUID,
        Type::JSON,
        Type::JSONB,
        Type::BYTEA,
    ]
    .contains(ty)
        || <String as FromSql<'_>>::accepts(ty)
}

fn value_at(row: &tokio_postgres::Row, idx: usize) -> Result<Value> {
    let column = &row.columns()[idx];
    let ty = column.type_();
    let decode_error = |e: tokio_postgres::Error| {
        SyncError::destination_rejected(format!("decode column {}: {}", column.name(), e))
    };

    if !is_decodable(ty) {
        return match row.try_get::<_, Option<Present>>(idx).map_err(decode_error)? {
            None => Ok(Value::Null),
            Some(_) => Err(SyncError::destination_rejected(format!(
                "column {} has unsupported type {}; cast it to text in the query",
                column.name(),
                ty
            ))),
        };
    }

    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)
            .map_err(decode_error)?
            .map(Value::Bool)
    } else if *ty == Type::CHAR {
        row.try_get::<_, Option<i8>>(idx)
            .map_err(decode_error)?
            .map(|v| Value::Int(i64::from(v)))
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)
            .map_err(decode_error)?
            .map(|v| Value::Int(i64::from(v)))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)
            .map_err(decode_error)?
            .map(|v| Value::Int(i64::from(v)))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)
            .map_err(decode_error)?
            .map(Value::Int)
    } else if *ty == Type::OID {
        row.try_get::<_, Option<u32>>(idx)
            .map_err(decode_error)?
            .map(|v| Value::Int(i64::from(v)))
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)
            .map_err(decode_error)?
            .map(|v| Value::Float(f64::from(v)))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)
            .map_err(decode_error)?
            .map(Value::Float)
    } else if *ty == Type::NUMERIC {
        // Keep the exact digits; the normalizer decides how to present them
        row.try_get::<_, Option<Decimal>>(idx)
            .map_err(decode_error)?
            .map(|d| crate::value::normalize(Value::Bytes(d.to_string().into_bytes())))
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map_err(decode_error)?
            .map(Value::Timestamp)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map_err(decode_error)?
            .map(|v| Value::Timestamp(v.naive_utc()))
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map_err(decode_error)?
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(Value::Timestamp)
    } else if *ty == Type::TIME {
        row.try_get::<_, Option<chrono::NaiveTime>>(idx)
            .map_err(decode_error)?
            .map(|t| Value::String(t.to_string()))
    } else if *ty == Type::UUID {
        row.try_get::<_, Option<uuid::Uuid>>(idx)
            .map_err(decode_error)?
            .map(|v| Value::String(v.to_string()))
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<serde_json::Value>>(idx)
            .map_err(decode_error)?
            .map(|v| Value::String(v.to_string()))
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(idx)
            .map_err(decode_error)?
            .map(Value::Bytes)
    } else {
        // Text-like types, including extension types such as citext
        row.try_get::<_, Option<String>>(idx)
            .map_err(decode_error)?
            .map(Value::String)
    };
    Ok(value.unwrap_or(Value::Null))
}

type SqlResult = std::result::Result<IsNull, Box<dyn StdError + Sync + Send>>;

fn is_text(ty: &Type) -> bool {
    *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME
}

fn is_json(ty: &Type) -> bool {
    *ty == Type::JSON || *ty == Type::JSONB
}

/// Values are bound against whatever type the server inferred for the
/// parameter, converting between compatible representations.
impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> SqlResult {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => {
                if is_text(ty) {
                    b.to_string().to_sql_checked(ty, out)
                } else {
                    b.to_sql_checked(ty, out)
                }
            }
            Value::Int(i) => int_to_sql(*i, ty, out),
            Value::Float(f) => float_to_sql(*f, ty, out),
            Value::String(s) => string_to_sql(s, ty, out),
            Value::Bytes(b) => b.as_slice().to_sql_checked(ty, out),
            Value::Timestamp(ts) => {
                if *ty == Type::TIMESTAMPTZ {
                    chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(*ts, chrono::Utc)
                        .to_sql_checked(ty, out)
                } else if *ty == Type::DATE {
                    ts.date().to_sql_checked(ty, out)
                } else if is_text(ty) {
                    ts.to_string().to_sql_checked(ty, out)
                } else {
                    ts.to_sql_checked(ty, out)
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn int_to_sql(i: i64, ty: &Type, out: &mut BytesMut) -> SqlResult {
    if *ty == Type::INT2 {
        i16::try_from(i)?.to_sql(ty, out)
    } else if *ty == Type::INT4 {
        i32::try_from(i)?.to_sql(ty, out)
    } else if *ty == Type::FLOAT4 {
        (i as f32).to_sql(ty, out)
    } else if *ty == Type::FLOAT8 {
        (i as f64).to_sql(ty, out)
    } else if *ty == Type::NUMERIC {
        Decimal::from(i).to_sql(ty, out)
    } else if *ty == Type::BOOL {
        (i != 0).to_sql(ty, out)
    } else if is_text(ty) {
        i.to_string().to_sql(ty, out)
    } else {
        i.to_sql_checked(ty, out)
    }
}

fn float_to_sql(f: f64, ty: &Type, out: &mut BytesMut) -> SqlResult {
    if *ty == Type::FLOAT4 {
        (f as f32).to_sql(ty, out)
    } else if *ty == Type::NUMERIC {
        Decimal::from_f64_retain(f)
            .ok_or_else(|| format!("{} cannot be represented as NUMERIC", f))?
            .normalize()
            .to_sql(ty, out)
    } else if (*ty == Type::INT2 || *ty == Type::INT4 || *ty == Type::INT8) && f.fract() == 0.0 {
        int_to_sql(f as i64, ty, out)
    } else if is_text(ty) {
        f.to_string().to_sql(ty, out)
    } else {
        f.to_sql_checked(ty, out)
    }
}

fn string_to_sql(s: &str, ty: &Type, out: &mut BytesMut) -> SqlResult {
    if *ty == Type::NUMERIC {
        Decimal::from_str(s.trim())?.to_sql(ty, out)
    } else if *ty == Type::INT2 || *ty == Type::INT4 || *ty == Type::INT8 {
        int_to_sql(s.trim().parse::<i64>()?, ty, out)
    } else if *ty == Type::FLOAT4 || *ty == Type::FLOAT8 {
        float_to_sql(s.trim().parse::<f64>()?, ty, out)
    } else if *ty == Type::UUID {
        uuid::Uuid::parse_str(s.trim())?.to_sql(ty, out)
    } else if is_json(ty) {
        serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out)
    } else {
        s.to_sql_checked(ty, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_upsert_query_single_row() {
        let query = build_upsert_query("orders", "Id", 0, &columns(&["Id", "Name", "Total"]), 1);

        assert!(query.starts_with("INSERT INTO \"orders\""));
        assert!(query.contains("(\"Id\", \"Name\", \"Total\")"));
        assert!(query.contains("VALUES ($1, $2, $3)"));
        assert!(query.contains("ON CONFLICT (\"Id\")"));
        assert!(query.contains("\"Name\" = EXCLUDED.\"Name\""));
        assert!(query.contains("\"Total\" = EXCLUDED.\"Total\""));
        assert!(!query.contains("\"Id\" = EXCLUDED"));
    }

    #[test]
    fn test_build_upsert_query_multiple_rows_qualified() {
        let query = build_upsert_query("sales.orders", "id", 0, &columns(&["id", "name"]), 3);

        assert!(query.contains("INSERT INTO \"sales\".\"orders\""));
        assert!(query.contains("($1, $2), ($3, $4), ($5, $6)"));
    }

    #[test]
    fn test_build_upsert_query_key_only() {
        let query = build_upsert_query("tags", "id", 0, &columns(&["id"]), 1);
        assert!(query.contains("DO NOTHING"));
        assert!(!query.contains("DO UPDATE SET"));
    }

    #[test]
    fn test_build_delete_query() {
        let query = build_delete_query("public.orders", "Id", 1);
        assert_eq!(query, "DELETE FROM \"public\".\"orders\" WHERE \"Id\" IN ($1)");
    }

    #[test]
    fn test_check_row_rejects_arity_mismatch() {
        let table = TableSpec::new("orders", "Id");
        let err = check_row(&table, &columns(&["Id", "Name"]), &[Value::Int(1)]).unwrap_err();
        assert!(matches!(err, SyncError::DestinationRejected { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_check_row_requires_key() {
        let table = TableSpec::new("orders", "Id");
        let err = check_row(&table, &columns(&["Name"]), &[Value::from("a")]).unwrap_err();
        assert!(err.to_string().contains("key column Id missing"));

        let err = check_row(&table, &columns(&["Id"]), &[Value::Null]).unwrap_err();
        assert!(matches!(err, SyncError::DestinationRejected { .. }));
    }

    #[test]
    fn test_check_row_finds_key_ignoring_case() {
        let table = TableSpec::new("orders", "id");
        let row = columns(&["Name", "ID"]);
        let position = check_row(&table, &row, &[Value::from("a"), Value::Int(1)]).unwrap();
        assert_eq!(position, 1);
    }

    #[test]
    fn test_key_spelling_matches_across_statements() {
        // Source reports "Id", configuration says "id"
        let table = TableSpec::new("orders", "id");
        let row = columns(&["Id", "Name"]);
        let key_index = check_row(&table, &row, &[Value::Int(1), Value::from("a")]).unwrap();

        let upsert = build_upsert_query(&table.destination, &table.key_column, key_index, &row, 1);
        let delete = build_delete_query(&table.destination, &table.key_column, 1);

        assert!(upsert.contains("(\"id\", \"Name\")"));
        assert!(upsert.contains("ON CONFLICT (\"id\")"));
        assert!(!upsert.contains("\"Id\""));
        assert!(delete.contains("WHERE \"id\" IN"));
    }

    #[test]
    fn test_decodable_types() {
        assert!(is_decodable(&Type::TIME));
        assert!(is_decodable(&Type::CHAR));
        assert!(is_decodable(&Type::VARCHAR));
        assert!(is_decodable(&Type::NUMERIC));
        assert!(!is_decodable(&Type::INET));
        assert!(!is_decodable(&Type::INTERVAL));
        assert!(!is_decodable(&Type::INT4_ARRAY));
    }

    #[test]
    fn test_value_to_sql_narrows_integers() {
        let mut out = BytesMut::new();
        Value::Int(7).to_sql(&Type::INT4, &mut out).unwrap();
        assert_eq!(&out[..], &7i32.to_be_bytes());

        let mut out = BytesMut::new();
        assert!(Value::Int(i64::MAX).to_sql(&Type::INT2, &mut out).is_err());
    }

    #[test]
    fn test_value_to_sql_null_and_text() {
        let mut out = BytesMut::new();
        assert!(matches!(
            Value::Null.to_sql(&Type::INT8, &mut out).unwrap(),
            IsNull::Yes
        ));

        let mut out = BytesMut::new();
        Value::Int(42).to_sql(&Type::TEXT, &mut out).unwrap();
        assert_eq!(&out[..], b"42");
    }

    #[test]
    fn test_value_to_sql_rejects_incompatible_type() {
        let mut out = BytesMut::new();
        assert!(Value::Bytes(vec![1]).to_sql(&Type::INT4, &mut out).is_err());
        let mut out = BytesMut::new();
        assert!(Value::from("abc").to_sql(&Type::NUMERIC, &mut out).is_err());
    }

    #[test]
    fn test_query_output_serializes() {
        let output = QueryOutput {
            columns: columns(&["id", "name"]),
            rows: vec![vec![Value::Int(1), Value::from("a")]],
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["columns"][1], "name");
        assert_eq!(json["rows"][0][0], 1);
    }
}
