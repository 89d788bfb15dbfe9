// ABOUTME: Scalar values and rows exchanged between the source and destination adapters
// ABOUTME: Also hosts the value normalizer applied before every destination write

use base64::Engine as _;
use chrono::NaiveDateTime;
use serde::ser::{Serialize, SerializeMap, Serializer};

/// A single scalar as read from the source or written to the destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical text form used to compare keys across source and destination.
    ///
    /// Source and destination drivers can surface the same key with different
    /// widths (e.g. `smallint` vs `bigint`), so comparison goes through this form.
    pub fn key_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.to_lowercase(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "0x{}", hex(b)),
            Value::Timestamp(ts) => write!(f, "{}", ts),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(b) => {
                serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(b))
            }
            Value::Timestamp(ts) => {
                serializer.serialize_str(&ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            other => Value::String(other.to_string()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

/// One record: column names and values in matching order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let (columns, values) = pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self { columns, values }
    }

    /// Look up a value by column name (case-insensitive, as SQL Server resolves names).
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|idx| self.values.get(idx))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Apply [`normalize`] to every value.
    pub fn normalized(self) -> Row {
        Row {
            columns: self.columns,
            values: self.values.into_iter().map(normalize).collect(),
        }
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Convert a source value into a destination-compatible one.
///
/// Drivers surface fixed-point and money columns as opaque bytes holding the
/// decimal text. Those become floats when the text parses as a number and
/// strings otherwise. Every other kind passes through unchanged.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Bytes(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            match text.parse::<f64>() {
                Ok(f) => Value::Float(f),
                Err(_) => Value::String(text.into_owned()),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_numeric_bytes() {
        assert_eq!(normalize(Value::Bytes(b"123.45".to_vec())), Value::Float(123.45));
        assert_eq!(normalize(Value::Bytes(b"-7".to_vec())), Value::Float(-7.0));
    }

    #[test]
    fn test_normalize_keeps_padded_numbers_as_text() {
        assert_eq!(
            normalize(Value::Bytes(b" 12 ".to_vec())),
            Value::String(" 12 ".to_string())
        );
    }

    #[test]
    fn test_normalize_text_bytes() {
        assert_eq!(
            normalize(Value::Bytes(b"abc".to_vec())),
            Value::String("abc".to_string())
        );
    }

    #[test]
    fn test_normalize_passthrough() {
        assert_eq!(normalize(Value::Null), Value::Null);
        assert_eq!(normalize(Value::Int(4)), Value::Int(4));
        assert_eq!(
            normalize(Value::String("123.45".to_string())),
            Value::String("123.45".to_string())
        );
    }

    #[test]
    fn test_normalize_invalid_utf8_falls_back_to_lossy_string() {
        let value = normalize(Value::Bytes(vec![0xff, 0x41]));
        assert_eq!(value, Value::String("\u{fffd}A".to_string()));
    }

    #[test]
    fn test_row_get_is_case_insensitive() {
        let row = Row::from_pairs([("Id", Value::Int(1)), ("Name", Value::from("a"))]);
        assert_eq!(row.get("id"), Some(&Value::Int(1)));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_row_normalized() {
        let row = Row::from_pairs([("Id", Value::Int(1)), ("Total", Value::Bytes(b"9.5".to_vec()))])
            .normalized();
        assert_eq!(row.values, vec![Value::Int(1), Value::Float(9.5)]);
    }

    #[test]
    fn test_value_serializes_to_json() {
        let row = Row::from_pairs([
            ("a", Value::Null),
            ("b", Value::Bool(true)),
            ("c", Value::Bytes(vec![1, 2, 3])),
        ]);
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json, serde_json::json!({"a": null, "b": true, "c": "AQID"}));
    }

    #[test]
    fn test_value_from_json() {
        assert_eq!(Value::from(serde_json::json!(5)), Value::Int(5));
        assert_eq!(Value::from(serde_json::json!(1.5)), Value::Float(1.5));
        assert_eq!(Value::from(serde_json::json!([1])), Value::String("[1]".to_string()));
    }

    #[test]
    fn test_key_string_ignores_integer_width() {
        assert_eq!(Value::Int(7).key_string(), "7");
        assert_eq!(
            Value::String("ABC-def".to_string()).key_string(),
            Value::String("abc-DEF".to_string()).key_string()
        );
    }
}
