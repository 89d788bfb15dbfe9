// ABOUTME: Utility functions for identifier quoting, secret masking, and retries
// ABOUTME: Shared by the source and destination adapters and the CLI

use anyhow::{bail, Context, Result};
use std::time::Duration;

/// Quote a PostgreSQL identifier (schema, table, column)
///
/// Escapes embedded quotes and wraps the identifier in double quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a possibly schema-qualified PostgreSQL name (`schema.table`).
pub fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Quote a SQL Server identifier
///
/// SQL Server uses square brackets for identifier quoting. Escapes embedded
/// closing brackets by doubling them.
///
/// # Examples
///
/// ```
/// use ct_replicator::utils::quote_mssql_ident;
/// assert_eq!(quote_mssql_ident("orders"), "[orders]");
/// assert_eq!(quote_mssql_ident("odd]name"), "[odd]]name]");
/// ```
pub fn quote_mssql_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('[');
    for ch in identifier.chars() {
        if ch == ']' {
            quoted.push(']');
        }
        quoted.push(ch);
    }
    quoted.push(']');
    quoted
}

/// Quote a possibly schema-qualified SQL Server name (`dbo.orders`).
pub fn quote_mssql_qualified(name: &str) -> String {
    name.split('.')
        .map(quote_mssql_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Mask the password in an ADO.NET style connection string
/// (`Server=...;User Id=...;Password=...`) so it can be logged.
pub fn mask_connection_string(conn: &str) -> String {
    conn.split(';')
        .map(|part| match part.split_once('=') {
            Some((key, _)) if is_password_key(key) => format!("{}=***", key),
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn is_password_key(key: &str) -> bool {
    matches!(
        key.trim().to_ascii_lowercase().as_str(),
        "password" | "pwd"
    )
}

/// Parse a duration string like "1h", "30m", "300s", "300" (seconds).
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("Empty duration string");
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("ms") {
        let millis: u64 = n
            .parse()
            .with_context(|| format!("Invalid milliseconds value: {n}"))?;
        return Ok(Duration::from_millis(millis));
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else {
        (s, 1)
    };

    let value: u64 = num_str
        .parse()
        .with_context(|| format!("Invalid duration value: {s}"))?;
    Ok(Duration::from_secs(value * multiplier))
}

/// Retry an async operation with exponential backoff.
///
/// Returns the successful result or the last error after all retries exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries => {
                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt + 1,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2; // Exponential backoff
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
