// ABOUTME: Table specifications and process configuration for the sync daemon
// ABOUTME: Parses the table list from flags and the optional TOML table file

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::postgres::DestinationConfig;
use crate::utils::parse_duration;

/// Key column used when a table entry does not declare one.
pub const DEFAULT_KEY_COLUMN: &str = "Id";

/// A source table to replicate, with its declared primary-key column.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableSpec {
    /// Source table name, optionally schema-qualified (`dbo.orders`)
    #[serde(rename = "name")]
    pub source: String,
    /// Destination table name
    #[serde(default)]
    pub destination: String,
    /// Column that uniquely and stably identifies a row
    #[serde(rename = "key", default)]
    pub key_column: String,
}

impl TableSpec {
    /// Create a spec whose destination is the unqualified source name.
    pub fn new(source: &str, key_column: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: unqualified(source).to_string(),
            key_column: key_column.to_string(),
        }
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = destination.to_string();
        self
    }

    /// Parse one table entry: `name[:key][=destination]`.
    ///
    /// ```
    /// use ct_replicator::config::TableSpec;
    /// let spec = TableSpec::parse("dbo.orders:OrderId=orders_copy", "Id").unwrap();
    /// assert_eq!(spec.source, "dbo.orders");
    /// assert_eq!(spec.key_column, "OrderId");
    /// assert_eq!(spec.destination, "orders_copy");
    /// ```
    pub fn parse(entry: &str, default_key: &str) -> Result<Self> {
        let entry = entry.trim();
        let (rest, destination) = match entry.split_once('=') {
            Some((rest, dest)) => (rest.trim(), Some(dest.trim())),
            None => (entry, None),
        };
        let (source, key) = match rest.split_once(':') {
            Some((source, key)) => (source.trim(), key.trim()),
            None => (rest, default_key),
        };

        let spec = TableSpec {
            source: source.to_string(),
            destination: destination.unwrap_or_else(|| unqualified(source)).to_string(),
            key_column: key.to_string(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Fill defaults for entries loaded from a table file.
    fn with_defaults(mut self, default_key: &str) -> Self {
        if self.key_column.trim().is_empty() {
            self.key_column = default_key.to_string();
        }
        if self.destination.trim().is_empty() {
            self.destination = unqualified(&self.source).to_string();
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(SyncError::ConfigInvalid(
                "table entry has an empty source name".to_string(),
            ));
        }
        if self.source.split('.').any(|part| part.trim().is_empty()) {
            return Err(SyncError::ConfigInvalid(format!(
                "table name '{}' has an empty schema or table part",
                self.source
            )));
        }
        if self.key_column.trim().is_empty() {
            return Err(SyncError::ConfigInvalid(format!(
                "table '{}' has an empty key column",
                self.source
            )));
        }
        if self.destination.trim().is_empty() {
            return Err(SyncError::ConfigInvalid(format!(
                "table '{}' has an empty destination name",
                self.source
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for TableSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn unqualified(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Parse a comma-separated table list.
pub fn parse_table_list(list: &str, default_key: &str) -> Result<Vec<TableSpec>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| TableSpec::parse(entry, default_key))
        .collect()
}

/// Contents of the optional `--config` TOML file.
///
/// ```toml
/// [[tables]]
/// name = "dbo.orders"
/// key = "OrderId"
/// destination = "orders"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct TableFile {
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

impl TableFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::ConfigInvalid(format!("cannot read table file {:?}: {}", path, e))
        })?;
        Self::parse(&contents)
            .map_err(|e| SyncError::ConfigInvalid(format!("{:?}: {}", path, e)))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| SyncError::ConfigInvalid(format!("invalid table file: {}", e)))
    }
}

/// Destination connection flags shared by the sync daemon and the query gateway.
#[derive(Debug, Clone, clap::Args)]
pub struct DestinationArgs {
    /// Destination host; every IPv4 address it resolves to is tried
    #[arg(long = "dest-host", env = "DEST_HOST", default_value = "localhost")]
    pub host: String,
    #[arg(long = "dest-port", env = "DEST_PORT", default_value_t = 5432)]
    pub port: u16,
    #[arg(long = "dest-user", env = "DEST_USER", default_value = "postgres")]
    pub user: String,
    #[arg(long = "dest-password", env = "DEST_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    #[arg(long = "dest-database", env = "DEST_DATABASE", default_value = "postgres")]
    pub database: String,
    /// Require TLS for the destination connection
    #[arg(long = "dest-tls", env = "DEST_TLS", default_value_t = false)]
    pub tls: bool,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(long = "allow-self-signed-certs", default_value_t = false)]
    pub allow_self_signed_certs: bool,
    #[arg(long = "dest-connect-timeout", default_value = "10s", value_parser = parse_duration)]
    pub connect_timeout: Duration,
    /// Upper bound for a single destination statement
    #[arg(long = "dest-timeout", default_value = "30s", value_parser = parse_duration)]
    pub operation_timeout: Duration,
}

impl DestinationArgs {
    pub fn to_config(&self) -> DestinationConfig {
        DestinationConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            tls: self.tls,
            allow_self_signed_certs: self.allow_self_signed_certs,
            connect_timeout: self.connect_timeout,
            operation_timeout: self.operation_timeout,
        }
    }
}

/// Fully resolved configuration of the sync daemon.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_conn: String,
    pub destination: DestinationConfig,
    pub tables: Vec<TableSpec>,
    pub poll_interval: Duration,
    pub state_file: PathBuf,
    pub batch_size: usize,
    pub shutdown_grace: Duration,
}

impl SyncConfig {
    /// Merge tables from flags and the table file, then check mandatory settings.
    ///
    /// Duplicate source tables keep their first occurrence so flag entries win
    /// over file entries.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        source_conn: Option<String>,
        destination: DestinationConfig,
        table_list: Option<&str>,
        table_file: Option<TableFile>,
        default_key: &str,
        poll_interval: Duration,
        state_file: PathBuf,
        batch_size: usize,
    ) -> Result<Self> {
        let source_conn = source_conn
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                SyncError::ConfigInvalid(
                    "SQL Server connection string required (--sqlserver or SQLSERVER_CONN)"
                        .to_string(),
                )
            })?;

        let mut tables = match table_list {
            Some(list) => parse_table_list(list, default_key)?,
            None => Vec::new(),
        };
        for spec in table_file.map(|f| f.tables).unwrap_or_default() {
            let spec = spec.with_defaults(default_key);
            spec.validate()?;
            if !tables
                .iter()
                .any(|t| t.source.eq_ignore_ascii_case(&spec.source))
            {
                tables.push(spec);
            }
        }

        if tables.is_empty() {
            return Err(SyncError::ConfigInvalid(
                "At least one table required (--tables or SYNC_TABLES)".to_string(),
            ));
        }
        if poll_interval.is_zero() {
            return Err(SyncError::ConfigInvalid(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if batch_size == 0 {
            return Err(SyncError::ConfigInvalid(
                "batch size must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            source_conn,
            destination,
            tables,
            poll_interval,
            state_file,
            batch_size,
            shutdown_grace: Duration::from_secs(5),
        })
    }
}
