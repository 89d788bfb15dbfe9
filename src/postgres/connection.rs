// ABOUTME: Connection bootstrapping for the destination store (PostgreSQL wire protocol)
// ABOUTME: Resolves headless-service addresses, applies TLS policy, and classifies errors

use std::net::IpAddr;
use std::time::Duration;

use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, NoTls};

use crate::error::{Result, SyncError};

/// Connection settings for the destination store.
#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    /// Require TLS for the connection
    pub tls: bool,
    /// Accept self-signed or otherwise invalid certificates (testing only)
    pub allow_self_signed_certs: bool,
    pub connect_timeout: Duration,
    /// Upper bound for a single destination statement
    pub operation_timeout: Duration,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
            tls: false,
            allow_self_signed_certs: false,
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl DestinationConfig {
    /// `user@host:port/database`, safe to log.
    pub fn display_target(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

/// Resolve every IPv4 address behind `host`.
///
/// Headless services publish one A record per replica, so connecting through
/// all of them spreads the client over the cluster and survives a single node
/// going away. Falls back to an empty list when resolution fails, in which
/// case the host name is used as-is.
pub async fn resolve_addresses(host: &str, port: u16) -> Vec<IpAddr> {
    match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => {
            let mut ips: Vec<IpAddr> = Vec::new();
            for addr in addrs.filter(|a| a.is_ipv4()) {
                if !ips.contains(&addr.ip()) {
                    ips.push(addr.ip());
                }
            }
            ips
        }
        Err(e) => {
            tracing::warn!("DNS lookup failed for {}: {}, using as-is", host, e);
            Vec::new()
        }
    }
}

/// Build the driver configuration for the given candidate addresses.
pub(crate) fn build_pg_config(config: &DestinationConfig, addresses: &[IpAddr]) -> tokio_postgres::Config {
    let mut pg = tokio_postgres::Config::new();
    if addresses.is_empty() {
        pg.host(&config.host);
    } else {
        // host stays the logical name (TLS verification), hostaddr carries the IP
        for ip in addresses {
            pg.host(&config.host);
            pg.hostaddr(*ip);
        }
    }
    pg.port(config.port)
        .user(&config.user)
        .dbname(&config.database)
        .application_name("ct-replicator")
        .connect_timeout(config.connect_timeout)
        .keepalives(true)
        .keepalives_idle(Duration::from_secs(60))
        .ssl_mode(if config.tls {
            SslMode::Require
        } else {
            SslMode::Disable
        });
    if let Some(password) = &config.password {
        pg.password(password);
    }
    pg
}

/// Open a connection to the destination and spawn its driver task.
pub async fn connect(config: &DestinationConfig) -> Result<Client> {
    let addresses = resolve_addresses(&config.host, config.port).await;
    tracing::debug!(
        "Resolved destination addresses for {}: {:?}",
        config.host,
        addresses
    );
    let pg = build_pg_config(config, &addresses);
    let target = config.display_target();

    let client = if config.tls {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(config.allow_self_signed_certs)
            .build()
            .map_err(|e| SyncError::ConfigInvalid(format!("failed to build TLS connector: {}", e)))?;
        let tls = postgres_native_tls::MakeTlsConnector::new(connector);
        let (client, connection) = pg
            .connect(tls)
            .await
            .map_err(|e| SyncError::destination_unavailable(format!("connect to {}", target), e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("Destination connection closed with error: {}", e);
            }
        });
        client
    } else {
        let (client, connection) = pg
            .connect(NoTls)
            .await
            .map_err(|e| SyncError::destination_unavailable(format!("connect to {}", target), e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("Destination connection closed with error: {}", e);
            }
        });
        client
    };

    tracing::info!("Connected to destination at {}", target);
    Ok(client)
}

/// Map a driver error onto the destination error kinds.
///
/// Connection-class failures (closed sockets, SQLSTATE classes 08, 53, 57,
/// 58 and serialization failures) are transient. Everything else the server
/// or the driver refuses is a rejected statement.
pub fn classify_error(context: impl Into<String>, err: tokio_postgres::Error) -> SyncError {
    let context = context.into();
    if err.is_closed() {
        return SyncError::destination_unavailable(context, err);
    }
    if let Some(db) = err.as_db_error() {
        let code = db.code().code();
        if is_transient_sqlstate(code) {
            return SyncError::destination_unavailable(context, err);
        }
        return SyncError::DestinationRejected {
            context,
            source: Some(Box::new(err)),
        };
    }
    let io_failure = std::error::Error::source(&err)
        .map(|source| source.is::<std::io::Error>())
        .unwrap_or(false);
    if io_failure {
        SyncError::destination_unavailable(context, err)
    } else {
        SyncError::DestinationRejected {
            context,
            source: Some(Box::new(err)),
        }
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57")
        || code.starts_with("58")
        || code == "40001"
        || code == "40P01"
}
