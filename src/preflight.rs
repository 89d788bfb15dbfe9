// ABOUTME: Pre-flight validation checks for change-tracking replication prerequisites
// ABOUTME: Validates source connectivity, change-tracking setup, and destination tables

use std::fmt;

use anyhow::Result;

use crate::config::SyncConfig;
use crate::tracking::{ChangeSource, Destination, PostgresDestination, SqlServerSource};
use crate::utils::{quote_mssql_qualified, quote_qualified};

/// Outcome of one check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// A failed prerequisite and what the operator can do about it.
#[derive(Debug, Clone)]
pub struct PreflightIssue {
    pub title: String,
    pub explanation: String,
    pub fixes: Vec<String>,
}

/// Checks grouped by area, plus the issues that block startup.
#[derive(Debug, Default)]
pub struct PreflightResult {
    pub network: Vec<CheckResult>,
    pub change_tracking: Vec<CheckResult>,
    pub destination_tables: Vec<CheckResult>,
    pub issues: Vec<PreflightIssue>,
}

impl PreflightResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_passed(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.issues.len()
    }

    fn source_reachable(&self) -> bool {
        self.network.iter().any(|c| c.name == "source" && c.passed)
    }

    fn destination_reachable(&self) -> bool {
        self.network
            .iter()
            .any(|c| c.name == "destination" && c.passed)
    }

    /// Write the report to stdout.
    pub fn print(&self) {
        println!("\n{}", self);
    }
}

fn write_section(f: &mut fmt::Formatter<'_>, title: &str, checks: &[CheckResult]) -> fmt::Result {
    if checks.is_empty() {
        return Ok(());
    }
    writeln!(f, "{}:", title)?;
    for check in checks {
        let mark = if check.passed { "✓" } else { "✗" };
        writeln!(f, "  {} {}", mark, check.message)?;
        if let Some(details) = &check.details {
            writeln!(f, "      {}", details)?;
        }
    }
    writeln!(f)
}

impl fmt::Display for PreflightResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "═".repeat(61);
        writeln!(f, "Pre-flight checks for change-tracking replication")?;
        writeln!(f, "{}\n", rule)?;

        write_section(f, "Connectivity", &self.network)?;
        write_section(f, "Change tracking", &self.change_tracking)?;
        write_section(f, "Destination tables", &self.destination_tables)?;

        writeln!(f, "{}", rule)?;
        if self.issues.is_empty() {
            return writeln!(f, "All checks passed");
        }

        writeln!(f, "{} problem(s) found\n", self.issues.len())?;
        for (n, issue) in self.issues.iter().enumerate() {
            writeln!(f, "[{}] {}", n + 1, issue.title)?;
            writeln!(f, "  {}", issue.explanation)?;
            if !issue.fixes.is_empty() {
                writeln!(f, "  To fix:")?;
                for fix in &issue.fixes {
                    writeln!(f, "    - {}", fix)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Verify source and destination prerequisites before the first pass.
///
/// Source checks run only when the source is reachable, destination checks
/// only when the destination is reachable.
pub async fn run_preflight_checks(config: &SyncConfig) -> Result<PreflightResult> {
    let mut result = PreflightResult::new();

    let source = check_source_connectivity(&mut result, &config.source_conn).await;
    let destination = check_destination_connectivity(&mut result, config).await;

    if let Some(mut source) = source {
        if result.source_reachable() {
            check_change_tracking(&mut result, &mut source, config).await;
        }
        source.close().await;
    }

    if let Some(destination) = destination {
        if result.destination_reachable() {
            check_destination_tables(&mut result, &destination, config).await;
        }
        destination.close().await;
    }

    Ok(result)
}

async fn check_source_connectivity(
    result: &mut PreflightResult,
    conn_str: &str,
) -> Option<SqlServerSource> {
    match SqlServerSource::connect(conn_str).await {
        Ok(source) => {
            result
                .network
                .push(CheckResult::pass("source", "SQL Server source reachable"));
            Some(source)
        }
        Err(e) => {
            result.network.push(CheckResult::fail(
                "source",
                format!("SQL Server source unreachable: {}", e),
            ));
            result.issues.push(PreflightIssue {
                title: "SQL Server source unreachable".to_string(),
                explanation: e.to_string(),
                fixes: vec![
                    "Verify the connection string (--sqlserver / SQLSERVER_CONN)".to_string(),
                    "Check network connectivity to the database host".to_string(),
                    "Ensure firewall allows the SQL Server port (1433)".to_string(),
                ],
            });
            None
        }
    }
}

async fn check_destination_connectivity(
    result: &mut PreflightResult,
    config: &SyncConfig,
) -> Option<PostgresDestination> {
    match PostgresDestination::connect(config.destination.clone()).await {
        Ok(destination) => {
            result.network.push(
                CheckResult::pass("destination", "Destination store reachable")
                    .with_details(config.destination.display_target()),
            );
            Some(destination)
        }
        Err(e) => {
            result.network.push(CheckResult::fail(
                "destination",
                format!("Cannot connect to destination: {}", e),
            ));
            result.issues.push(PreflightIssue {
                title: "Destination store unreachable".to_string(),
                explanation: e.to_string(),
                fixes: vec![
                    "Verify --dest-host, --dest-port and credentials".to_string(),
                    "Check network connectivity to the destination host".to_string(),
                ],
            });
            None
        }
    }
}

async fn check_change_tracking(
    result: &mut PreflightResult,
    source: &mut SqlServerSource,
    config: &SyncConfig,
) {
    match source.database_tracking_enabled().await {
        Ok(true) => {
            result.change_tracking.push(CheckResult::pass(
                "database",
                "Change tracking enabled for the database",
            ));
        }
        Ok(false) => {
            result.change_tracking.push(CheckResult::fail(
                "database",
                "Change tracking disabled for the database",
            ));
            result.issues.push(PreflightIssue {
                title: "Change tracking not enabled".to_string(),
                explanation: "The source database does not track changes".to_string(),
                fixes: vec![
                    "Run: ALTER DATABASE <db> SET CHANGE_TRACKING = ON (CHANGE_RETENTION = 2 DAYS, AUTO_CLEANUP = ON);"
                        .to_string(),
                ],
            });
            return;
        }
        Err(e) => {
            result.change_tracking.push(CheckResult::fail(
                "database",
                format!("Could not read database change-tracking settings: {}", e),
            ));
            result.issues.push(PreflightIssue {
                title: "Change tracking status unknown".to_string(),
                explanation: e.to_string(),
                fixes: vec![
                    "Grant VIEW DATABASE STATE to the replication login".to_string(),
                ],
            });
            return;
        }
    }

    let mut untracked = Vec::new();
    let mut unreadable = Vec::new();
    for table in &config.tables {
        match source.check_change_tracking(table).await {
            Ok(true) => result.change_tracking.push(CheckResult::pass(
                table.source.as_str(),
                format!("{} is tracked (key {})", table.source, table.key_column),
            )),
            Ok(false) => {
                untracked.push(table.source.clone());
                result.change_tracking.push(CheckResult::fail(
                    table.source.as_str(),
                    format!("{} is not tracked", table.source),
                ));
            }
            Err(e) => {
                unreadable.push(table.source.clone());
                result.change_tracking.push(CheckResult::fail(
                    table.source.as_str(),
                    format!("Could not inspect {}: {}", table.source, e),
                ));
            }
        }
    }

    if !unreadable.is_empty() {
        result.issues.push(PreflightIssue {
            title: "Tables could not be inspected".to_string(),
            explanation: format!("Lookup failed for: {}", unreadable.join(", ")),
            fixes: vec![
                "Check the table names in --tables or the --config file".to_string(),
                "Grant VIEW CHANGE TRACKING on these tables to the replication login".to_string(),
            ],
        });
    }

    if !untracked.is_empty() {
        result.issues.push(PreflightIssue {
            title: "Tables without change tracking".to_string(),
            explanation: format!("Not tracked: {}", untracked.join(", ")),
            fixes: untracked
                .iter()
                .map(|t| {
                    format!(
                        "Run: ALTER TABLE {} ENABLE CHANGE_TRACKING;",
                        quote_mssql_qualified(t)
                    )
                })
                .collect(),
        });
    }
}

async fn check_destination_tables(
    result: &mut PreflightResult,
    destination: &PostgresDestination,
    config: &SyncConfig,
) {
    let mut missing = Vec::new();
    for table in &config.tables {
        let sql = format!("SELECT * FROM {} LIMIT 0", quote_qualified(&table.destination));
        match destination.query(&sql, &[], 1).await {
            Ok(output) => {
                // Writes quote identifiers, so the match is case-sensitive
                let has_key = output.columns.iter().any(|c| *c == table.key_column);
                if has_key {
                    result.destination_tables.push(CheckResult::pass(
                        table.destination.as_str(),
                        format!("{} exists", table.destination),
                    ));
                } else {
                    result.destination_tables.push(CheckResult::fail(
                        table.destination.as_str(),
                        format!("{} has no column {}", table.destination, table.key_column),
                    ));
                    result.issues.push(PreflightIssue {
                        title: format!("Key column missing in {}", table.destination),
                        explanation: format!(
                            "Upserts into {} are keyed on {}",
                            table.destination, table.key_column
                        ),
                        fixes: vec![format!(
                            "Declare the key column with --tables {}:<key>",
                            table.source
                        )],
                    });
                }
            }
            Err(e) => {
                missing.push(table.destination.clone());
                result.destination_tables.push(
                    CheckResult::fail(
                        table.destination.as_str(),
                        format!("{} is not accessible", table.destination),
                    )
                    .with_details(e.to_string()),
                );
            }
        }
    }

    if !missing.is_empty() {
        result.issues.push(PreflightIssue {
            title: "Destination tables missing".to_string(),
            explanation: format!("Cannot read: {}", missing.join(", ")),
            fixes: vec![
                "Create each destination table with a primary key on the key column".to_string(),
            ],
        });
    }
}
