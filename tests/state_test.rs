// ABOUTME: Integration tests for the watermark file and startup configuration errors
// ABOUTME: Exercises FileWatermarkStore through the public API and the binary's fatal diagnostics

use ct_replicator::tracking::{FileWatermarkStore, SyncState, WatermarkStore};
use std::fs;
use std::process::Command;
use tempfile::tempdir;

#[tokio::test]
async fn test_watermark_survives_reopen() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("sync_state.json");

    let store = FileWatermarkStore::new(&path);
    store.save(&SyncState::new(0).advanced_to(100)).await.unwrap();
    store.save(&SyncState::new(100).advanced_to(105)).await.unwrap();

    let reopened = FileWatermarkStore::new(&path);
    let state = reopened.load().await;
    assert_eq!(state.last_version, 105);
    assert!(state.updated_at.is_some());
}

#[tokio::test]
async fn test_legacy_integer_watermark_is_accepted() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("sync_state.json");
    fs::write(&path, "4242\n").unwrap();

    let state = FileWatermarkStore::new(&path).load().await;
    assert_eq!(state.last_version, 4242);
}

#[tokio::test]
async fn test_unwritable_state_path_fails_save() {
    let temp_dir = tempdir().unwrap();
    // A regular file where the parent directory should be
    let blocker = temp_dir.path().join("blocker");
    fs::write(&blocker, "x").unwrap();

    let store = FileWatermarkStore::new(blocker.join("state.json"));
    let err = store.save(&SyncState::new(1)).await.unwrap_err();
    assert_eq!(err.kind(), "state_unwritable");
    assert!(err.is_retryable());
}

fn replicator() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_ct-replicator"));
    command
        .env_remove("SQLSERVER_CONN")
        .env_remove("SYNC_TABLES")
        .env_remove("RUST_LOG");
    command
}

#[test]
fn test_missing_source_is_fatal() {
    let output = replicator()
        .arg("--tables")
        .arg("orders")
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("SQL Server connection string required"));
}

#[test]
fn test_missing_tables_is_fatal() {
    let output = replicator()
        .arg("--sqlserver")
        .arg("Server=tcp:localhost,1433;User Id=sa;Password=secret")
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("At least one table required"));
    assert!(!stderr.contains("secret"));
}

#[test]
fn test_tables_from_environment() {
    let temp_dir = tempdir().unwrap();
    let table_file = temp_dir.path().join("tables.toml");
    fs::write(&table_file, "[[tables]]\nname = \"dbo.orders\"\nkey = \"\"\n").unwrap();

    // Empty key in the file falls back to the default key; a bad interval is still fatal
    let output = replicator()
        .env("SYNC_TABLES", "customers:CustomerId")
        .arg("--sqlserver")
        .arg("Server=tcp:localhost,1433")
        .arg("--config")
        .arg(&table_file)
        .arg("--interval")
        .arg("0")
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("poll interval must be greater than zero"));
}
