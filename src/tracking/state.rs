// ABOUTME: SyncState for change-tracking sync - the single replication watermark
// ABOUTME: Persists the last fully applied change-tracking version with atomic file replacement

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, SyncError};

/// The synchronization watermark.
///
/// `last_version == 0` means the destination has never been bootstrapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Last change-tracking version fully applied to the destination
    pub last_version: i64,
    /// When the watermark last advanced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SyncState {
    pub fn new(last_version: i64) -> Self {
        Self {
            last_version,
            updated_at: None,
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.last_version > 0
    }

    /// The state after a successful pass up to `version`.
    pub fn advanced_to(&self, version: i64) -> Self {
        Self {
            last_version: version,
            updated_at: Some(chrono::Utc::now()),
        }
    }

    /// Parse a stored watermark. Accepts the JSON document written by
    /// [`FileWatermarkStore`] and a bare integer.
    pub fn parse(contents: &str) -> std::result::Result<Self, String> {
        let trimmed = contents.trim();
        if let Ok(version) = trimmed.parse::<i64>() {
            return Self::checked(Self::new(version));
        }
        let state: SyncState = serde_json::from_str(trimmed).map_err(|e| e.to_string())?;
        Self::checked(state)
    }

    fn checked(state: Self) -> std::result::Result<Self, String> {
        if state.last_version < 0 {
            return Err(format!("negative version {}", state.last_version));
        }
        Ok(state)
    }
}

/// Durable home of the watermark.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Load the watermark. Never fails: missing or corrupt state reads as
    /// "never synced" so the next pass performs a full load.
    async fn load(&self) -> SyncState;

    async fn save(&self, state: &SyncState) -> Result<()>;
}

/// Watermark persisted as a small human-readable JSON file.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "sync_state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn read(&self) -> Result<Option<SyncState>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::StateUnreadable {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };
        SyncState::parse(&contents)
            .map(Some)
            .map_err(|reason| SyncError::StateUnreadable {
                path: self.path.clone(),
                reason,
            })
    }

    async fn write(&self, state: &SyncState) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let contents = serde_json::to_string_pretty(state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        // Write beside the target and rename so a crash never leaves a torn file
        let temp = self.temp_path();
        let mut file = fs::File::create(&temp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, &self.path).await
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn load(&self) -> SyncState {
        match self.read().await {
            Ok(Some(state)) => {
                tracing::info!(
                    "Loaded sync state from {:?} (last version {})",
                    self.path,
                    state.last_version
                );
                state
            }
            Ok(None) => {
                tracing::info!("No sync state at {:?}, starting from scratch", self.path);
                SyncState::default()
            }
            Err(e) => {
                tracing::warn!(kind = e.kind(), "{}. Falling back to a full resync.", e);
                SyncState::default()
            }
        }
    }

    async fn save(&self, state: &SyncState) -> Result<()> {
        self.write(state)
            .await
            .map_err(|source| SyncError::StateUnwritable {
                path: self.path.clone(),
                source,
            })?;
        tracing::debug!(
            "Saved sync state to {:?} (last version {})",
            self.path,
            state.last_version
        );
        Ok(())
    }
}
