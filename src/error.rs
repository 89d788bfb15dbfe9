// ABOUTME: Error kinds raised by the sync engine and its adapters
// ABOUTME: Classifies failures into retryable, fallback, and fatal categories

use std::path::PathBuf;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection or query failure against the source.
    #[error("source unavailable: {context}")]
    SourceUnavailable {
        context: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The source no longer retains change history back to the requested version.
    #[error(
        "change tracking history for {table} expired: version {since} is older than minimum valid version {min_valid}"
    )]
    SourceHistoryExpired {
        table: String,
        since: i64,
        min_valid: i64,
    },

    /// Connectivity loss or timeout while writing to the destination.
    #[error("destination unavailable: {context}")]
    DestinationUnavailable {
        context: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The destination refused a malformed statement. Never retried as-is.
    #[error("destination rejected statement: {context}")]
    DestinationRejected {
        context: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("sync state at {path:?} is unreadable: {reason}")]
    StateUnreadable { path: PathBuf, reason: String },

    #[error("failed to persist sync state to {path:?}")]
    StateUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sync pass cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn source_unavailable(
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        SyncError::SourceUnavailable {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    pub fn destination_unavailable(
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        SyncError::DestinationUnavailable {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    pub fn destination_rejected(context: impl Into<String>) -> Self {
        SyncError::DestinationRejected {
            context: context.into(),
            source: None,
        }
    }

    /// Short stable name of the error kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::SourceUnavailable { .. } => "source_unavailable",
            SyncError::SourceHistoryExpired { .. } => "source_history_expired",
            SyncError::DestinationUnavailable { .. } => "destination_unavailable",
            SyncError::DestinationRejected { .. } => "destination_rejected",
            SyncError::ConfigInvalid(_) => "config_invalid",
            SyncError::StateUnreadable { .. } => "state_unreadable",
            SyncError::StateUnwritable { .. } => "state_unwritable",
            SyncError::Cancelled => "cancelled",
        }
    }

    /// Whether the next scheduled pass may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::SourceUnavailable { .. }
                | SyncError::DestinationUnavailable { .. }
                | SyncError::StateUnwritable { .. }
        )
    }

    /// Whether the failure points at a defect (bad statement, bad config)
    /// rather than a transient condition.
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            SyncError::DestinationRejected { .. } | SyncError::ConfigInvalid(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(SyncError::source_unavailable("boom", "io").is_retryable());
        assert!(SyncError::destination_unavailable("boom", "io").is_retryable());
        assert!(!SyncError::destination_rejected("arity").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn test_defect_kinds() {
        assert!(SyncError::destination_rejected("arity").is_defect());
        assert!(SyncError::ConfigInvalid("no tables".to_string()).is_defect());
        assert!(!SyncError::source_unavailable("boom", "io").is_defect());
    }

    #[test]
    fn test_history_expired_message() {
        let err = SyncError::SourceHistoryExpired {
            table: "dbo.orders".to_string(),
            since: 10,
            min_valid: 42,
        };
        assert_eq!(err.kind(), "source_history_expired");
        assert!(err.to_string().contains("dbo.orders"));
        assert!(err.to_string().contains("42"));
    }
}
