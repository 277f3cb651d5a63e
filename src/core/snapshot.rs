//! Persistence of the statistics snapshot.
//!
//! The snapshot is always written as one whole document; there are no
//! partial updates. The shipped implementation keeps a flat JSON file and
//! swaps it in with a rename so a crash mid-write never leaves a torn
//! document behind.

use crate::core::stats::StatsSnapshot;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by snapshot stores
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Whole-document snapshot persistence
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the persisted snapshot, `None` when nothing was saved yet
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotError`] when the document exists but cannot be
    /// read or parsed.
    async fn load(&self) -> Result<Option<StatsSnapshot>, SnapshotError>;

    /// Persist the full snapshot
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotError`] when the document cannot be written.
    async fn save(&self, snapshot: &StatsSnapshot) -> Result<(), SnapshotError>;
}

/// Flat JSON file store
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Create a store backed by the given file path
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Option<StatsSnapshot>, SnapshotError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &StatsSnapshot) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        // Write-then-rename keeps the on-disk document whole at all times
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
