//! File validation, delivery and guaranteed cleanup.
//!
//! A produced file is validated once (`finalize`) and then owned by a
//! [`Deliverable`], which removes it on drop. Delivery success, delivery
//! failure, early return, panic unwind: every path through the owner ends
//! in the same removal.

use crate::core::error::JobError;
use crate::extractor::MediaKind;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Capability that hands a finished file back through the chat transport
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Send the file with its caption
    ///
    /// # Errors
    ///
    /// Returns an error when the transport rejects the file.
    async fn send(&self, path: &Path, caption: &str, kind: MediaKind) -> anyhow::Result<()>;
}

/// A validated file, removed from disk when this value drops
#[derive(Debug)]
pub struct Deliverable {
    path: PathBuf,
    kind: MediaKind,
}

impl Deliverable {
    /// Location of the file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File class the ceiling was checked against
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }
}

impl Drop for Deliverable {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed delivered file"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove file"),
        }
    }
}

/// Validate a produced file: it must exist, be non-empty and fit under the
/// ceiling for its media kind. Rejected files are removed here.
///
/// # Errors
///
/// `FileMissing`, `FileEmpty` or `FileTooLarge`, classified per §the error
/// taxonomy; the empty/oversized file is already gone when these return.
pub fn finalize(path: PathBuf, kind: MediaKind) -> Result<Deliverable, JobError> {
    let size = match std::fs::metadata(&path) {
        Ok(meta) => meta.len(),
        Err(_) => return Err(JobError::FileMissing),
    };

    if size == 0 {
        let _ = std::fs::remove_file(&path);
        return Err(JobError::FileEmpty);
    }

    let ceiling = kind.size_ceiling();
    if size > ceiling {
        let _ = std::fs::remove_file(&path);
        return Err(JobError::FileTooLarge {
            size_mib: size / (1024 * 1024),
            limit_mib: ceiling / (1024 * 1024),
        });
    }

    Ok(Deliverable { path, kind })
}

/// Hand the file to the delivery capability. The file is removed afterwards
/// whether the transport accepted it or not.
///
/// # Errors
///
/// `JobError::Delivery` when the transport fails.
pub async fn deliver(
    deliverable: Deliverable,
    delivery: &dyn Delivery,
    caption: &str,
) -> Result<(), JobError> {
    let result = delivery
        .send(deliverable.path(), caption, deliverable.kind())
        .await;
    drop(deliverable);
    result.map_err(|e| JobError::Delivery(e.to_string()))
}
