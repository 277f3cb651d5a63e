//! Classified job failures.
//!
//! Each variant's display string doubles as the stable, user-facing status
//! message for that outcome; classification is carried by the variant, never
//! parsed back out of the text.

use thiserror::Error;

/// Terminal failure of one job, classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// An identical request was admitted moments ago
    #[error("this exact request was just made, try again in a few seconds")]
    DuplicateRequest,

    /// An identical request is still being processed
    #[error("an identical request is already in progress")]
    Busy,

    /// The platform insists on sign-in and the relaxed retry did not help
    #[error("the source requires sign-in; try again later or use a different link")]
    AuthRequired,

    /// Retried up to the attempt cap without success
    #[error("download failed after {attempts} attempts: {cause}")]
    TransientFailure {
        /// How many attempts were made
        attempts: u32,
        /// Last underlying cause
        cause: String,
    },

    /// The target cannot be processed (gone, private, no tool for it)
    #[error("this content cannot be processed: {0}")]
    Unsupported(String),

    /// The extractor reported success but no file exists
    #[error("the produced file was not found")]
    FileMissing,

    /// The produced file is zero bytes
    #[error("the produced file is empty")]
    FileEmpty,

    /// The produced file exceeds the ceiling for its media kind
    #[error("the file is too large ({size_mib} MiB, limit {limit_mib} MiB)")]
    FileTooLarge {
        /// Actual size in MiB
        size_mib: u64,
        /// Ceiling in MiB
        limit_mib: u64,
    },

    /// The job ran out of wall-clock time (the underlying work may still
    /// be running; its result is discarded)
    #[error("the operation timed out")]
    TimedOut,

    /// The file was fine but handing it to the chat transport failed
    #[error("sending the file failed: {0}")]
    Delivery(String),

    /// Worker infrastructure failure (task panic, closed pool)
    #[error("internal error: {0}")]
    Internal(String),
}
