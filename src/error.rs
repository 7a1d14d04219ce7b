//! Error Types
//!
//! Every failure the cache can report is a [`CacheError`]. None of them are
//! fatal: tables return them to the bucket router, the router returns them
//! through the job's reply channel, and the wire layer maps them to a status.

use crate::cache::Bucket;
use crate::storage::snapshot::SnapshotError;
use crate::storage::ValueKind;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Malformed TTL or increment argument
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("key '{0}' does not exist")]
    NotFound(String),

    /// SETNX on a key that is already present
    #[error("key '{0}' already exists")]
    AlreadyExists(String),

    /// The increment does not fit the stored width, or a negative delta was
    /// applied to an unsigned width
    #[error("incrementing '{key}' by {delta} overflows its {kind} value")]
    Overflow {
        key: String,
        kind: ValueKind,
        delta: i64,
    },

    /// Increment of a float, string or opaque value
    #[error("value of '{key}' is {kind}, not an integer")]
    TypeMismatch { key: String, kind: ValueKind },

    #[error("invalid key pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("failed to save the {bucket} bucket to {}: {source}", .path.display())]
    SaveFailed {
        bucket: Bucket,
        path: PathBuf,
        #[source]
        source: SnapshotError,
    },

    #[error("failed to load the {bucket} bucket from {}: {source}", .path.display())]
    LoadFailed {
        bucket: Bucket,
        path: PathBuf,
        #[source]
        source: SnapshotError,
    },

    #[error("no watcher operation has been configured")]
    WatcherUnconfigured,

    #[error("the watcher is already running")]
    WatcherRunning,

    #[error("the watcher is not running")]
    WatcherStopped,

    /// A job was submitted after the executor was shut down
    #[error("the executor has shut down")]
    ExecutorStopped,
}

/// Convenience Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
