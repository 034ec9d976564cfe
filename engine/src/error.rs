//! Error types for the backup engine.
//!
//! `EngineError` covers failures that stop an operation (a copy, a hash run,
//! loading state). `QueueError` covers scheduler failures. Failures of single
//! work items are never raised; the queue records them as messages next to
//! the payload that failed.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that stop an engine operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source directory does not exist
    #[error("Source directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Failed to read from a file or directory
    #[error("Failed to read file: {}", path.display())]
    ReadError { path: PathBuf, source: io::Error },

    /// Failed to write to a destination file
    #[error("Failed to write file: {}", path.display())]
    WriteError { path: PathBuf, source: io::Error },

    /// Failed to list a directory
    #[error("Failed to enumerate directory: {}", path.display())]
    EnumerationFailed { path: PathBuf, source: io::Error },

    /// Failed to create a directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed { path: PathBuf, source: io::Error },

    /// Path is unusable for the requested operation
    #[error("Invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// No existing ancestor was found while resolving a device
    #[error("Could not determine device of path {}", path.display())]
    DeviceResolution { path: PathBuf },

    /// A blocklist or allowlist entry is not a valid glob
    #[error("Invalid glob pattern '{pattern}'")]
    InvalidPattern {
        pattern: String,
        source: globset::Error,
    },

    /// A tree copy finished but some entries could not be copied
    #[error("{} entries failed to copy from {}", failures.len(), source_root.display())]
    CopyIncomplete {
        source_root: PathBuf,
        failures: Vec<(PathBuf, String)>,
    },

    /// Creating or reading checksums failed
    #[error("Hashing {} failed: {reason}", path.display())]
    Hash { path: PathBuf, reason: String },

    /// Lookup of a source or target by path or alias failed
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },

    /// A source, target or alias is already registered
    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// The persisted state document could not be read or written
    #[error("Invalid state file: {}", path.display())]
    State {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A field given to `modify` is unknown or its value does not parse
    #[error("Cannot set field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// The scheduler aborted the batch
    #[error(transparent)]
    Queue(Box<QueueError>),
}

impl From<QueueError> for EngineError {
    fn from(err: QueueError) -> Self {
        EngineError::Queue(Box::new(err))
    }
}

/// Errors raised by the disk work queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Nothing is running, nothing could be started and work is still pending.
    ///
    /// `blocked` holds the ids of every un-started item in submission order.
    /// The items stay queued: `DiskWorkQueue::pending_item(id)` returns the
    /// payload, and a later `start_ready_devices` retries them.
    #[error("{} queued item(s) will never be ready", blocked.len())]
    ItemsWillNeverBeReady { blocked: Vec<Uuid> },

    /// A finished record carries neither a result nor an error
    #[error("Fatal error: no error, but result is missing for work {id}")]
    MissingOutcome { id: Uuid },

    /// Device lookup for a submitted item failed
    #[error("Failed to resolve devices for queued work")]
    Resolve(#[source] Box<EngineError>),
}

impl From<EngineError> for QueueError {
    fn from(err: EngineError) -> Self {
        QueueError::Resolve(Box::new(err))
    }
}
