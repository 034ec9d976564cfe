//! Runtime configuration shared by the CLI and the engine.

use std::path::{Path, PathBuf};

use crate::checksums::ChecksumAlgorithm;
use crate::fs_ops::absolute_path;

/// Environment variable that overrides the default status file.
pub const STATUS_FILE_ENV: &str = "BACKUP_HELPER_STATUS_FILE";

/// Status file used when none is given.
pub const DEFAULT_STATUS_FILE: &str = "backup_status.json";

/// Where state and logs live, and the defaults for new sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    /// JSON document holding every staged source
    pub status_file: PathBuf,

    /// Directory receiving hash and verification logs
    pub log_dir: PathBuf,

    /// Algorithm for sources staged without an explicit one
    pub default_hash_algorithm: ChecksumAlgorithm,
}

impl BackupConfig {
    /// Config for `status_file`; logs go next to it.
    pub fn new(status_file: impl AsRef<Path>) -> Self {
        let status_file = absolute_path(status_file.as_ref());
        let log_dir = status_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        BackupConfig {
            status_file,
            log_dir,
            default_hash_algorithm: ChecksumAlgorithm::default(),
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl AsRef<Path>) -> Self {
        self.log_dir = absolute_path(log_dir.as_ref());
        self
    }

    pub fn with_hash_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.default_hash_algorithm = algorithm;
        self
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_FILE)
    }
}
