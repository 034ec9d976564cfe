//! Hashing sources.
//!
//! Hashing a source writes a checksum file into the source root and a log of
//! the run into the log directory. All sources are hashed through one
//! `DiskWorkQueue` keyed on the source path, so sources on different devices
//! are hashed in parallel.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::checksums::{
    compute_file_checksum, generate_checksum_file, ChecksumAlgorithm, ChecksumValue,
};
use crate::error::{EngineError, EngineResult};
use crate::fs_ops::{enumerate_files, ensure_parent_dir_exists, sanitize_filename};
use crate::ignore::IgnoreFilter;
use crate::queue::{DiskWorkQueue, FinishedItems};
use crate::state::{BackupState, Source};

/// Marker between directory name and timestamp in checksum file names.
const HASH_FILE_MARKER: &str = "_bh_";

/// Extension of checksum files not named after their algorithm.
const MULTI_HASH_EXTENSION: &str = "cshd";

/// Timestamp format used in generated file names.
pub(crate) const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Results of hashing several sources: updated sources and failures.
pub type HashResults = FinishedItems<Source, Source>;

/// True for checksum files written by a previous hash run.
fn is_hash_file(rel_path: &Path) -> bool {
    let Some(name) = rel_path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    name.contains(HASH_FILE_MARKER)
        && rel_path
            .extension()
            .map_or(false, |ext| ext == MULTI_HASH_EXTENSION || is_algorithm_name(ext))
}

fn is_algorithm_name(ext: &OsStr) -> bool {
    ext.to_str()
        .and_then(ChecksumAlgorithm::from_name)
        .is_some()
}

/// Relative path with `/` separators, as stored in checksum files.
fn portable(rel_path: &Path) -> String {
    rel_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

impl Source {
    fn hash_file_path(&self, timestamp: &str) -> PathBuf {
        let dir_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        let extension = if self.force_single_hash {
            self.hash_algorithm.to_string()
        } else {
            MULTI_HASH_EXTENSION.to_string()
        };
        self.path.join(format!(
            "{}{}{}.{}",
            dir_name, HASH_FILE_MARKER, timestamp, extension
        ))
    }

    /// Checksum every file of the source that passes its filters.
    ///
    /// Writes `<dirname>_bh_<timestamp>.<ext>` into the source root and
    /// `<sanitized path>_inc_<timestamp>.log` into `log_dir`, then records
    /// both paths on the source.
    ///
    /// # Errors
    /// `EngineError::Hash` if a file cannot be read; filter and enumeration
    /// errors are returned as they are.
    pub fn hash(&mut self, log_dir: &Path) -> EngineResult<PathBuf> {
        let timestamp = Local::now().format(FILE_TIMESTAMP_FORMAT).to_string();
        let filter = IgnoreFilter::new(&self.path, &self.blocklist, &self.allowlist)?;
        let files = enumerate_files(&self.path, &filter)?;

        let mut checksums: Vec<(String, ChecksumValue)> = Vec::with_capacity(files.len());
        for rel_path in files.iter().filter(|p| !is_hash_file(p)) {
            let checksum = compute_file_checksum(&self.path.join(rel_path), self.hash_algorithm)
                .map_err(|e| EngineError::Hash {
                    path: self.path.join(rel_path),
                    reason: e.to_string(),
                })?;
            debug!(file = %rel_path.display(), checksum = %checksum, "Hashed");
            checksums.push((portable(rel_path), checksum));
        }

        let hash_file = self.hash_file_path(&timestamp);
        write_text(
            &hash_file,
            &generate_checksum_file(&checksums, self.hash_algorithm),
        )?;

        let log_file = log_dir.join(format!(
            "{}_inc_{}.log",
            sanitize_filename(&self.path.display().to_string()),
            timestamp
        ));
        let mut log = format!(
            "Hashed {} file(s) of {} with {}\n",
            checksums.len(),
            self.path.display(),
            self.hash_algorithm
        );
        for (rel_path, checksum) in &checksums {
            log.push_str(&format!("{} {}\n", checksum, rel_path));
        }
        log.push_str(&format!("Checksum file: {}\n", hash_file.display()));
        write_text(&log_file, &log)?;

        info!(
            hash_file = %hash_file.display(),
            log_file = %log_file.display(),
            files = checksums.len(),
            "Created hash file"
        );

        self.hash_file = Some(hash_file.clone());
        self.hash_log_file = Some(log_file);
        Ok(hash_file)
    }
}

pub(crate) fn write_text(path: &Path, contents: &str) -> EngineResult<()> {
    ensure_parent_dir_exists(path)?;
    fs::write(path, contents).map_err(|e| EngineError::WriteError {
        path: path.to_path_buf(),
        source: e,
    })
}

impl BackupState {
    /// Hash every source. Failures are logged and returned, never raised.
    pub fn hash_all(&mut self, log_dir: &Path) -> EngineResult<HashResults> {
        let log_dir = log_dir.to_path_buf();
        let mut queue = DiskWorkQueue::new(
            |source: &Source| vec![source.path.clone()],
            move |source: &mut Source| {
                source.hash(&log_dir)?;
                Ok(source.clone())
            },
        );
        queue.add_work(self.sources().iter().cloned())?;

        let (hashed, failed) = queue.start_and_join_all()?;
        for updated in &hashed {
            if let Some(source) = self.source_by_path_mut(&updated.path) {
                source.hash_file = updated.hash_file.clone();
                source.hash_log_file = updated.hash_log_file.clone();
            }
        }
        for (source, reason) in &failed {
            warn!(source = %source.path.display(), "Hashing failed: {}", reason);
        }
        info!(hashed = hashed.len(), failed = failed.len(), "Hash run finished");

        Ok((hashed, failed))
    }
}
