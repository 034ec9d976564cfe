//! Verifying transfered targets against the source's checksum file.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::checksums::{compute_file_checksum, parse_checksum_file};
use crate::error::{EngineError, EngineResult};
use crate::fs_ops::sanitize_filename;
use crate::hashing::{write_text, FILE_TIMESTAMP_FORMAT};
use crate::queue::{DiskWorkQueue, FinishedItems};
use crate::state::{BackupState, VerifiedInfo};

/// Re-hash every file listed in `hash_file` inside `target_root`.
///
/// Missing files, unreadable files and checksum mismatches are counted, not
/// raised. Every problem is written to a log in `log_dir`.
///
/// # Errors
/// Only if the hash file itself cannot be read or parsed, or the log cannot
/// be written.
pub fn verify_target(hash_file: &Path, target_root: &Path, log_dir: &Path) -> EngineResult<VerifiedInfo> {
    let content = fs::read_to_string(hash_file).map_err(|e| EngineError::ReadError {
        path: hash_file.to_path_buf(),
        source: e,
    })?;
    let checksums = parse_checksum_file(hash_file, &content)?;

    let mut errors = 0;
    let mut missing = 0;
    let mut crc_errors = 0;
    let mut log = format!(
        "Verifying {} against {} ({} file(s), {})\n",
        target_root.display(),
        hash_file.display(),
        checksums.entries.len(),
        checksums.algorithm
    );

    for (rel_path, expected) in &checksums.entries {
        let path = rel_path
            .split('/')
            .fold(target_root.to_path_buf(), |acc, part| acc.join(part));

        if !path.exists() {
            missing += 1;
            log.push_str(&format!("MISSING {}\n", rel_path));
            continue;
        }

        match compute_file_checksum(&path, checksums.algorithm) {
            Ok(actual) if actual.hex().eq_ignore_ascii_case(expected) => {
                debug!(file = %rel_path, "Verified");
            }
            Ok(actual) => {
                crc_errors += 1;
                log.push_str(&format!(
                    "MISMATCH {} expected {} got {}\n",
                    rel_path, expected, actual
                ));
            }
            Err(e) => {
                errors += 1;
                log.push_str(&format!("ERROR {}: {}\n", rel_path, e));
            }
        }
    }

    log.push_str(&format!(
        "errors: {}, missing: {}, crc_errors: {}\n",
        errors, missing, crc_errors
    ));

    let log_file = log_dir.join(format!(
        "{}_vf_{}.log",
        sanitize_filename(&target_root.display().to_string()),
        Local::now().format(FILE_TIMESTAMP_FORMAT)
    ));
    write_text(&log_file, &log)?;

    Ok(VerifiedInfo {
        errors,
        missing,
        crc_errors,
        log_file,
    })
}

/// A pending verification of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyJob {
    pub source_path: PathBuf,
    pub hash_file: Option<PathBuf>,
    pub target_path: PathBuf,
    pub verified: Option<VerifiedInfo>,
}

/// Paths a verification reads: the source holding the hash file, and the target.
fn verify_paths(job: &VerifyJob) -> Vec<PathBuf> {
    vec![job.source_path.clone(), job.target_path.clone()]
}

/// Results of a verification run: finished jobs and failed jobs.
pub type VerifyResults = FinishedItems<VerifyJob, VerifyJob>;

impl BackupState {
    /// Verify every transfered target that asks for verification and has not
    /// been verified yet. Results are recorded on the targets.
    pub fn verify_all(&mut self, log_dir: &Path) -> EngineResult<VerifyResults> {
        let mut jobs = Vec::new();
        for source in self.sources() {
            for target in source.targets() {
                if target.transfered && target.verify && target.verified.is_none() {
                    jobs.push(VerifyJob {
                        source_path: source.path.clone(),
                        hash_file: source.hash_file.clone(),
                        target_path: target.path.clone(),
                        verified: None,
                    });
                }
            }
        }
        if jobs.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let log_dir = log_dir.to_path_buf();
        let mut queue = DiskWorkQueue::new(
            verify_paths,
            move |job: &mut VerifyJob| {
                let hash_file = job.hash_file.as_ref().ok_or_else(|| EngineError::Hash {
                    path: job.source_path.clone(),
                    reason: "source has not been hashed".to_string(),
                })?;
                job.verified = Some(verify_target(hash_file, &job.target_path, &log_dir)?);
                Ok(job.clone())
            },
        );
        queue.add_work(jobs)?;

        let (verified, failed) = queue.start_and_join_all()?;
        for job in &verified {
            let target = self
                .source_by_path_mut(&job.source_path)
                .and_then(|source| source.target_by_path_mut(&job.target_path));
            if let Some(target) = target {
                target.verified = job.verified.clone();
            }
            if let Some(info) = job.verified.as_ref().filter(|info| !info.is_clean()) {
                warn!(
                    target = %job.target_path.display(),
                    errors = info.errors,
                    missing = info.missing,
                    crc_errors = info.crc_errors,
                    "Verification found problems"
                );
            }
        }
        for (job, reason) in &failed {
            warn!(target = %job.target_path.display(), "Verification failed: {}", reason);
        }
        info!(verified = verified.len(), failed = failed.len(), "Verification run finished");

        Ok((verified, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::ChecksumAlgorithm;
    use crate::state::{Source, Target};

    fn hashed_source(temp: &Path) -> Source {
        let root = temp.join("src");
        fs::create_dir_all(root.join("sub")).expect("Failed to create dir");
        fs::write(root.join("a.txt"), "alpha").expect("Failed to write file");
        fs::write(root.join("b.txt"), "beta").expect("Failed to write file");
        fs::write(root.join("sub").join("c.txt"), "gamma").expect("Failed to write file");

        let mut source = Source::new(&root, None, ChecksumAlgorithm::Sha256, true);
        source.hash(&temp.join("logs")).expect("Hashing failed");
        source
    }

    #[test]
    fn test_verify_counts_problems() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = hashed_source(temp_dir.path());
        let target = temp_dir.path().join("dst");
        fs::create_dir_all(target.join("sub")).expect("Failed to create dir");
        fs::write(target.join("a.txt"), "alpha").expect("Failed to write file");
        fs::write(target.join("sub").join("c.txt"), "corrupted").expect("Failed to write file");

        let hash_file = source.hash_file.as_ref().expect("No hash file");
        let info = verify_target(hash_file, &target, &temp_dir.path().join("logs"))
            .expect("Verification failed");

        assert_eq!(info.missing, 1);
        assert_eq!(info.crc_errors, 1);
        assert_eq!(info.errors, 0);
        assert!(!info.is_clean());
        let log = fs::read_to_string(&info.log_file).expect("Failed to read log");
        assert!(log.contains("MISSING b.txt"));
        assert!(log.contains("MISMATCH sub/c.txt"));
    }

    #[test]
    fn test_verify_claims_source_and_target() {
        let job = VerifyJob {
            source_path: PathBuf::from("/data/src"),
            hash_file: Some(PathBuf::from("/data/src/src_bh_x.cshd")),
            target_path: PathBuf::from("/mnt/usb/dst"),
            verified: None,
        };
        assert_eq!(
            verify_paths(&job),
            vec![PathBuf::from("/data/src"), PathBuf::from("/mnt/usb/dst")]
        );
    }

    #[test]
    fn test_verify_missing_hash_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = verify_target(
            &temp_dir.path().join("none.sha256"),
            temp_dir.path(),
            temp_dir.path(),
        );
        assert!(matches!(result, Err(EngineError::ReadError { .. })));
    }

    #[test]
    fn test_verify_all_after_transfer() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut source = hashed_source(temp_dir.path());
        source
            .add_target(Target::new(temp_dir.path().join("dst"), Some("dst".to_string()), true))
            .expect("Failed to add target");
        source
            .add_target(Target::new(temp_dir.path().join("skip"), Some("skip".to_string()), false))
            .expect("Failed to add target");

        let mut state = BackupState::new();
        state.add_source(source).expect("Failed to add source");
        let (transfered, failed) = state.transfer_all().expect("Transfer failed");
        assert_eq!(transfered.len(), 2);
        assert!(failed.is_empty());

        let (verified, failed) = state
            .verify_all(&temp_dir.path().join("logs"))
            .expect("Verification run failed");
        assert_eq!(verified.len(), 1);
        assert!(failed.is_empty());

        let source = &state.sources()[0];
        let info = source
            .get_target("dst")
            .expect("Lookup failed")
            .verified
            .clone()
            .expect("Result not recorded");
        assert!(info.is_clean());
        assert!(source.get_target("skip").expect("Lookup failed").verified.is_none());

        // already verified targets are not checked again
        let (again, _) = state
            .verify_all(&temp_dir.path().join("logs"))
            .expect("Verification run failed");
        assert!(again.is_empty());
    }

    #[test]
    fn test_verify_all_unhashed_source_fails_job() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut source = Source::new(temp_dir.path().join("src"), None, ChecksumAlgorithm::Md5, false);
        let mut target = Target::new(temp_dir.path().join("dst"), None, true);
        target.transfered = true;
        source.add_target(target).expect("Failed to add target");

        let mut state = BackupState::new();
        state.add_source(source).expect("Failed to add source");
        let (verified, failed) = state.verify_all(temp_dir.path()).expect("Verification run failed");
        assert!(verified.is_empty());
        assert_eq!(failed.len(), 1);
        assert!(failed[0].1.contains("has not been hashed"));
    }
}
