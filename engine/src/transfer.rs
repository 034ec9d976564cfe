//! Transfer planning.
//!
//! A transfer copies one source tree into one target directory, honoring the
//! source's allowlist and blocklist. Transfers of all sources share a single
//! `DiskWorkQueue`, so copies run in parallel unless they touch the same
//! device.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::EngineResult;
use crate::fs_ops::{copy_tree, CopyStats};
use crate::ignore::IgnoreFilter;
use crate::queue::{DiskWorkQueue, FinishedItems};
use crate::state::{BackupState, Source, Target};

/// What a transfer needs to know about its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub path: PathBuf,
    pub allowlist: Vec<String>,
    pub blocklist: Vec<String>,
}

impl From<&Source> for SourceSpec {
    fn from(source: &Source) -> Self {
        SourceSpec {
            path: source.path.clone(),
            allowlist: source.allowlist.clone(),
            blocklist: source.blocklist.clone(),
        }
    }
}

/// One unit of transfer work: a source and one of its targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPair {
    pub source: SourceSpec,
    pub target: Target,
}

impl TransferPair {
    /// Copy the source tree into the target, skipping filtered entries.
    ///
    /// Does not touch `target.transfered`.
    pub fn copy(&self) -> EngineResult<CopyStats> {
        let filter = IgnoreFilter::new(
            &self.source.path,
            &self.source.blocklist,
            &self.source.allowlist,
        )?;
        copy_tree(&self.source.path, &self.target.path, |dir, names| {
            filter.ignored(dir, names)
        })
    }

    fn paths(&self) -> Vec<PathBuf> {
        vec![self.source.path.clone(), self.target.path.clone()]
    }
}

/// Queue type used for transfers; the result of a job is the updated pair.
pub type TransferQueue = DiskWorkQueue<TransferPair, TransferPair>;

/// Results of a batch of transfers: updated pairs and failed pairs with the
/// reason.
pub type TransferResults = FinishedItems<TransferPair, TransferPair>;

/// Create an empty queue whose jobs copy a source into a target.
///
/// A job occupies the devices of both the source and the target path. On
/// success the returned pair has `target.transfered` set.
pub fn setup_transfer_queue() -> TransferQueue {
    DiskWorkQueue::new(TransferPair::paths, |pair: &mut TransferPair| {
        let stats = pair.copy()?;
        info!(
            source = %pair.source.path.display(),
            target = %pair.target.path.display(),
            files = stats.files,
            bytes = stats.bytes,
            "Transfer finished"
        );
        pair.target.transfered = true;
        Ok(pair.clone())
    })
}

impl Source {
    /// Enqueue a transfer for every target that has not been transfered yet.
    ///
    /// Uses `queue` if given so several sources can share one scheduler,
    /// otherwise a fresh queue is created.
    pub fn transfer_queue_all(&self, queue: Option<TransferQueue>) -> EngineResult<TransferQueue> {
        let mut queue = queue.unwrap_or_else(setup_transfer_queue);
        let spec = SourceSpec::from(self);
        let pending = self
            .targets()
            .iter()
            .filter(|target| !target.transfered)
            .map(|target| TransferPair {
                source: spec.clone(),
                target: target.clone(),
            });
        queue.add_work(pending)?;
        Ok(queue)
    }

    /// Transfer to every pending target and record the successes.
    ///
    /// Failed transfers are returned with their reason; they do not abort the
    /// others.
    pub fn transfer_all(&mut self) -> EngineResult<TransferResults> {
        let mut queue = self.transfer_queue_all(None)?;
        let (transfered, failed) = queue.start_and_join_all()?;

        for pair in &transfered {
            self.apply_transfer(&pair.target);
        }
        log_failures(&failed);

        Ok((transfered, failed))
    }

    /// Transfer to a single target on the calling thread.
    ///
    /// A target that was already transfered is skipped unless `force` is set.
    ///
    /// # Returns
    /// `true` if a copy was made.
    ///
    /// # Errors
    /// Copy failures are returned directly and leave `transfered` unchanged.
    pub fn transfer(&mut self, target_key: &str, force: bool) -> EngineResult<bool> {
        let target = self.get_target(target_key)?;
        if target.transfered && !force {
            info!(target = %target.path.display(), "Target already transfered, skipping");
            return Ok(false);
        }

        let pair = TransferPair {
            source: SourceSpec::from(&*self),
            target: target.clone(),
        };
        pair.copy()?;

        self.apply_transfer(&pair.target);
        Ok(true)
    }

    fn apply_transfer(&mut self, transfered: &Target) {
        if let Some(target) = self.target_by_path_mut(&transfered.path) {
            target.transfered = true;
        }
    }
}

impl BackupState {
    /// Transfer every source to all of its pending targets through one shared
    /// queue.
    pub fn transfer_all(&mut self) -> EngineResult<TransferResults> {
        self.transfer_all_in(setup_transfer_queue())
    }

    /// Like `transfer_all`, but schedules on `queue`, e.g. one built with a
    /// progress callback.
    pub fn transfer_all_in(&mut self, queue: TransferQueue) -> EngineResult<TransferResults> {
        let mut queue = queue;
        for source in self.sources() {
            queue = source.transfer_queue_all(Some(queue))?;
        }

        let (transfered, failed) = queue.start_and_join_all()?;
        for pair in &transfered {
            if let Some(source) = self.source_by_path_mut(&pair.source.path) {
                source.apply_transfer(&pair.target);
            }
        }

        info!(
            transfered = transfered.len(),
            failed = failed.len(),
            "Transfer run finished"
        );
        log_failures(&failed);

        Ok((transfered, failed))
    }
}

fn log_failures(failed: &[(TransferPair, String)]) {
    for (pair, reason) in failed {
        warn!(
            source = %pair.source.path.display(),
            target = %pair.target.path.display(),
            "Transfer failed: {}",
            reason
        );
    }
}

/// "source -> target", for reports.
pub fn describe(pair: &TransferPair) -> String {
    format!(
        "{} -> {}",
        pair.source.path.display(),
        pair.target.path.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::ChecksumAlgorithm;
    use crate::device::resolve_device;
    use crate::error::EngineError;
    use std::fs;
    use std::path::Path;

    fn make_source(root: &Path) -> Source {
        let src = root.join("src");
        fs::create_dir_all(src.join("sub")).expect("Failed to create source tree");
        fs::write(src.join("a.txt"), "a").expect("Failed to write file");
        fs::write(src.join("skip.tmp"), "tmp").expect("Failed to write file");
        fs::write(src.join("sub").join("b.txt"), "b").expect("Failed to write file");
        Source::new(&src, Some("src".to_string()), ChecksumAlgorithm::Md5, false)
    }

    #[test]
    fn test_queue_all_skips_transfered_targets() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut source = make_source(temp_dir.path());
        source
            .add_target(Target::new(temp_dir.path().join("t1"), None, true))
            .expect("Failed to add target");
        let mut done = Target::new(temp_dir.path().join("t2"), None, true);
        done.transfered = true;
        source.add_target(done).expect("Failed to add target");

        let queue = source.transfer_queue_all(None).expect("Failed to queue");
        let pending = queue.pending_items();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.target.path, temp_dir.path().join("t1"));
        assert!(!pending[0].started);

        let expected = vec![
            resolve_device(&source.path).expect("Failed to resolve"),
            resolve_device(&temp_dir.path().join("t1")).expect("Failed to resolve"),
        ];
        assert_eq!(pending[0].involved_devices, expected);
    }

    #[test]
    fn test_queue_all_extends_given_queue() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut source = make_source(temp_dir.path());
        source
            .add_target(Target::new(temp_dir.path().join("t1"), None, true))
            .expect("Failed to add target");

        let queue = source.transfer_queue_all(None).expect("Failed to queue");
        let queue = source.transfer_queue_all(Some(queue)).expect("Failed to queue");
        assert_eq!(queue.submitted_count(), 2);
    }

    #[test]
    fn test_transfer_respects_blocklist_and_force() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut source = make_source(temp_dir.path());
        source.blocklist = vec!["*.tmp".to_string()];
        let target_path = temp_dir.path().join("backup");
        source
            .add_target(Target::new(&target_path, Some("b".to_string()), true))
            .expect("Failed to add target");

        assert!(source.transfer("b", false).expect("Transfer failed"));
        assert!(source.get_target("b").expect("Lookup failed").transfered);
        assert!(target_path.join("a.txt").exists());
        assert!(target_path.join("sub").join("b.txt").exists());
        assert!(!target_path.join("skip.tmp").exists());

        fs::remove_file(target_path.join("a.txt")).expect("Failed to remove file");
        assert!(!source.transfer("b", false).expect("Transfer failed"));
        assert!(!target_path.join("a.txt").exists());

        assert!(source.transfer("b", true).expect("Forced transfer failed"));
        assert!(target_path.join("a.txt").exists());
    }

    #[test]
    fn test_transfer_failure_leaves_flag_unset() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut source = make_source(temp_dir.path());
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, "file").expect("Failed to write file");
        source
            .add_target(Target::new(blocker.join("backup"), Some("bad".to_string()), true))
            .expect("Failed to add target");

        assert!(source.transfer("bad", false).is_err());
        assert!(!source.get_target("bad").expect("Lookup failed").transfered);
        assert!(matches!(
            source.transfer("missing", false),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_source_transfer_all_writes_back() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut source = make_source(temp_dir.path());
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, "file").expect("Failed to write file");
        source
            .add_target(Target::new(temp_dir.path().join("good"), Some("good".to_string()), true))
            .expect("Failed to add target");
        source
            .add_target(Target::new(blocker.join("bad"), Some("bad".to_string()), true))
            .expect("Failed to add target");

        let (transfered, failed) = source.transfer_all().expect("Transfer run failed");
        assert_eq!(transfered.len(), 1);
        assert!(transfered[0].target.transfered);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0.target.path, blocker.join("bad"));
        assert!(!failed[0].1.is_empty());

        assert!(source.get_target("good").expect("Lookup failed").transfered);
        assert!(!source.get_target("bad").expect("Lookup failed").transfered);
        assert!(temp_dir.path().join("good").join("sub").join("b.txt").exists());

        // only the failed target is retried
        let queue = source.transfer_queue_all(None).expect("Failed to queue");
        assert_eq!(queue.submitted_count(), 1);
    }

    #[test]
    fn test_state_transfer_all_shares_one_queue() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let first_root = temp_dir.path().join("one");
        let second_root = temp_dir.path().join("two");

        let mut state = BackupState::new();
        for root in [&first_root, &second_root] {
            let mut source = make_source(root);
            source.alias = None;
            source
                .add_target(Target::new(root.join("out"), None, false))
                .expect("Failed to add target");
            state.add_source(source).expect("Failed to add source");
        }

        let (transfered, failed) = state.transfer_all().expect("Transfer run failed");
        assert_eq!(transfered.len(), 2);
        assert!(failed.is_empty());
        for source in state.sources() {
            assert!(source.targets().iter().all(|t| t.transfered));
        }
        assert!(second_root.join("out").join("a.txt").exists());

        let (again, _) = state.transfer_all().expect("Transfer run failed");
        assert!(again.is_empty());
    }

    #[test]
    fn test_transfer_all_in_reports_progress() {
        use crate::progress::ProgressCallback;
        use crate::queue::{ResultRecord, WorkItem};
        use std::sync::{Arc, Mutex};

        struct Recorder(Arc<Mutex<Vec<String>>>);

        impl ProgressCallback<TransferPair, TransferPair> for Recorder {
            fn on_work_started(&self, item: &WorkItem<TransferPair>) {
                if let Ok(mut events) = self.0.lock() {
                    events.push(format!("start {}", describe(&item.payload)));
                }
            }

            fn on_work_completed(&self, record: &ResultRecord<TransferPair, TransferPair>) {
                if let Ok(mut events) = self.0.lock() {
                    events.push(format!("done {}", record.error.is_none()));
                }
            }
        }

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut source = make_source(temp_dir.path());
        source
            .add_target(Target::new(temp_dir.path().join("out"), None, false))
            .expect("Failed to add target");
        let mut state = BackupState::new();
        state.add_source(source).expect("Failed to add source");

        let events = Arc::new(Mutex::new(Vec::new()));
        let queue = setup_transfer_queue().with_progress(Recorder(Arc::clone(&events)));
        let (transfered, _) = state.transfer_all_in(queue).expect("Transfer run failed");
        assert_eq!(transfered.len(), 1);

        let events = events.lock().expect("Lock poisoned");
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("start "));
        assert_eq!(events[1], "done true");
    }

    #[test]
    fn test_allowlist_limits_copied_files() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut source = make_source(temp_dir.path());
        source.allowlist = vec!["b.txt".to_string()];
        let target_path = temp_dir.path().join("backup");
        source
            .add_target(Target::new(&target_path, None, false))
            .expect("Failed to add target");

        let key = target_path.display().to_string();
        source.transfer(&key, false).expect("Transfer failed");
        assert!(target_path.join("sub").join("b.txt").exists());
        assert!(!target_path.join("a.txt").exists());
    }

    #[test]
    fn test_describe() {
        let pair = TransferPair {
            source: SourceSpec {
                path: PathBuf::from("/a"),
                allowlist: Vec::new(),
                blocklist: Vec::new(),
            },
            target: Target::new("/b", None, true),
        };
        assert_eq!(describe(&pair), "/a -> /b");
    }
}
