//! # backup-helper engine
//!
//! Headless core of the backup-helper tool: stage source directories, hash
//! them, copy them to one or more targets and verify the copies.
//!
//! ## Overview
//!
//! All bulk work goes through a [`DiskWorkQueue`], which runs jobs on worker
//! threads while guaranteeing that no two running jobs touch the same storage
//! device. It features:
//! - Device identity resolution for paths that may not exist yet
//! - Per-job error isolation (failures are collected, not raised)
//! - Optional readiness predicates and progress callbacks
//! - Glob based allow/blocklists applied per directory while copying
//!
//! ## Basic Usage
//!
//! ```no_run
//! use backup_engine::{BackupState, ChecksumAlgorithm, Source, Target};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut state = BackupState::load(Path::new("backup_status.json"))?;
//!
//! let mut source = Source::new("/data/photos", Some("photos".into()), ChecksumAlgorithm::Sha512, false);
//! source.add_target(Target::new("/mnt/usb/photos", None, true))?;
//! state.add_source(source)?;
//!
//! state.hash_all(Path::new("logs"))?;
//! let (transfered, failed) = state.transfer_all()?;
//! println!("{} transfered, {} failed", transfered.len(), failed.len());
//!
//! state.save(Path::new("backup_status.json"))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **device**: Device identity of paths
//! - **queue**: Device-exclusive concurrent work queue
//! - **ignore**: Glob allow/blocklist filter
//! - **fs_ops**: Low-level filesystem operations
//! - **transfer**: Copying sources to their targets
//! - **hashing**: Creating checksum files for sources
//! - **verify**: Checking targets against checksum files
//! - **checksums**: Checksum algorithms and checksum files
//! - **state**: Persisted sources and targets
//! - **config**: Status file and log locations
//! - **progress**: Progress callback trait
//! - **error**: Error types and handling

pub mod checksums;
pub mod config;
pub mod device;
pub mod error;
pub mod fs_ops;
pub mod hashing;
pub mod ignore;
pub mod progress;
pub mod queue;
pub mod state;
pub mod transfer;
pub mod verify;

// Re-export main types and functions
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use config::BackupConfig;
pub use device::{resolve_device, DeviceId, DeviceResolver, FsDeviceResolver};
pub use error::{EngineError, EngineResult, QueueError};
pub use ignore::IgnoreFilter;
pub use progress::ProgressCallback;
pub use queue::{DiskWorkQueue, FinishedItems, JobResult, ResultRecord, RunningItem, WorkItem};
pub use state::{BackupState, Source, Target, VerifiedInfo};
pub use transfer::{setup_transfer_queue, SourceSpec, TransferPair, TransferQueue};
pub use verify::verify_target;
