//! Device identity resolution.
//!
//! Two jobs touching the same physical device must not run at the same time,
//! so every path a job touches is mapped to the device it lives on. Staged
//! sources and fresh targets often don't exist yet, in which case the nearest
//! existing ancestor decides the device.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// Opaque token for the storage device backing a path.
///
/// Only equality matters; the numeric value carries no ordering meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Wrap a raw device number.
    pub fn from_raw(raw: u64) -> Self {
        DeviceId(raw)
    }

    /// The raw device number.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev:{}", self.0)
    }
}

/// Maps paths to device identities.
///
/// The work queue calls this on the controlling thread only.
pub trait DeviceResolver {
    /// Resolve the device backing `path`.
    fn resolve(&self, path: &Path) -> EngineResult<DeviceId>;
}

/// Resolver backed by filesystem metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsDeviceResolver;

impl DeviceResolver for FsDeviceResolver {
    fn resolve(&self, path: &Path) -> EngineResult<DeviceId> {
        resolve_device(path)
    }
}

/// Resolve the device of `path`, walking up to the nearest existing ancestor
/// when `path` itself does not exist.
///
/// # Errors
/// Returns `EngineError::DeviceResolution` if no ancestor exists, including
/// the filesystem root, and `EngineError::ReadError` if an existing path
/// cannot be stat-ed (permissions, symlink loops).
pub fn resolve_device(path: &Path) -> EngineResult<DeviceId> {
    let absolute = absolutize(path);
    let mut current: Option<&Path> = Some(absolute.as_path());

    while let Some(candidate) = current {
        match fs::metadata(candidate) {
            Ok(metadata) => return Ok(device_of(candidate, &metadata)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => current = candidate.parent(),
            Err(e) => {
                return Err(EngineError::ReadError {
                    path: candidate.to_path_buf(),
                    source: e,
                })
            }
        }
    }

    Err(EngineError::DeviceResolution {
        path: path.to_path_buf(),
    })
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(unix)]
fn device_of(_path: &Path, metadata: &fs::Metadata) -> DeviceId {
    use std::os::unix::fs::MetadataExt;
    DeviceId(metadata.dev())
}

#[cfg(not(unix))]
fn device_of(path: &Path, _metadata: &fs::Metadata) -> DeviceId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::path::Component;

    // Volume serial numbers are not exposed on stable; the drive prefix
    // (C:, \\server\share) identifies the volume closely enough.
    let mut hasher = DefaultHasher::new();
    match path.components().next() {
        Some(Component::Prefix(prefix)) => {
            prefix.as_os_str().to_ascii_uppercase().hash(&mut hasher)
        }
        Some(other) => other.as_os_str().hash(&mut hasher),
        None => 0u8.hash(&mut hasher),
    }
    DeviceId(hasher.finish())
}
