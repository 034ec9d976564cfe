//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Copying directory trees with a per-directory exclusion callback
//! - Copying files with metadata preservation
//! - Enumerating the files of a tree that pass an ignore filter
//! - Creating directories recursively

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::ignore::IgnoreFilter;

/// Counters for a finished tree copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
}

/// Recursively copy `source` into `destination`.
///
/// For every visited directory `ignore(dir, names)` is called with the
/// directory's path and the names of its immediate entries; the returned names
/// are neither copied nor descended into. Existing destination directories are
/// reused and existing files overwritten.
///
/// # Arguments
/// * `source` - Source directory
/// * `destination` - Destination root, created if missing
/// * `ignore` - Exclusion callback consulted once per directory
///
/// # Errors
/// Fails immediately if the source root is missing or cannot be listed.
/// Failures below the root do not stop the copy; they are collected and
/// returned together as `EngineError::CopyIncomplete`.
pub fn copy_tree<F>(source: &Path, destination: &Path, ignore: F) -> EngineResult<CopyStats>
where
    F: Fn(&Path, &[String]) -> Vec<String>,
{
    match fs::metadata(source) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(EngineError::InvalidPath {
                path: source.to_path_buf(),
                reason: "Source must be a directory".to_string(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(EngineError::SourceNotFound {
                path: source.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(EngineError::EnumerationFailed {
                path: source.to_path_buf(),
                source: e,
            })
        }
    }

    let mut stats = CopyStats::default();
    let mut failures = Vec::new();
    copy_dir(source, destination, &ignore, &mut stats, &mut failures)?;

    debug!(
        source = %source.display(),
        destination = %destination.display(),
        files = stats.files,
        bytes = stats.bytes,
        failed = failures.len(),
        "Tree copy finished"
    );

    if failures.is_empty() {
        Ok(stats)
    } else {
        Err(EngineError::CopyIncomplete {
            source_root: source.to_path_buf(),
            failures,
        })
    }
}

fn copy_dir<F>(
    src: &Path,
    dst: &Path,
    ignore: &F,
    stats: &mut CopyStats,
    failures: &mut Vec<(PathBuf, String)>,
) -> EngineResult<()>
where
    F: Fn(&Path, &[String]) -> Vec<String>,
{
    let entries = list_dir(src)?;
    let names: Vec<String> = entries.iter().map(|(_, name)| name.clone()).collect();
    let ignored: HashSet<String> = ignore(src, &names).into_iter().collect();

    fs::create_dir_all(dst).map_err(|e| EngineError::DirectoryCreationFailed {
        path: dst.to_path_buf(),
        source: e,
    })?;
    stats.directories += 1;

    for (os_name, name) in entries {
        if ignored.contains(&name) {
            continue;
        }
        let src_path = src.join(&os_name);
        let dst_path = dst.join(&os_name);

        let result = match fs::metadata(&src_path) {
            Ok(metadata) if metadata.is_dir() => {
                copy_dir(&src_path, &dst_path, ignore, stats, failures)
            }
            Ok(_) => copy_file_with_metadata(&src_path, &dst_path).map(|bytes| {
                stats.files += 1;
                stats.bytes += bytes;
            }),
            Err(e) => Err(EngineError::ReadError {
                path: src_path.clone(),
                source: e,
            }),
        };

        if let Err(e) = result {
            failures.push((src_path, e.to_string()));
        }
    }

    Ok(())
}

/// Entries of `dir` sorted by name, with their lossy UTF-8 names.
fn list_dir(dir: &Path) -> EngineResult<Vec<(OsString, String)>> {
    let read = fs::read_dir(dir).map_err(|e| EngineError::EnumerationFailed {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut entries = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| EngineError::EnumerationFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let os_name = entry.file_name();
        let name = os_name.to_string_lossy().into_owned();
        entries.push((os_name, name));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// Enumerate the files below `root` that pass `filter`.
///
/// # Returns
/// Paths relative to `root`, sorted, directories excluded.
///
/// # Errors
/// Returns EngineError if any directory cannot be listed.
pub fn enumerate_files(root: &Path, filter: &IgnoreFilter) -> EngineResult<Vec<PathBuf>> {
    let mut files = Vec::new();

    fn recurse(
        path: &Path,
        rel_path: &Path,
        filter: &IgnoreFilter,
        files: &mut Vec<PathBuf>,
    ) -> EngineResult<()> {
        let entries = list_dir(path)?;
        let names: Vec<String> = entries.iter().map(|(_, name)| name.clone()).collect();
        let ignored: HashSet<String> = filter.ignored(path, &names).into_iter().collect();

        for (os_name, name) in entries {
            if ignored.contains(&name) {
                continue;
            }
            let entry_path = path.join(&os_name);
            let rel_full_path = rel_path.join(&os_name);
            let metadata = fs::metadata(&entry_path).map_err(|e| EngineError::ReadError {
                path: entry_path.clone(),
                source: e,
            })?;

            if metadata.is_dir() {
                recurse(&entry_path, &rel_full_path, filter, files)?;
            } else {
                files.push(rel_full_path);
            }
        }
        Ok(())
    }

    recurse(root, Path::new(""), filter, &mut files)?;
    Ok(files)
}

/// Copy a file from source to destination with metadata preservation.
///
/// # Arguments
/// * `src` - Source file path
/// * `dst` - Destination file path
///
/// # Returns
/// Number of bytes copied
///
/// # Errors
/// Returns EngineError if the copy fails
pub fn copy_file_with_metadata(src: &Path, dst: &Path) -> EngineResult<u64> {
    ensure_parent_dir_exists(dst)?;

    let mut src_file = fs::File::open(src).map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;

    let src_metadata = src_file.metadata().map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;
    let src_mtime = src_metadata.modified().ok();

    let mut dst_file = fs::File::create(dst).map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })?;

    let bytes_copied = io::copy(&mut src_file, &mut dst_file).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            EngineError::WriteError {
                path: dst.to_path_buf(),
                source: e,
            }
        } else {
            EngineError::ReadError {
                path: src.to_path_buf(),
                source: e,
            }
        }
    })?;
    drop(dst_file);

    if let Some(mtime) = src_mtime {
        let _ = filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime));
    }

    Ok(bytes_copied)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns EngineError if directory creation fails or the parent is a file
pub fn ensure_parent_dir_exists(path: &Path) -> EngineResult<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}

/// Make `path` absolute against the working directory and fold `.` and `..`
/// lexically. Symlinks are not resolved.
pub fn absolute_path(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// `path` itself if it does not exist, otherwise the first free
/// `<stem>_<n><ext>` next to it.
pub fn unique_filename(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 0u32;
    loop {
        let candidate = path.with_file_name(format!("{}_{}{}", stem, counter, ext));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Replace characters that are not allowed in file names with `_`.
pub fn sanitize_filename(name: &str) -> String {
    const BANNED: &[char] = &['/', '<', '>', ':', '"', '\\', '|', '?', '*'];
    name.trim()
        .chars()
        .map(|c| if BANNED.contains(&c) { '_' } else { c })
        .collect()
}
