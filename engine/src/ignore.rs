//! Per-directory exclusion of entries by glob pattern.
//!
//! A pattern that contains a `/` is matched against the entry's path relative
//! to the source root. A pattern without one is matched against the bare entry
//! name, at any depth. `*` also matches `/`, as with shell `fnmatch`.
//!
//! Patterns are evaluated one directory at a time while a tree is walked. An
//! excluded directory is never entered, so nothing below it can be brought
//! back in.

use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{EngineError, EngineResult};

/// Compiled glob patterns split by how they are matched.
#[derive(Debug, Clone)]
struct PatternSet {
    names: GlobSet,
    paths: GlobSet,
    len: usize,
}

impl PatternSet {
    fn compile(patterns: &[String]) -> EngineResult<Self> {
        let mut names = GlobSetBuilder::new();
        let mut paths = GlobSetBuilder::new();

        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|source| EngineError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
            if has_separator(pattern) {
                paths.add(glob);
            } else {
                names.add(glob);
            }
        }

        let build = |builder: GlobSetBuilder| {
            builder.build().map_err(|source| EngineError::InvalidPattern {
                pattern: patterns.join(", "),
                source,
            })
        };

        Ok(PatternSet {
            names: build(names)?,
            paths: build(paths)?,
            len: patterns.len(),
        })
    }

    fn matches(&self, name: &str, rel_path: &str) -> bool {
        self.names.is_match(name) || self.paths.is_match(rel_path)
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn has_separator(pattern: &str) -> bool {
    pattern.contains('/') || pattern.contains(std::path::MAIN_SEPARATOR)
}

/// Decides which entries of a visited directory are skipped during a copy or
/// a hash run of a source.
#[derive(Debug, Clone)]
pub struct IgnoreFilter {
    root: PathBuf,
    blocklist: PatternSet,
    allowlist: PatternSet,
}

impl IgnoreFilter {
    /// Compile the filter for the source tree rooted at `root`.
    ///
    /// When `allowlist` is non-empty, files matching none of its patterns are
    /// skipped as well. Directories are only ever skipped by the blocklist.
    ///
    /// # Errors
    /// `EngineError::InvalidPattern` for a pattern that is not a valid glob.
    pub fn new(root: &Path, blocklist: &[String], allowlist: &[String]) -> EngineResult<Self> {
        Ok(IgnoreFilter {
            root: root.to_path_buf(),
            blocklist: PatternSet::compile(blocklist)?,
            allowlist: PatternSet::compile(allowlist)?,
        })
    }

    /// A filter that skips nothing.
    pub fn none(root: &Path) -> Self {
        let empty = PatternSet {
            names: GlobSet::empty(),
            paths: GlobSet::empty(),
            len: 0,
        };
        IgnoreFilter {
            root: root.to_path_buf(),
            blocklist: empty.clone(),
            allowlist: empty,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entries of `dir` that must be skipped, in the order of `names`.
    ///
    /// `dir` is the absolute path of the directory being visited; `names` are
    /// its immediate entries.
    pub fn ignored(&self, dir: &Path, names: &[String]) -> Vec<String> {
        if self.blocklist.is_empty() && self.allowlist.is_empty() {
            return Vec::new();
        }

        let rel_dir = self.relative_dir(dir);
        names
            .iter()
            .filter(|name| {
                let rel_path = if rel_dir.is_empty() {
                    (*name).clone()
                } else {
                    format!("{}/{}", rel_dir, name)
                };
                self.is_skipped(dir, name, &rel_path)
            })
            .cloned()
            .collect()
    }

    fn is_skipped(&self, dir: &Path, name: &str, rel_path: &str) -> bool {
        if self.blocklist.matches(name, rel_path) {
            return true;
        }
        if self.allowlist.is_empty() || dir.join(name).is_dir() {
            return false;
        }
        !self.allowlist.matches(name, rel_path)
    }

    /// `dir` relative to the root, `/`-separated; empty for the root itself.
    fn relative_dir(&self, dir: &Path) -> String {
        let rel = dir.strip_prefix(&self.root).unwrap_or(Path::new(""));
        rel.components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn scenario_filter() -> IgnoreFilter {
        IgnoreFilter::new(
            Path::new("/test/xyz/"),
            &strings(&["nom*", "bla/baz/foo*", "*bar*"]),
            &[],
        )
        .expect("Failed to compile filter")
    }

    #[test]
    fn test_blocklist_at_root() {
        let filter = scenario_filter();
        let ignored = filter.ignored(
            Path::new("/test/xyz"),
            &strings(&["nomde", "amnom", "foo", "foo/bar", "bla", "bla/foo", "bla/barbla"]),
        );
        assert_eq!(ignored, strings(&["nomde", "foo/bar", "bla/barbla"]));
    }

    #[test]
    fn test_blocklist_one_level_down() {
        let filter = scenario_filter();
        let ignored = filter.ignored(
            Path::new("/test/xyz/bla"),
            &strings(&["nomde", "foo", "foo/bar", "baz", "baz/foo", "bla/foo", "bla/barbla"]),
        );
        // name-only patterns apply at every depth
        assert_eq!(ignored, strings(&["nomde", "foo/bar", "baz/foo", "bla/barbla"]));
    }

    #[test]
    fn test_path_pattern_only_matches_its_directory() {
        let filter = scenario_filter();
        let names = strings(&[
            "nomde", "foo", "foo.js", "foo/bar", "baz", "baz/foo", "bla/foo", "bla/barbla",
        ]);

        let ignored = filter.ignored(Path::new("/test/xyz/bla/baz"), &names);
        assert_eq!(
            ignored,
            strings(&["nomde", "foo", "foo.js", "foo/bar", "bla/barbla"])
        );

        let ignored = filter.ignored(Path::new("/test/xyz/bla/baz/xer"), &names);
        assert_eq!(ignored, strings(&["nomde", "foo/bar", "bla/barbla"]));
    }

    #[test]
    fn test_empty_filter_skips_nothing() {
        let filter = IgnoreFilter::none(Path::new("/src"));
        assert!(filter
            .ignored(Path::new("/src"), &strings(&["a", "b"]))
            .is_empty());
        assert_eq!(filter.root(), Path::new("/src"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let result = IgnoreFilter::new(Path::new("/src"), &strings(&["[unclosed"]), &[]);
        assert!(matches!(result, Err(EngineError::InvalidPattern { .. })));
    }

    #[test]
    fn test_allowlist_skips_unlisted_files_but_keeps_directories() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        fs::create_dir(root.join("docs")).expect("Failed to create dir");
        fs::write(root.join("keep.txt"), "a").expect("Failed to write file");
        fs::write(root.join("drop.bin"), "b").expect("Failed to write file");

        let filter = IgnoreFilter::new(root, &strings(&["*.tmp"]), &strings(&["*.txt"]))
            .expect("Failed to compile filter");
        let ignored = filter.ignored(root, &strings(&["docs", "drop.bin", "keep.txt", "x.tmp"]));
        assert_eq!(ignored, strings(&["drop.bin", "x.tmp"]));
    }
}
