//! Persisted backup state.
//!
//! This module defines the documents stored in the status file:
//! - BackupState: every staged source
//! - Source: a directory to back up, its hashing settings and targets
//! - Target: a destination of a source and its transfer/verification status
//!
//! Every object is written with a `version` and a `type` tag so the file can
//! evolve. Sources and targets are addressed by path or by alias.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checksums::ChecksumAlgorithm;
use crate::error::{EngineError, EngineResult};
use crate::fs_ops::{absolute_path, ensure_parent_dir_exists, unique_filename};

/// Version written into every persisted object.
pub const STATE_VERSION: u32 = 1;

const STATE_TYPE: &str = "BackupState";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ObjectTag {
    version: u32,
    #[serde(rename = "type")]
    kind: String,
}

impl ObjectTag {
    fn new(kind: &str) -> Self {
        ObjectTag {
            version: STATE_VERSION,
            kind: kind.to_string(),
        }
    }
}

/// Outcome of verifying a target against the source's hash file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedInfo {
    /// Files that could not be read on the target
    pub errors: u64,

    /// Files listed in the hash file but absent on the target
    pub missing: u64,

    /// Files whose checksum differs from the recorded one
    pub crc_errors: u64,

    /// Log listing every problem found
    pub log_file: PathBuf,
}

impl VerifiedInfo {
    /// True if no problem of any kind was found.
    pub fn is_clean(&self) -> bool {
        self.errors == 0 && self.missing == 0 && self.crc_errors == 0
    }
}

/// A destination directory of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(flatten)]
    tag: ObjectTag,

    /// Absolute destination directory
    pub path: PathBuf,

    /// Optional short name usable instead of the path
    pub alias: Option<String>,

    /// Set once the source has been copied here successfully
    pub transfered: bool,

    /// Whether the copy should be verified against the source hash file
    pub verify: bool,

    /// Result of the last verification, if any
    pub verified: Option<VerifiedInfo>,
}

impl Target {
    pub fn new(path: impl AsRef<Path>, alias: Option<String>, verify: bool) -> Self {
        Target {
            tag: ObjectTag::new("Target"),
            path: absolute_path(path.as_ref()),
            alias,
            transfered: false,
            verify,
            verified: None,
        }
    }

    /// True if `key` is this target's alias or (after normalization) its path.
    pub fn matches(&self, key: &str) -> bool {
        matches_key(&self.path, self.alias.as_deref(), key)
    }

    /// Names accepted by `get_field` and `set_field`.
    pub const FIELDS: &'static [&'static str] = &["path", "alias", "transfered", "verify"];

    pub fn get_field(&self, name: &str) -> EngineResult<String> {
        match name {
            "path" => Ok(self.path.display().to_string()),
            "alias" => Ok(display_option(self.alias.as_ref())),
            "transfered" => Ok(self.transfered.to_string()),
            "verify" => Ok(self.verify.to_string()),
            _ => Err(unknown_field(name)),
        }
    }

    /// Set a field from its string form. Only single values are accepted.
    pub fn set_field(&mut self, name: &str, values: &[String]) -> EngineResult<()> {
        let value = single_value(name, values)?;
        match name {
            "path" => self.path = absolute_path(Path::new(value)),
            "alias" => self.alias = optional_value(value),
            "transfered" => self.transfered = bool_from_str(value),
            "verify" => self.verify = bool_from_str(value),
            _ => return Err(unknown_field(name)),
        }
        Ok(())
    }

    /// "name = value" lines for every modifiable field.
    pub fn fields(&self) -> String {
        format_fields(Self::FIELDS, |name| self.get_field(name))
    }
}

/// A directory staged for backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(flatten)]
    tag: ObjectTag,

    /// Absolute source directory
    pub path: PathBuf,

    /// Optional short name usable instead of the path
    pub alias: Option<String>,

    /// Algorithm used when hashing this source
    pub hash_algorithm: ChecksumAlgorithm,

    /// Checksum file written by the last successful hash run
    pub hash_file: Option<PathBuf>,

    /// Log of the last successful hash run
    pub hash_log_file: Option<PathBuf>,

    /// Name the checksum file after the algorithm instead of `.cshd`
    pub force_single_hash: bool,

    /// Glob patterns; when non-empty only matching files are processed
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// Glob patterns of entries that are never processed
    #[serde(default)]
    pub blocklist: Vec<String>,

    /// Destinations, in the order they were added
    #[serde(default)]
    targets: Vec<Target>,
}

impl Source {
    pub fn new(
        path: impl AsRef<Path>,
        alias: Option<String>,
        hash_algorithm: ChecksumAlgorithm,
        force_single_hash: bool,
    ) -> Self {
        Source {
            tag: ObjectTag::new("Source"),
            path: absolute_path(path.as_ref()),
            alias,
            hash_algorithm,
            hash_file: None,
            hash_log_file: None,
            force_single_hash,
            allowlist: Vec::new(),
            blocklist: Vec::new(),
            targets: Vec::new(),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        matches_key(&self.path, self.alias.as_deref(), key)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Register a new destination.
    ///
    /// # Errors
    /// `EngineError::AlreadyExists` if the path or the alias is taken.
    pub fn add_target(&mut self, target: Target) -> EngineResult<()> {
        if self.targets.iter().any(|t| t.path == target.path) {
            return Err(EngineError::AlreadyExists {
                kind: "Target",
                key: target.path.display().to_string(),
            });
        }
        if let Some(alias) = &target.alias {
            if self.targets.iter().any(|t| t.alias.as_ref() == Some(alias)) {
                return Err(EngineError::AlreadyExists {
                    kind: "Alias",
                    key: alias.clone(),
                });
            }
        }
        self.targets.push(target);
        Ok(())
    }

    /// Look up a target by path or alias.
    pub fn get_target(&self, key: &str) -> EngineResult<&Target> {
        self.targets
            .iter()
            .find(|t| t.matches(key))
            .ok_or_else(|| target_not_found(key))
    }

    pub fn get_target_mut(&mut self, key: &str) -> EngineResult<&mut Target> {
        self.targets
            .iter_mut()
            .find(|t| t.matches(key))
            .ok_or_else(|| target_not_found(key))
    }

    /// Target with exactly this (absolute) path.
    pub(crate) fn target_by_path_mut(&mut self, path: &Path) -> Option<&mut Target> {
        self.targets.iter_mut().find(|t| t.path.as_path() == path)
    }

    pub const FIELDS: &'static [&'static str] = &[
        "path",
        "alias",
        "hash_algorithm",
        "hash_file",
        "hash_log_file",
        "force_single_hash",
        "allowlist",
        "blocklist",
    ];

    pub fn get_field(&self, name: &str) -> EngineResult<String> {
        match name {
            "path" => Ok(self.path.display().to_string()),
            "alias" => Ok(display_option(self.alias.as_ref())),
            "hash_algorithm" => Ok(self.hash_algorithm.to_string()),
            "hash_file" => Ok(display_option(self.hash_file.as_ref().map(|p| p.display()))),
            "hash_log_file" => Ok(display_option(
                self.hash_log_file.as_ref().map(|p| p.display()),
            )),
            "force_single_hash" => Ok(self.force_single_hash.to_string()),
            "allowlist" => Ok(format!("{:?}", self.allowlist)),
            "blocklist" => Ok(format!("{:?}", self.blocklist)),
            _ => Err(unknown_field(name)),
        }
    }

    /// Set a field from its string form. `allowlist` and `blocklist` take any
    /// number of values, every other field exactly one.
    pub fn set_field(&mut self, name: &str, values: &[String]) -> EngineResult<()> {
        match name {
            "allowlist" => {
                self.allowlist = values.to_vec();
                return Ok(());
            }
            "blocklist" => {
                self.blocklist = values.to_vec();
                return Ok(());
            }
            _ => {}
        }

        let value = single_value(name, values)?;
        match name {
            "path" => self.path = absolute_path(Path::new(value)),
            "alias" => self.alias = optional_value(value),
            "hash_algorithm" => {
                self.hash_algorithm =
                    ChecksumAlgorithm::from_name(value).ok_or_else(|| EngineError::InvalidField {
                        field: name.to_string(),
                        reason: format!("unknown hash algorithm '{}'", value),
                    })?
            }
            "hash_file" => self.hash_file = optional_value(value).map(PathBuf::from),
            "hash_log_file" => self.hash_log_file = optional_value(value).map(PathBuf::from),
            "force_single_hash" => self.force_single_hash = bool_from_str(value),
            _ => return Err(unknown_field(name)),
        }
        Ok(())
    }

    pub fn fields(&self) -> String {
        format_fields(Self::FIELDS, |name| self.get_field(name))
    }

    /// Pretty JSON of this source and its targets.
    pub fn status(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::State {
            path: self.path.clone(),
            source: e,
        })
    }
}

/// Every staged source; the root document of the status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupState {
    #[serde(flatten)]
    tag: ObjectTag,

    sources: Vec<Source>,
}

impl Default for BackupState {
    fn default() -> Self {
        BackupState {
            tag: ObjectTag::new(STATE_TYPE),
            sources: Vec::new(),
        }
    }
}

impl BackupState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the status file. A missing file yields an empty state.
    ///
    /// # Errors
    /// `ReadError` if the file exists but cannot be read, `State` if it is
    /// not a valid state document.
    pub fn load(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let contents = fs::read_to_string(path).map_err(|e| EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let state: BackupState =
            serde_json::from_str(&contents).map_err(|e| EngineError::State {
                path: path.to_path_buf(),
                source: e,
            })?;

        if state.tag.kind != STATE_TYPE {
            return Err(EngineError::State {
                path: path.to_path_buf(),
                source: serde::de::Error::custom(format!(
                    "expected document type '{}', found '{}'",
                    STATE_TYPE, state.tag.kind
                )),
            });
        }

        Ok(state)
    }

    /// Write the state to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> EngineResult<()> {
        ensure_parent_dir_exists(path)?;
        let json = serde_json::to_string_pretty(self).map_err(|e| EngineError::State {
            path: path.to_path_buf(),
            source: e,
        })?;
        fs::write(path, json).map_err(|e| EngineError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Save next to `path` as `<stem>_crash<ext>`, numbered if that exists.
    ///
    /// # Returns
    /// The path that was written.
    pub fn save_crash_copy(&self, path: &Path) -> EngineResult<PathBuf> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup_status".to_string());
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let crash_path = unique_filename(&path.with_file_name(format!("{}_crash{}", stem, ext)));
        self.save(&crash_path)?;
        Ok(crash_path)
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut [Source] {
        &mut self.sources
    }

    /// Stage a new source.
    ///
    /// # Errors
    /// `EngineError::AlreadyExists` if the path or the alias is taken.
    pub fn add_source(&mut self, source: Source) -> EngineResult<()> {
        if self.sources.iter().any(|s| s.path == source.path) {
            return Err(EngineError::AlreadyExists {
                kind: "Source",
                key: source.path.display().to_string(),
            });
        }
        if let Some(alias) = &source.alias {
            if self.sources.iter().any(|s| s.alias.as_ref() == Some(alias)) {
                return Err(EngineError::AlreadyExists {
                    kind: "Alias",
                    key: alias.clone(),
                });
            }
        }
        self.sources.push(source);
        Ok(())
    }

    /// Look up a source by path or alias.
    pub fn get_source(&self, key: &str) -> EngineResult<&Source> {
        self.sources
            .iter()
            .find(|s| s.matches(key))
            .ok_or_else(|| source_not_found(key))
    }

    pub fn get_source_mut(&mut self, key: &str) -> EngineResult<&mut Source> {
        self.sources
            .iter_mut()
            .find(|s| s.matches(key))
            .ok_or_else(|| source_not_found(key))
    }

    pub(crate) fn source_by_path_mut(&mut self, path: &Path) -> Option<&mut Source> {
        self.sources.iter_mut().find(|s| s.path.as_path() == path)
    }

    /// Status of every source, each preceded by a header line.
    pub fn status_all(&self) -> EngineResult<String> {
        let mut lines = Vec::new();
        for source in &self.sources {
            lines.push(format!("--- Source: {} ---", source.path.display()));
            lines.push(source.status()?);
        }
        Ok(lines.join("\n"))
    }
}

/// `y`, `yes`, `true` and `1` (any case) are true, everything else false.
pub fn bool_from_str(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "y" | "yes" | "true" | "1")
}

fn matches_key(path: &Path, alias: Option<&str>, key: &str) -> bool {
    alias == Some(key) || path == absolute_path(Path::new(key)).as_path()
}

fn single_value<'a>(name: &str, values: &'a [String]) -> EngineResult<&'a str> {
    match values {
        [value] => Ok(value.as_str()),
        _ => Err(EngineError::InvalidField {
            field: name.to_string(),
            reason: format!("expected exactly one value, got {}", values.len()),
        }),
    }
}

/// An empty value or `none` clears the field.
fn optional_value(value: &str) -> Option<String> {
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(value.to_string())
    }
}

fn display_option<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| "None".to_string(), |v| v.to_string())
}

fn format_fields<F>(names: &[&str], get: F) -> String
where
    F: Fn(&str) -> EngineResult<String>,
{
    names
        .iter()
        .filter_map(|name| get(name).ok().map(|value| format!("{} = {}", name, value)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn unknown_field(name: &str) -> EngineError {
    EngineError::InvalidField {
        field: name.to_string(),
        reason: "unknown field".to_string(),
    }
}

fn source_not_found(key: &str) -> EngineError {
    EngineError::NotFound {
        kind: "Source",
        key: key.to_string(),
    }
}

fn target_not_found(key: &str) -> EngineError {
    EngineError::NotFound {
        kind: "Target",
        key: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn sample_state(root: &Path) -> BackupState {
        let mut source = Source::new(
            root.join("photos"),
            Some("photos".to_string()),
            ChecksumAlgorithm::Sha512,
            false,
        );
        source.blocklist = strings(&["*.tmp"]);
        source
            .add_target(Target::new(root.join("backup1"), Some("b1".to_string()), true))
            .expect("Failed to add target");
        source
            .add_target(Target::new(root.join("backup2"), None, false))
            .expect("Failed to add target");

        let mut state = BackupState::new();
        state.add_source(source).expect("Failed to add source");
        state
    }

    #[test]
    fn test_paths_are_made_absolute() {
        let source = Source::new("some/./dir/..", None, ChecksumAlgorithm::Md5, false);
        let cwd = std::env::current_dir().expect("Failed to get cwd");
        assert_eq!(source.path, cwd.join("some"));
    }

    #[test]
    fn test_lookup_by_path_and_alias() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let state = sample_state(temp_dir.path());

        let by_alias = state.get_source("photos").expect("Alias lookup failed");
        let path_key = temp_dir.path().join("photos").display().to_string();
        let by_path = state.get_source(&path_key).expect("Path lookup failed");
        assert_eq!(by_alias, by_path);

        assert_eq!(
            by_alias.get_target("b1").expect("Target alias lookup failed").path,
            temp_dir.path().join("backup1")
        );
        assert!(matches!(
            state.get_source("videos"),
            Err(EngineError::NotFound { kind: "Source", .. })
        ));
        assert!(matches!(
            by_alias.get_target("b3"),
            Err(EngineError::NotFound { kind: "Target", .. })
        ));
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut state = sample_state(temp_dir.path());

        let same_path = Source::new(temp_dir.path().join("photos"), None, ChecksumAlgorithm::Md5, false);
        assert!(matches!(
            state.add_source(same_path),
            Err(EngineError::AlreadyExists { kind: "Source", .. })
        ));

        let same_alias = Source::new(
            temp_dir.path().join("other"),
            Some("photos".to_string()),
            ChecksumAlgorithm::Md5,
            false,
        );
        assert!(matches!(
            state.add_source(same_alias),
            Err(EngineError::AlreadyExists { kind: "Alias", .. })
        ));

        let source = state.get_source_mut("photos").expect("Lookup failed");
        assert!(matches!(
            source.add_target(Target::new(temp_dir.path().join("backup2"), None, true)),
            Err(EngineError::AlreadyExists { kind: "Target", .. })
        ));
        assert_eq!(source.targets().len(), 2);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut state = sample_state(temp_dir.path());
        {
            let target = state
                .get_source_mut("photos")
                .and_then(|s| s.get_target_mut("b1"))
                .expect("Lookup failed");
            target.transfered = true;
            target.verified = Some(VerifiedInfo {
                errors: 0,
                missing: 2,
                crc_errors: 1,
                log_file: temp_dir.path().join("verify.log"),
            });
        }

        let status_file = temp_dir.path().join("state").join("backup_status.json");
        state.save(&status_file).expect("Failed to save state");
        let loaded = BackupState::load(&status_file).expect("Failed to load state");
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_json_carries_type_tags() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let state = sample_state(temp_dir.path());
        let value = serde_json::to_value(&state).expect("Failed to serialize");

        assert_eq!(value["type"], "BackupState");
        assert_eq!(value["version"], 1);
        assert_eq!(value["sources"][0]["type"], "Source");
        assert_eq!(value["sources"][0]["hash_algorithm"], "sha512");
        assert_eq!(value["sources"][0]["targets"][1]["type"], "Target");
        assert_eq!(value["sources"][0]["targets"][1]["verified"], serde_json::Value::Null);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let state = BackupState::load(&temp_dir.path().join("none.json")).expect("Load failed");
        assert!(state.sources().is_empty());
    }

    #[test]
    fn test_load_rejects_garbage_and_wrong_type() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("state.json");

        fs::write(&path, "not json").expect("Failed to write file");
        assert!(matches!(BackupState::load(&path), Err(EngineError::State { .. })));

        fs::write(&path, r#"{"version": 1, "type": "Other", "sources": []}"#)
            .expect("Failed to write file");
        assert!(matches!(BackupState::load(&path), Err(EngineError::State { .. })));
    }

    #[test]
    fn test_crash_copies_are_numbered() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let state = sample_state(temp_dir.path());
        let status_file = temp_dir.path().join("backup_status.json");

        let first = state.save_crash_copy(&status_file).expect("Failed to save crash copy");
        let second = state.save_crash_copy(&status_file).expect("Failed to save crash copy");
        assert_eq!(first, temp_dir.path().join("backup_status_crash.json"));
        assert_eq!(second, temp_dir.path().join("backup_status_crash_0.json"));
        assert!(!status_file.exists());
    }

    #[test]
    fn test_set_source_fields() {
        let mut source = Source::new("/data", None, ChecksumAlgorithm::Sha512, false);

        source
            .set_field("hash_algorithm", &strings(&["md5"]))
            .expect("Failed to set algorithm");
        source
            .set_field("blocklist", &strings(&["*.tmp", "cache/*"]))
            .expect("Failed to set blocklist");
        source
            .set_field("force_single_hash", &strings(&["Yes"]))
            .expect("Failed to set flag");
        source.set_field("alias", &strings(&["d"])).expect("Failed to set alias");
        source.set_field("alias", &strings(&["none"])).expect("Failed to clear alias");

        assert_eq!(source.hash_algorithm, ChecksumAlgorithm::Md5);
        assert_eq!(source.blocklist, strings(&["*.tmp", "cache/*"]));
        assert!(source.force_single_hash);
        assert_eq!(source.alias, None);
        assert!(source.fields().contains("hash_algorithm = md5"));

        assert!(matches!(
            source.set_field("hash_algorithm", &strings(&["whirlpool"])),
            Err(EngineError::InvalidField { .. })
        ));
        assert!(matches!(
            source.set_field("alias", &strings(&["a", "b"])),
            Err(EngineError::InvalidField { .. })
        ));
        assert!(matches!(
            source.set_field("targets", &strings(&["x"])),
            Err(EngineError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_set_target_fields() {
        let mut target = Target::new("/backup", None, true);
        target
            .set_field("transfered", &strings(&["1"]))
            .expect("Failed to set transfered");
        target.set_field("verify", &strings(&["no"])).expect("Failed to set verify");

        assert!(target.transfered);
        assert!(!target.verify);
        assert_eq!(target.get_field("verify").expect("Failed to get"), "false");
        assert!(target.set_field("verified", &strings(&["x"])).is_err());
    }

    #[test]
    fn test_status_all_lists_sources() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let state = sample_state(temp_dir.path());
        let status = state.status_all().expect("Failed to render status");
        assert!(status.starts_with("--- Source: "));
        assert!(status.contains("\"alias\": \"b1\""));
    }
}
