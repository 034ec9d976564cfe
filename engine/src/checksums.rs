//! Checksum computation and checksum files.
//!
//! This module provides:
//! - Multiple checksum algorithms (CRC32, MD5, SHA-256, SHA-512, BLAKE3)
//! - File-level checksum computation
//! - Writing and parsing the checksum files created when a source is hashed

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// First line of every checksum file written by this tool.
pub const CHECKSUM_FILE_HEADER: &str = "; Checksum file generated by backup-helper";

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC32 (fast, 32-bit)
    Crc32,
    /// MD5 (deprecated, but included for compatibility)
    Md5,
    /// SHA-256 (cryptographic, 256-bit)
    Sha256,
    /// SHA-512 (cryptographic, 512-bit)
    #[default]
    Sha512,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32 => write!(f, "crc32"),
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl ChecksumAlgorithm {
    /// Parse algorithm from its name, case-insensitive
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "crc32" => Some(Self::Crc32),
            "md5" => Some(Self::Md5),
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Incremental hasher behind every algorithm
trait ChecksumHasher {
    fn update(&mut self, data: &[u8]);

    fn finalize(self: Box<Self>) -> ChecksumValue;
}

/// CRC32 hasher
struct Crc32Hasher {
    crc: u32,
}

impl ChecksumHasher for Crc32Hasher {
    fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let mut crc = self.crc ^ byte as u32;
            for _ in 0..8 {
                crc = if crc & 1 == 1 {
                    (crc >> 1) ^ 0xedb88320
                } else {
                    crc >> 1
                };
            }
            self.crc = crc;
        }
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        ChecksumValue::new(
            ChecksumAlgorithm::Crc32,
            format!("{:08x}", self.crc ^ 0xffffffff),
        )
    }
}

struct Md5Hasher {
    context: md5::Context,
}

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", self.context.compute()))
    }
}

/// SHA-2 family hasher (backed by sha2 crate)
struct Sha2Hasher<D> {
    algorithm: ChecksumAlgorithm,
    hasher: D,
}

impl<D> ChecksumHasher for Sha2Hasher<D>
where
    D: sha2::Digest,
{
    fn update(&mut self, data: &[u8]) {
        sha2::Digest::update(&mut self.hasher, data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        ChecksumValue::new(self.algorithm, hex)
    }
}

struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        ChecksumValue::new(
            ChecksumAlgorithm::Blake3,
            self.hasher.finalize().to_hex().to_string(),
        )
    }
}

fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Crc32 => Box::new(Crc32Hasher { crc: 0xffffffff }),
        ChecksumAlgorithm::Md5 => Box::new(Md5Hasher {
            context: md5::Context::new(),
        }),
        ChecksumAlgorithm::Sha256 => Box::new(Sha2Hasher {
            algorithm,
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Sha512 => Box::new(Sha2Hasher {
            algorithm,
            hasher: sha2::Sha512::default(),
        }),
        ChecksumAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
    }
}

/// Compute checksum of in-memory data
pub fn compute_checksum(data: &[u8], algorithm: ChecksumAlgorithm) -> ChecksumValue {
    let mut hasher = create_hasher(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute checksum for a file
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> EngineResult<ChecksumValue> {
    let mut file = File::open(path).map_err(|e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut hasher = create_hasher(algorithm);
    let mut buffer = vec![0u8; 65536];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) => {
                return Err(EngineError::ReadError {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }
    }

    Ok(hasher.finalize())
}

/// Generate a checksum file for multiple files
///
/// Format: "<hex_checksum> <relative_path>" per line, relative paths use `/`
pub fn generate_checksum_file(
    file_checksums: &[(String, ChecksumValue)],
    algorithm: ChecksumAlgorithm,
) -> String {
    let mut result = String::new();

    result.push_str(CHECKSUM_FILE_HEADER);
    result.push('\n');
    result.push_str(&format!("; Algorithm: {}\n", algorithm));
    result.push('\n');

    for (rel_path, checksum) in file_checksums {
        result.push_str(&format!("{} {}\n", checksum.hex(), rel_path));
    }

    result
}

/// A parsed checksum file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumFile {
    pub algorithm: ChecksumAlgorithm,
    /// (relative_path, expected hex)
    pub entries: Vec<(String, String)>,
}

/// Parse a checksum file written by `generate_checksum_file`.
///
/// # Errors
/// `EngineError::Hash` if the algorithm header is missing or unknown.
pub fn parse_checksum_file(path: &Path, content: &str) -> EngineResult<ChecksumFile> {
    let mut algorithm = None;
    let mut entries = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix(';') {
            if let Some(name) = comment.trim().strip_prefix("Algorithm:") {
                algorithm = ChecksumAlgorithm::from_name(name.trim());
            }
            continue;
        }

        // "hex path", the path may contain spaces
        if let Some((hex, rel_path)) = line.split_once(' ') {
            entries.push((rel_path.to_string(), hex.to_string()));
        }
    }

    let algorithm = algorithm.ok_or_else(|| EngineError::Hash {
        path: path.to_path_buf(),
        reason: "checksum file has no known algorithm header".to_string(),
    })?;

    Ok(ChecksumFile { algorithm, entries })
}
