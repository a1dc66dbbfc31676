//! Core data types shared across Backstop components
//!
//! ## Overview
//!
//! - **Integrity**: [`ChecksumRecord`], [`ValidationOutcome`], [`FileComparison`]
//! - **Backups**: [`BackupKind`], [`BackupRecord`], [`BackupArtifact`],
//!   [`RestoreResult`], [`CleanupStats`]
//! - **Progress**: [`ProgressInfo`]
//!
//! Records that are persisted or printed by the CLI derive `Serialize` with
//! camelCase keys so that JSON output is stable for external tooling.

use crate::checksum::HashAlgorithm;
use crate::compression::CompressionAlgorithm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Result of hashing one file
///
/// # Examples
///
/// ```rust
/// # use backstop::types::ChecksumRecord;
/// # use backstop::checksum::HashAlgorithm;
/// # use chrono::Utc;
/// # use std::path::PathBuf;
/// let record = ChecksumRecord {
///     hash: vec![0xde, 0xad, 0xbe, 0xef],
///     algorithm: HashAlgorithm::Sha256,
///     file_size: 4,
///     file_path: PathBuf::from("dist/app.css"),
///     computed_at: Utc::now(),
///     compute_duration_ms: 0,
/// };
/// assert_eq!(record.hex(), "deadbeef");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChecksumRecord {
    /// Raw digest bytes
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
    /// Digest algorithm
    pub algorithm: HashAlgorithm,
    /// File size at the time of hashing
    pub file_size: u64,
    /// Absolute path of the hashed file
    pub file_path: PathBuf,
    /// When the digest finished
    pub computed_at: DateTime<Utc>,
    /// How long streaming took
    pub compute_duration_ms: u64,
}

impl ChecksumRecord {
    /// Lowercase hex form of the digest
    pub fn hex(&self) -> String {
        hex::encode(&self.hash)
    }

    /// Whether `expected` (hex, any case) is this digest
    pub fn matches_hex(&self, expected: &str) -> bool {
        hex::decode(expected.trim())
            .map(|bytes| bytes == self.hash)
            .unwrap_or(false)
    }
}

/// Outcome of validating one file against an expected checksum
///
/// A mismatch and an unreadable file are both reported here rather than as
/// errors: `is_valid` is false and `error` explains an unreadable file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    /// File that was validated
    pub file_path: PathBuf,
    /// Digest matched
    pub is_valid: bool,
    /// Expected hex digest as supplied
    pub expected: String,
    /// Observed hex digest, when the file could be hashed
    pub observed: Option<String>,
    /// Algorithm used for the comparison
    pub algorithm: HashAlgorithm,
    /// Why the file could not be hashed
    pub error: Option<String>,
}

/// Result of comparing two files by content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileComparison {
    /// First file
    pub left: ChecksumRecord,
    /// Second file
    pub right: ChecksumRecord,
    /// Digests are equal
    pub identical: bool,
}

/// How a backup artifact stores its content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Verbatim copy
    Plain,
    /// Compressed stream
    Compressed,
    /// Reference into the deduplication store
    Deduplicated,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupKind::Plain => "plain",
            BackupKind::Compressed => "compressed",
            BackupKind::Deduplicated => "deduplicated",
        })
    }
}

/// Metadata of a backup that was written and verified
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// File that was backed up
    pub original_path: PathBuf,
    /// Artifact written in the backup directory
    pub backup_path: PathBuf,
    /// When the artifact was created
    pub created_at: DateTime<Utc>,
    /// Storage form
    pub kind: BackupKind,
    /// Size of the source file
    pub original_size: u64,
    /// Bytes the artifact occupies (blob size for deduplicated backups)
    pub stored_size: u64,
    /// Codec, for compressed artifacts
    pub compression: Option<CompressionAlgorithm>,
    /// original / stored, for compressed artifacts
    pub compression_ratio: Option<f64>,
    /// Hex digest of the source content
    pub content_hash: String,
    /// Algorithm of `content_hash`
    pub algorithm: HashAlgorithm,
    /// References to the blob after this backup, for deduplicated artifacts
    pub dedup_reference_count: Option<u64>,
    /// Whether the backup was written and verified
    pub success: bool,
    /// Failure description for unsuccessful records (batch results only)
    pub error: Option<String>,
}

/// Backup artifact found in the backup directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifact {
    /// Artifact path
    pub path: PathBuf,
    /// File name of the original file
    pub original_name: String,
    /// Timestamp encoded in the artifact name
    pub created_at: DateTime<Utc>,
    /// Storage form
    pub kind: BackupKind,
    /// Codec, for compressed artifacts
    pub compression: Option<CompressionAlgorithm>,
    /// Artifact size on disk
    pub size: u64,
}

/// Result of restoring a file from a backup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    /// File that was overwritten
    pub target_path: PathBuf,
    /// Artifact the content came from
    pub backup_path: PathBuf,
    /// Storage form of the artifact
    pub kind: BackupKind,
    /// Bytes written to the target
    pub bytes_written: u64,
    /// Restored content was re-hashed and matched
    pub integrity_verified: bool,
    /// Plain copy of the pre-restore content, if one was taken
    pub safety_backup_path: Option<PathBuf>,
    /// Wall time of the restore
    pub duration_ms: u64,
    /// Non-fatal problems (e.g. the safety backup could not be written)
    pub warnings: Vec<String>,
}

/// Summary of a retention cleanup pass
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupStats {
    /// Entries inspected
    pub scanned: usize,
    /// Artifacts deleted
    pub deleted: usize,
    /// Artifacts within the retention period
    pub kept: usize,
    /// Files that do not follow the artifact naming convention
    pub skipped: usize,
    /// Bytes freed, including released deduplication blobs
    pub bytes_reclaimed: u64,
    /// Per-file failures that did not stop the pass
    pub errors: Vec<String>,
}

/// Snapshot emitted to progress listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressInfo {
    /// Files finished so far (never decreases within a run)
    pub processed: usize,
    /// Files in the run
    pub total: usize,
    /// processed / total as 0-100
    pub percentage: f64,
    /// Files per second since the run started
    pub rate: f64,
    /// Estimated time remaining, once a rate is known
    pub eta: Option<Duration>,
    /// Index of the batch being processed
    pub current_batch: usize,
    /// Size of the batch being processed
    pub batch_size: usize,
}

impl ProgressInfo {
    /// Build a snapshot from counters and elapsed time
    pub fn new(
        processed: usize,
        total: usize,
        elapsed: Duration,
        current_batch: usize,
        batch_size: usize,
    ) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            processed as f64 * 100.0 / total as f64
        };
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 { processed as f64 / secs } else { 0.0 };
        let eta = if rate > 0.0 {
            Some(Duration::from_secs_f64(
                total.saturating_sub(processed) as f64 / rate,
            ))
        } else {
            None
        };

        Self {
            processed,
            total,
            percentage,
            rate,
            eta,
            current_batch,
            batch_size,
        }
    }

    /// Whether every file has been processed
    pub fn is_complete(&self) -> bool {
        self.processed >= self.total
    }
}

/// Serde adapter storing digests as hex strings
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}
