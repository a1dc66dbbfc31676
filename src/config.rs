//! Engine configuration
//!
//! [`BackstopConfig`] is a strongly typed tree of settings with explicit
//! defaults. It can be built in code (usually through
//! [`BackstopBuilder`](crate::BackstopBuilder)) or loaded from a JSON document.
//! Unknown keys are rejected while parsing and out-of-range values are rejected
//! by [`BackstopConfig::validate`], so a bad configuration fails at
//! construction rather than at first use.
//!
//! ## Example document
//!
//! ```json
//! {
//!   "root": "./project",
//!   "checksum": { "algorithm": "sha256", "timeout": "30s" },
//!   "compression": { "algorithm": "brotli", "level": 9, "threshold": 2048 },
//!   "deduplication": { "enabled": true },
//!   "incremental": { "enabled": true, "max_chain_length": 5 }
//! }
//! ```
//!
//! Durations are written in humantime notation (`"500ms"`, `"30s"`, `"7days"`).
//! Relative directories are resolved against `root`.

use crate::checksum::HashAlgorithm;
use crate::compression::CompressionAlgorithm;
use crate::error::{BackstopError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct BackstopConfig {
    /// Base directory that relative directories are resolved against
    pub root: PathBuf,
    /// Checksum engine settings
    pub checksum: ChecksumConfig,
    /// Checksum cache settings
    pub cache: CacheConfig,
    /// Backup/restore settings
    pub backup: BackupConfig,
    /// Compression codec settings
    pub compression: CompressionConfig,
    /// Deduplication store settings
    pub deduplication: DeduplicationConfig,
    /// Incremental chain settings
    pub incremental: IncrementalConfig,
    /// Differential backup settings
    pub differential: DifferentialConfig,
    /// Batch optimizer settings
    pub batch: BatchConfig,
}

impl Default for BackstopConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            checksum: ChecksumConfig::default(),
            cache: CacheConfig::default(),
            backup: BackupConfig::default(),
            compression: CompressionConfig::default(),
            deduplication: DeduplicationConfig::default(),
            incremental: IncrementalConfig::default(),
            differential: DifferentialConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

/// Checksum engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ChecksumConfig {
    /// Default digest
    pub algorithm: HashAlgorithm,
    /// Largest file that will be hashed, in bytes (0 = unlimited)
    pub max_file_size: u64,
    /// Abort hashing a single file after this long
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Read buffer used while streaming
    pub buffer_size: usize,
}

impl Default for ChecksumConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            max_file_size: 100 * 1024 * 1024,
            timeout: Duration::from_secs(30),
            buffer_size: 64 * 1024,
        }
    }
}

/// Checksum cache settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    /// Whether checksum records are cached
    pub enabled: bool,
    /// Entries kept before the oldest is evicted
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
        }
    }
}

/// Which storage form wins when both deduplication and compression apply
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoragePolicy {
    /// Deduplicate eligible files, compress the rest
    #[default]
    DeduplicationFirst,
    /// Compress eligible files, deduplicate the rest
    CompressionFirst,
}

/// Backup/restore settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct BackupConfig {
    /// Whether backups may be created
    pub enabled: bool,
    /// Where artifacts are written
    pub directory: PathBuf,
    /// Artifacts older than this many days are removed by cleanup
    pub retention_days: u32,
    /// Re-hash restored files and roll back on mismatch
    pub verify_after_rollback: bool,
    /// Precedence between deduplication and compression
    pub storage_policy: StoragePolicy,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(".backups"),
            retention_days: 30,
            verify_after_rollback: true,
            storage_policy: StoragePolicy::DeduplicationFirst,
        }
    }
}

/// Compression codec settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CompressionConfig {
    /// Whether artifacts may be compressed
    pub enabled: bool,
    /// Codec used for new artifacts
    pub algorithm: CompressionAlgorithm,
    /// Codec-specific level (0-9 for gzip/deflate, 0-11 for brotli)
    pub level: u32,
    /// Files smaller than this are stored plain
    pub threshold: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: CompressionAlgorithm::Gzip,
            level: 6,
            threshold: 1024,
        }
    }
}

/// Deduplication store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct DeduplicationConfig {
    /// Whether content-addressable storage is used
    pub enabled: bool,
    /// Store root, holding `dedup-index.json` and the blobs
    pub directory: PathBuf,
    /// Digest used as the content address
    pub algorithm: HashAlgorithm,
    /// Files smaller than this are never deduplicated
    pub threshold: u64,
    /// Materialize duplicates as hard links when the filesystem allows it
    pub prefer_hard_links: bool,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from(".backups/dedup"),
            algorithm: HashAlgorithm::Sha256,
            threshold: 1024,
            prefer_hard_links: true,
        }
    }
}

/// How a file is judged changed since its last recorded backup
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDetection {
    /// Modification time or size differs
    Mtime,
    /// Content checksum differs
    Checksum,
    /// Unchanged mtime and size short-circuit; otherwise the checksum decides
    #[default]
    Hybrid,
}

/// Incremental chain settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct IncrementalConfig {
    /// Whether incremental backups are available
    pub enabled: bool,
    /// Where `incremental-index.json` lives
    pub directory: PathBuf,
    /// Change detection method
    pub change_detection: ChangeDetection,
    /// Longest chain (full backup included) before a new full backup is forced
    pub max_chain_length: usize,
    /// A chain whose full backup is older than this restarts with a full backup
    #[serde(with = "duration_str")]
    pub full_backup_interval: Duration,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from(".backups/incremental"),
            change_detection: ChangeDetection::Hybrid,
            max_chain_length: 10,
            full_backup_interval: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Differential backup settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct DifferentialConfig {
    /// Whether differential backups are available
    pub enabled: bool,
    /// Where `differential-index.json` lives
    pub directory: PathBuf,
    /// Change detection method against the full backup
    pub change_detection: ChangeDetection,
    /// Differentials taken before a full backup is recommended
    pub full_backup_threshold: usize,
    /// Full backups older than this trigger a recommendation
    #[serde(with = "duration_str")]
    pub full_backup_interval: Duration,
    /// Cumulative size above `base size * multiplier` triggers a recommendation
    pub size_multiplier: f64,
    /// Turn a recommendation into a forced full backup on the next change
    pub auto_promote: bool,
}

impl Default for DifferentialConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from(".backups/differential"),
            change_detection: ChangeDetection::Hybrid,
            full_backup_threshold: 10,
            full_backup_interval: Duration::from_secs(7 * 24 * 60 * 60),
            size_multiplier: 0.5,
            auto_promote: false,
        }
    }
}

/// How files inside a batch are scheduled
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// One file at a time
    Sequential,
    /// All files of a batch concurrently, bounded by `max_concurrency`
    Parallel,
    /// Parallel, resizing the next batch from system metrics
    #[default]
    Adaptive,
}

/// Batch optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct BatchConfig {
    /// Whether files are partitioned into batches at all
    pub enabled: bool,
    /// Initial batch size
    pub batch_size: usize,
    /// Lower bound for dynamic sizing
    pub min_batch_size: usize,
    /// Upper bound for dynamic sizing
    pub max_batch_size: usize,
    /// Let the adaptive strategy resize batches
    pub dynamic_sizing: bool,
    /// Scheduling strategy
    pub strategy: BatchStrategy,
    /// Files processed concurrently within a batch
    pub max_concurrency: usize,
    /// Resident memory above which batches shrink
    pub memory_threshold_bytes: u64,
    /// Load average per core above which batches shrink
    pub cpu_threshold: f64,
    /// Scheduler lag above which batches shrink
    #[serde(with = "duration_str")]
    pub lag_threshold: Duration,
    /// Minimum time between progress events
    #[serde(with = "duration_str")]
    pub progress_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 50,
            min_batch_size: 10,
            max_batch_size: 500,
            dynamic_sizing: true,
            strategy: BatchStrategy::Adaptive,
            max_concurrency: num_cpus::get().max(1),
            memory_threshold_bytes: 512 * 1024 * 1024,
            cpu_threshold: 0.8,
            lag_threshold: Duration::from_millis(100),
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl BackstopConfig {
    /// Parse a JSON document and validate it
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BackstopError::config(format!("cannot parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check every value against its allowed range
    pub fn validate(&self) -> Result<()> {
        if self.checksum.timeout.is_zero() {
            return Err(BackstopError::config("checksum.timeout must be greater than zero"));
        }
        if self.checksum.buffer_size == 0 {
            return Err(BackstopError::config("checksum.buffer_size must be greater than zero"));
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(BackstopError::config(
                "cache.max_entries must be greater than zero when the cache is enabled",
            ));
        }
        if self.backup.directory.as_os_str().is_empty() {
            return Err(BackstopError::config("backup.directory must not be empty"));
        }
        self.compression
            .algorithm
            .validate_level(self.compression.level)?;
        if self.deduplication.enabled && self.deduplication.directory.as_os_str().is_empty() {
            return Err(BackstopError::config("deduplication.directory must not be empty"));
        }
        if self.incremental.max_chain_length == 0 {
            return Err(BackstopError::config(
                "incremental.max_chain_length must be at least 1",
            ));
        }
        if !(self.differential.size_multiplier > 0.0) || !self.differential.size_multiplier.is_finite() {
            return Err(BackstopError::config(format!(
                "differential.size_multiplier must be a positive number, got {}",
                self.differential.size_multiplier
            )));
        }
        if self.differential.full_backup_threshold == 0 {
            return Err(BackstopError::config(
                "differential.full_backup_threshold must be at least 1",
            ));
        }
        let batch = &self.batch;
        if batch.min_batch_size == 0 {
            return Err(BackstopError::config("batch.min_batch_size must be at least 1"));
        }
        if batch.min_batch_size > batch.max_batch_size {
            return Err(BackstopError::config(format!(
                "batch.min_batch_size ({}) exceeds batch.max_batch_size ({})",
                batch.min_batch_size, batch.max_batch_size
            )));
        }
        if batch.batch_size < batch.min_batch_size || batch.batch_size > batch.max_batch_size {
            return Err(BackstopError::config(format!(
                "batch.batch_size ({}) must lie within [{}, {}]",
                batch.batch_size, batch.min_batch_size, batch.max_batch_size
            )));
        }
        if batch.max_concurrency == 0 {
            return Err(BackstopError::config("batch.max_concurrency must be at least 1"));
        }
        if !(batch.cpu_threshold > 0.0) || !batch.cpu_threshold.is_finite() {
            return Err(BackstopError::config("batch.cpu_threshold must be a positive number"));
        }
        if batch.memory_threshold_bytes == 0 {
            return Err(BackstopError::config(
                "batch.memory_threshold_bytes must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Resolve a configured directory against `root`
    pub fn resolve(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.root.join(dir)
        }
    }

    /// Absolute-or-root-relative backup directory
    pub fn backup_directory(&self) -> PathBuf {
        self.resolve(&self.backup.directory)
    }

    /// Absolute-or-root-relative deduplication directory
    pub fn deduplication_directory(&self) -> PathBuf {
        self.resolve(&self.deduplication.directory)
    }

    /// Absolute-or-root-relative incremental index directory
    pub fn incremental_directory(&self) -> PathBuf {
        self.resolve(&self.incremental.directory)
    }

    /// Absolute-or-root-relative differential index directory
    pub fn differential_directory(&self) -> PathBuf {
        self.resolve(&self.differential.directory)
    }
}

/// Serde adapter for humantime duration strings
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
