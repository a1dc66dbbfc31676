//! Checksum engine with a bounded, mtime-validated cache
//!
//! Every other component asks this engine for file digests: backups verify
//! artifacts with it, the deduplication store derives content addresses from
//! it, and the incremental and differential strategies use it for change
//! detection.
//!
//! ## Cache
//!
//! Records are cached by absolute path, up to `max_entries`, with FIFO
//! eviction. A cached record is served only while the file's modification
//! time and size are the ones observed when it was computed and the mtime is
//! not newer than the computation itself. Anything else evicts the entry and
//! the file is hashed again. [`ChecksumEngine::invalidate`] drops a single
//! entry, which the backup manager does after writing a restored file.
//!
//! ## Streaming
//!
//! Files are read in `buffer_size` chunks and fed to the digest. The whole
//! stream runs under `tokio::time::timeout`; when it expires the reader is
//! dropped and a [`ErrorCode::ChecksumTimeout`] error is returned.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use backstop::checksum::{ChecksumEngine, HashAlgorithm};
//! use backstop::config::{CacheConfig, ChecksumConfig};
//! use std::path::Path;
//!
//! # async fn demo() -> backstop::Result<()> {
//! let engine = ChecksumEngine::new(&ChecksumConfig::default(), &CacheConfig::default());
//! let record = engine.compute(Path::new("dist/app.css")).await?;
//! println!("{} {}", record.hex(), record.file_path.display());
//!
//! let outcome = engine.validate(Path::new("dist/app.css"), record.hex()).await;
//! assert!(outcome.is_valid);
//! # Ok(())
//! # }
//! ```

use crate::config::{CacheConfig, ChecksumConfig};
use crate::error::{BackstopError, ErrorCode, Result};
use crate::types::{ChecksumRecord, FileComparison, ValidationOutcome};
use crate::utils;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, trace};

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// MD5 (128 bit)
    Md5,
    /// SHA-1 (160 bit)
    Sha1,
    /// SHA-256 (256 bit)
    #[default]
    Sha256,
    /// SHA-512 (512 bit)
    Sha512,
}

impl HashAlgorithm {
    /// All supported algorithms
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Md5,
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha512,
    ];

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Algorithm whose hex digest has `len` characters
    pub fn from_hex_len(len: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.digest_len() * 2 == len)
    }

    /// Digest an in-memory buffer
    pub fn hash_bytes(&self, data: &[u8]) -> Vec<u8> {
        let mut state = DigestState::new(*self);
        state.update(data);
        state.finalize()
    }

    /// Hex digest of an in-memory buffer
    pub fn hash_hex(&self, data: &[u8]) -> String {
        hex::encode(self.hash_bytes(data))
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(BackstopError::config(format!("unknown hash algorithm: {}", other))),
        }
    }
}

/// Incremental digest over one of the supported algorithms
enum DigestState {
    Md5(md5::Md5),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl DigestState {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => DigestState::Md5(md5::Md5::new()),
            HashAlgorithm::Sha1 => DigestState::Sha1(sha1::Sha1::new()),
            HashAlgorithm::Sha256 => DigestState::Sha256(sha2::Sha256::new()),
            HashAlgorithm::Sha512 => DigestState::Sha512(sha2::Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            DigestState::Md5(h) => h.update(data),
            DigestState::Sha1(h) => h.update(data),
            DigestState::Sha256(h) => h.update(data),
            DigestState::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            DigestState::Md5(h) => h.finalize().to_vec(),
            DigestState::Sha1(h) => h.finalize().to_vec(),
            DigestState::Sha256(h) => h.finalize().to_vec(),
            DigestState::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Checksum a file is expected to have
///
/// A bare hex string is compared with the algorithm its length implies
/// (32 = md5, 40 = sha1, 64 = sha256, 128 = sha512), falling back to the
/// engine default. A full record is compared with its own algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedChecksum {
    /// Hex digest
    Hex(String),
    /// Previously computed record
    Record(ChecksumRecord),
}

impl ExpectedChecksum {
    fn algorithm(&self, default: HashAlgorithm) -> HashAlgorithm {
        match self {
            ExpectedChecksum::Record(r) => r.algorithm,
            ExpectedChecksum::Hex(h) => {
                let len = h.trim().len();
                if default.digest_len() * 2 == len {
                    default
                } else {
                    HashAlgorithm::from_hex_len(len).unwrap_or(default)
                }
            }
        }
    }

    fn hex(&self) -> String {
        match self {
            ExpectedChecksum::Hex(h) => h.trim().to_ascii_lowercase(),
            ExpectedChecksum::Record(r) => r.hex(),
        }
    }
}

impl From<String> for ExpectedChecksum {
    fn from(value: String) -> Self {
        ExpectedChecksum::Hex(value)
    }
}

impl From<&str> for ExpectedChecksum {
    fn from(value: &str) -> Self {
        ExpectedChecksum::Hex(value.to_string())
    }
}

impl From<ChecksumRecord> for ExpectedChecksum {
    fn from(value: ChecksumRecord) -> Self {
        ExpectedChecksum::Record(value)
    }
}

impl From<&ChecksumRecord> for ExpectedChecksum {
    fn from(value: &ChecksumRecord) -> Self {
        ExpectedChecksum::Record(value.clone())
    }
}

/// Checksum cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Cache is active
    pub enabled: bool,
    /// Entries currently cached
    pub entries: usize,
    /// Maximum entries
    pub capacity: usize,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that required hashing
    pub misses: u64,
    /// Entries dropped to respect the capacity
    pub evictions: u64,
    /// Entries dropped because the file changed or on request
    pub invalidations: u64,
}

impl CacheStats {
    /// hits / (hits + misses)
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

struct CacheEntry {
    record: ChecksumRecord,
    mtime: SystemTime,
    size: u64,
}

impl CacheEntry {
    fn is_fresh(&self, mtime: Option<SystemTime>, size: u64, algorithm: HashAlgorithm) -> bool {
        let Some(mtime) = mtime else {
            return false;
        };
        self.record.algorithm == algorithm
            && self.size == size
            && self.mtime == mtime
            && DateTime::<Utc>::from(mtime) <= self.record.computed_at
    }
}

/// FIFO-bounded record cache
struct ChecksumCache {
    entries: HashMap<PathBuf, CacheEntry>,
    order: VecDeque<PathBuf>,
    capacity: usize,
    stats: CacheStats,
}

impl ChecksumCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(4096)),
            order: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            stats: CacheStats {
                enabled: true,
                capacity,
                ..Default::default()
            },
        }
    }

    fn remove(&mut self, path: &Path) -> bool {
        if self.entries.remove(path).is_some() {
            self.order.retain(|p| p != path);
            true
        } else {
            false
        }
    }

    fn insert(&mut self, path: PathBuf, entry: CacheEntry) {
        if self.entries.insert(path.clone(), entry).is_some() {
            self.order.retain(|p| p != &path);
        }
        self.order.push_back(path);

        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                self.stats.evictions += 1;
                trace!("Evicted checksum for {:?}", oldest);
            }
        }
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats.clone()
        }
    }
}

/// Streaming checksum engine
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct ChecksumEngine {
    algorithm: HashAlgorithm,
    max_file_size: u64,
    timeout: Duration,
    buffer_size: usize,
    cache: Option<Mutex<ChecksumCache>>,
}

impl fmt::Debug for ChecksumEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChecksumEngine")
            .field("algorithm", &self.algorithm)
            .field("max_file_size", &self.max_file_size)
            .field("timeout", &self.timeout)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

impl ChecksumEngine {
    /// Create an engine from configuration
    pub fn new(config: &ChecksumConfig, cache: &CacheConfig) -> Self {
        let cache = (cache.enabled && cache.max_entries > 0)
            .then(|| Mutex::new(ChecksumCache::new(cache.max_entries)));

        Self {
            algorithm: config.algorithm,
            max_file_size: config.max_file_size,
            timeout: config.timeout,
            buffer_size: config.buffer_size.max(1),
            cache,
        }
    }

    /// Default algorithm
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash `path` with the default algorithm, consulting the cache
    pub async fn compute(&self, path: &Path) -> Result<ChecksumRecord> {
        self.compute_with(path, self.algorithm).await
    }

    /// Hash `path` with `algorithm`, consulting the cache
    ///
    /// # Errors
    ///
    /// [`BackstopError::Checksum`] with
    /// - [`ErrorCode::FileNotFound`] if the path does not exist
    /// - [`ErrorCode::NotAFile`] if it is not a regular file
    /// - [`ErrorCode::FileTooLarge`] above `max_file_size`
    /// - [`ErrorCode::ReadFailed`] on I/O failure
    /// - [`ErrorCode::ChecksumTimeout`] when streaming exceeds the timeout
    #[instrument(skip(self), level = "debug")]
    pub async fn compute_with(&self, path: &Path, algorithm: HashAlgorithm) -> Result<ChecksumRecord> {
        let abs = utils::absolute(path);

        let metadata = match self.stat(&abs).await {
            Ok(m) => m,
            Err(e) => {
                // A vanished file must not keep serving its old digest
                self.invalidate(&abs);
                return Err(e);
            }
        };

        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            let mtime = metadata.modified().ok();
            let cached = cache.entries.get(&abs).map(|entry| {
                entry
                    .is_fresh(mtime, metadata.len(), algorithm)
                    .then(|| entry.record.clone())
            });
            match cached {
                Some(Some(record)) => {
                    cache.stats.hits += 1;
                    trace!("Checksum cache hit for {:?}", abs);
                    return Ok(record);
                }
                Some(None) => {
                    cache.remove(&abs);
                    cache.stats.invalidations += 1;
                    cache.stats.misses += 1;
                    debug!("Checksum cache entry for {:?} is stale", abs);
                }
                None => cache.stats.misses += 1,
            }
        }

        let record = self.hash_file(&abs, algorithm, &metadata).await?;

        if let (Some(cache), Ok(mtime)) = (&self.cache, metadata.modified()) {
            cache.lock().insert(
                abs,
                CacheEntry {
                    record: record.clone(),
                    mtime,
                    size: metadata.len(),
                },
            );
        }

        Ok(record)
    }

    /// Hash `path` without reading or filling the cache
    ///
    /// Used for backup artifacts and restored files, which must always be
    /// re-read from disk.
    pub async fn compute_uncached(&self, path: &Path, algorithm: HashAlgorithm) -> Result<ChecksumRecord> {
        let abs = utils::absolute(path);
        let metadata = self.stat(&abs).await?;
        self.hash_file(&abs, algorithm, &metadata).await
    }

    async fn stat(&self, path: &Path) -> Result<std::fs::Metadata> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            let code = if e.kind() == std::io::ErrorKind::NotFound {
                ErrorCode::FileNotFound
            } else {
                ErrorCode::ReadFailed
            };
            BackstopError::checksum(code, path, "Cannot stat file").caused_by(e)
        })?;

        if !metadata.is_file() {
            return Err(BackstopError::checksum(
                ErrorCode::NotAFile,
                path,
                "Path is not a regular file",
            ));
        }
        Ok(metadata)
    }

    async fn hash_file(
        &self,
        path: &Path,
        algorithm: HashAlgorithm,
        metadata: &std::fs::Metadata,
    ) -> Result<ChecksumRecord> {
        let size = metadata.len();
        if self.max_file_size > 0 && size > self.max_file_size {
            return Err(BackstopError::checksum(
                ErrorCode::FileTooLarge,
                path,
                format!(
                    "File is {} bytes, limit is {}",
                    size, self.max_file_size
                ),
            ));
        }

        let start = Instant::now();
        let streamed = tokio::time::timeout(
            self.timeout,
            stream_digest(path, algorithm, self.buffer_size),
        )
        .await;

        let (hash, bytes) = match streamed {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                return Err(
                    BackstopError::checksum(ErrorCode::ReadFailed, path, "Cannot read file").caused_by(e),
                )
            }
            Err(_) => {
                return Err(BackstopError::checksum(
                    ErrorCode::ChecksumTimeout,
                    path,
                    format!(
                        "Hashing did not finish within {}",
                        humantime::format_duration(self.timeout)
                    ),
                ))
            }
        };

        let elapsed = start.elapsed();
        trace!("Hashed {:?} ({} bytes, {}) in {:?}", path, bytes, algorithm, elapsed);

        Ok(ChecksumRecord {
            hash,
            algorithm,
            file_size: bytes,
            file_path: path.to_path_buf(),
            computed_at: Utc::now(),
            compute_duration_ms: elapsed.as_millis() as u64,
        })
    }

    /// Validate `path` against an expected checksum
    ///
    /// Never fails: a mismatch or an unreadable file yields an outcome with
    /// `is_valid == false`.
    pub async fn validate(&self, path: &Path, expected: impl Into<ExpectedChecksum>) -> ValidationOutcome {
        let expected = expected.into();
        let algorithm = expected.algorithm(self.algorithm);
        let expected_hex = expected.hex();

        match self.compute_with(path, algorithm).await {
            Ok(record) => ValidationOutcome {
                file_path: record.file_path.clone(),
                is_valid: record.matches_hex(&expected_hex),
                expected: expected_hex,
                observed: Some(record.hex()),
                algorithm,
                error: None,
            },
            Err(e) => ValidationOutcome {
                file_path: path.to_path_buf(),
                is_valid: false,
                expected: expected_hex,
                observed: None,
                algorithm,
                error: Some(e.to_string()),
            },
        }
    }

    /// Validate many files concurrently, preserving input order
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::BatchValidationFailed`] if a validation task
    /// could not run to completion. Per-file problems are reported in the
    /// outcomes instead.
    pub async fn validate_batch(
        self: &Arc<Self>,
        items: Vec<(PathBuf, ExpectedChecksum)>,
        concurrency: usize,
    ) -> Result<Vec<ValidationOutcome>> {
        let total = items.len();
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, (path, expected)) in items.into_iter().enumerate() {
            let engine = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (index, engine.validate(&path, expected).await)
            });
        }

        let mut slots: Vec<Option<ValidationOutcome>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = joined.map_err(|e| {
                BackstopError::validation(
                    ErrorCode::BatchValidationFailed,
                    format!("Validation task of {} did not complete", total),
                )
                .caused_by(e)
            })?;
            slots[index] = Some(outcome);
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| {
                    BackstopError::validation(
                        ErrorCode::BatchValidationFailed,
                        "Validation task produced no outcome",
                    )
                })
            })
            .collect()
    }

    /// Compare two files by content
    ///
    /// Both files are hashed concurrently with the default algorithm.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ComparisonFailed`] if either file cannot be hashed; the
    /// checksum error is attached as the cause.
    pub async fn compare(&self, left: &Path, right: &Path) -> Result<FileComparison> {
        let (l, r) = tokio::join!(self.compute(left), self.compute(right));

        let wrap = |side: &Path, e: BackstopError| {
            BackstopError::Validation(
                crate::error::ErrorDetail::new(
                    ErrorCode::ComparisonFailed,
                    "Cannot compare files",
                )
                .with_path(side)
                .with_operation("compare")
                .with_cause(e),
            )
        };
        let left_record = l.map_err(|e| wrap(left, e))?;
        let right_record = r.map_err(|e| wrap(right, e))?;

        Ok(FileComparison {
            identical: left_record.hash == right_record.hash,
            left: left_record,
            right: right_record,
        })
    }

    /// Drop the cached record for `path`
    pub fn invalidate(&self, path: &Path) {
        if let Some(cache) = &self.cache {
            let abs = utils::absolute(path);
            let mut cache = cache.lock();
            if cache.remove(&abs) {
                cache.stats.invalidations += 1;
            }
        }
    }

    /// Drop every cached record
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            let dropped = cache.entries.len() as u64;
            cache.entries.clear();
            cache.order.clear();
            cache.stats.invalidations += dropped;
        }
    }

    /// Cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        match &self.cache {
            Some(cache) => cache.lock().snapshot(),
            None => CacheStats::default(),
        }
    }
}

async fn stream_digest(
    path: &Path,
    algorithm: HashAlgorithm,
    buffer_size: usize,
) -> std::io::Result<(Vec<u8>, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut state = DigestState::new(algorithm);
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        state.update(&buf[..n]);
        total += n as u64;
    }

    Ok((state.finalize(), total))
}
