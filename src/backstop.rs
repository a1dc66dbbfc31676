//! Main Backstop implementation
//!
//! This module provides the [`Backstop`] struct, the entry point for every
//! integrity and backup operation, and [`BackstopBuilder`] to configure it.
//!
//! ## Overview
//!
//! A `Backstop` instance owns the engine components and wires them together:
//!
//! - **Checksum Engine**: hashes files and caches the results
//! - **Backup Manager**: writes, verifies, restores and expires backups
//! - **Deduplication Store**: content-addressable blobs (when enabled)
//! - **Incremental/Differential Strategies**: decide whether a backup is
//!   needed and track chains (when enabled)
//! - **Batch Optimizer**: drives the above over large file sets
//!
//! There is no global state; every caller constructs (or is handed) its own
//! instance. All operations take `&self` and are safe to call concurrently.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use backstop::BackstopBuilder;
//!
//! # async fn run() -> backstop::Result<()> {
//! let backstop = BackstopBuilder::new()
//!     .root("./site")
//!     .deduplication(true)
//!     .build()
//!     .await?;
//!
//! let record = backstop.create_backup("./site/styles/app.css".as_ref()).await?;
//! // ... rewrite app.css ...
//! let restored = backstop
//!     .restore_from_backup("./site/styles/app.css".as_ref(), &record.backup_path)
//!     .await?;
//! assert!(restored.integrity_verified);
//! # Ok(())
//! # }
//! ```

use crate::backup::BackupManager;
use crate::batch::{BatchOperation, BatchOptimizer, BatchOptions, BatchResult, LargeProjectStats};
use crate::checksum::{CacheStats, ChecksumEngine, ExpectedChecksum, HashAlgorithm};
use crate::compression::{CompressionAlgorithm, CompressionStats};
use crate::config::{BackstopConfig, StoragePolicy};
use crate::dedup::{DeduplicationResult, DeduplicationStats, DeduplicationStore};
use crate::differential::{DifferentialBackupResult, DifferentialStats, DifferentialStrategy};
use crate::error::{BackstopError, Result};
use crate::incremental::{IncrementalBackupResult, IncrementalStats, IncrementalStrategy};
use crate::progress::{ListenerId, ProgressRegistry};
use crate::types::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};

/// File integrity and backup engine
///
/// Built with [`BackstopBuilder`] or [`Backstop::new`].
#[derive(Debug)]
pub struct Backstop {
    config: BackstopConfig,
    checksum: Arc<ChecksumEngine>,
    backups: Arc<BackupManager>,
    dedup: Option<Arc<DeduplicationStore>>,
    incremental: Option<IncrementalStrategy>,
    differential: Option<DifferentialStrategy>,
    batch: BatchOptimizer,
    progress: Arc<ProgressRegistry>,
}

impl Backstop {
    /// Create an engine from a configuration
    ///
    /// Validates the configuration, opens the deduplication store and the
    /// strategy indexes of enabled components.
    ///
    /// # Errors
    ///
    /// - [`BackstopError::InvalidConfiguration`] for out-of-range values
    /// - [`BackstopError::Io`] if a store directory cannot be created
    #[instrument(skip(config), fields(root = %config.root.display()))]
    pub async fn new(config: BackstopConfig) -> Result<Self> {
        config.validate()?;

        let checksum = Arc::new(ChecksumEngine::new(&config.checksum, &config.cache));
        let dedup = if config.deduplication.enabled {
            Some(Arc::new(
                DeduplicationStore::open(
                    config.deduplication_directory(),
                    &config.deduplication,
                    Arc::clone(&checksum),
                )
                .await?,
            ))
        } else {
            None
        };
        let backups = Arc::new(BackupManager::new(&config, Arc::clone(&checksum), dedup.clone())?);

        let incremental = if config.incremental.enabled {
            Some(IncrementalStrategy::open(&config, Arc::clone(&checksum), Arc::clone(&backups)).await?)
        } else {
            None
        };
        let differential = if config.differential.enabled {
            Some(DifferentialStrategy::open(&config, Arc::clone(&checksum), Arc::clone(&backups)).await?)
        } else {
            None
        };

        let progress = Arc::new(ProgressRegistry::new());
        let batch = BatchOptimizer::new(
            config.batch.clone(),
            Arc::clone(&checksum),
            Arc::clone(&backups),
            Arc::clone(&progress),
        );

        info!(
            "Backstop ready at {:?} ({}, backups {:?})",
            config.root,
            config.checksum.algorithm,
            backups.directory()
        );

        Ok(Self {
            config,
            checksum,
            backups,
            dedup,
            incremental,
            differential,
            batch,
            progress,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &BackstopConfig {
        &self.config
    }

    /// Checksum of `path` with the configured algorithm
    ///
    /// # Errors
    ///
    /// [`BackstopError::Checksum`] if the file is missing, not a regular file,
    /// too large, unreadable or takes longer than the configured timeout.
    pub async fn calculate_checksum(&self, path: &Path) -> Result<ChecksumRecord> {
        self.checksum.compute(path).await
    }

    /// Checksum of `path` with a specific algorithm
    pub async fn calculate_checksum_with(&self, path: &Path, algorithm: HashAlgorithm) -> Result<ChecksumRecord> {
        self.checksum.compute_with(path, algorithm).await
    }

    /// Validate `path` against a hex digest or a previous record
    ///
    /// Never fails; problems are reported in the outcome.
    pub async fn validate_file(&self, path: &Path, expected: impl Into<ExpectedChecksum>) -> ValidationOutcome {
        self.checksum.validate(path, expected).await
    }

    /// Validate many files concurrently, one outcome per item in input order
    pub async fn validate_batch(&self, items: Vec<(PathBuf, ExpectedChecksum)>) -> Result<Vec<ValidationOutcome>> {
        self.checksum
            .validate_batch(items, self.config.batch.max_concurrency)
            .await
    }

    /// Compare two files by content
    pub async fn compare_files(&self, left: &Path, right: &Path) -> Result<FileComparison> {
        self.checksum.compare(left, right).await
    }

    /// Drop the cached checksum of `path`
    pub fn invalidate_checksum(&self, path: &Path) {
        self.checksum.invalidate(path);
    }

    /// Back up `path`
    ///
    /// # Errors
    ///
    /// [`BackstopError::InvalidConfiguration`] when backups are disabled;
    /// otherwise see [`BackupManager::create_backup`].
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn create_backup(&self, path: &Path) -> Result<BackupRecord> {
        if !self.config.backup.enabled {
            return Err(BackstopError::config("backups are disabled (backup.enabled = false)"));
        }
        self.backups.create_backup(path).await
    }

    /// Restore `target` from a backup artifact
    ///
    /// See [`BackupManager::restore_from_backup`].
    #[instrument(skip(self), fields(target = %target.display()))]
    pub async fn restore_from_backup(&self, target: &Path, artifact: &Path) -> Result<RestoreResult> {
        self.backups.restore_from_backup(target, artifact).await
    }

    /// Delete artifacts older than the retention period
    #[instrument(skip(self))]
    pub async fn cleanup_backups(&self) -> Result<CleanupStats> {
        self.backups.cleanup_backups().await
    }

    /// Backup artifacts, newest first, optionally only those of `original`
    pub async fn list_backups(&self, original: Option<&Path>) -> Result<Vec<BackupArtifact>> {
        self.backups.list_backups(original).await
    }

    /// Store the content of `path` in the deduplication store
    ///
    /// A duplicate is replaced in place by a link to (or copy of) the stored
    /// blob.
    ///
    /// # Errors
    ///
    /// [`BackstopError::InvalidConfiguration`] when deduplication is disabled.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn deduplicate_file(&self, path: &Path) -> Result<DeduplicationResult> {
        self.dedup_store()?.deduplicate(path).await
    }

    /// Back up `path` if it changed since its last incremental backup
    ///
    /// # Errors
    ///
    /// [`BackstopError::InvalidConfiguration`] when incremental backups are
    /// disabled; otherwise see [`IncrementalStrategy::create_backup`].
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn create_incremental_backup(&self, path: &Path) -> Result<IncrementalBackupResult> {
        self.incremental
            .as_ref()
            .ok_or_else(|| BackstopError::config("incremental backups are disabled (incremental.enabled = false)"))?
            .create_backup(path)
            .await
    }

    /// Back up `path` relative to its latest full backup
    ///
    /// # Errors
    ///
    /// [`BackstopError::InvalidConfiguration`] when differential backups are
    /// disabled; otherwise see [`DifferentialStrategy::create_backup`].
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn create_differential_backup(&self, path: &Path) -> Result<DifferentialBackupResult> {
        self.differential
            .as_ref()
            .ok_or_else(|| {
                BackstopError::config("differential backups are disabled (differential.enabled = false)")
            })?
            .create_backup(path)
            .await
    }

    /// Run `operation` over a large file set in batches
    pub async fn process_large_project(
        &self,
        paths: Vec<PathBuf>,
        operation: BatchOperation,
        options: BatchOptions,
    ) -> Result<BatchResult> {
        if operation == BatchOperation::Backup && !self.config.backup.enabled {
            return Err(BackstopError::config("backups are disabled (backup.enabled = false)"));
        }
        self.batch.process(paths, operation, options).await
    }

    /// Register a progress listener for batch runs
    pub fn on_progress<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ProgressInfo) + Send + Sync + 'static,
    {
        self.progress.on(callback)
    }

    /// Unregister a progress listener
    pub fn off_progress(&self, id: ListenerId) -> bool {
        self.progress.off(id)
    }

    /// Progress registry, e.g. for [`ProgressRegistry::subscribe_channel`]
    pub fn progress(&self) -> &ProgressRegistry {
        &self.progress
    }

    /// Checksum cache statistics
    pub fn get_cache_stats(&self) -> CacheStats {
        self.checksum.cache_stats()
    }

    /// Compression statistics of backups written by this instance
    pub fn get_compression_stats(&self) -> CompressionStats {
        self.backups.compression().stats()
    }

    /// Deduplication store statistics; `None` when deduplication is disabled
    pub async fn get_deduplication_stats(&self) -> Option<DeduplicationStats> {
        match &self.dedup {
            Some(store) => Some(store.stats().await),
            None => None,
        }
    }

    /// Incremental strategy statistics; `None` when disabled
    pub async fn get_incremental_stats(&self) -> Option<IncrementalStats> {
        match &self.incremental {
            Some(strategy) => Some(strategy.stats().await),
            None => None,
        }
    }

    /// Differential strategy statistics; `None` when disabled
    pub async fn get_differential_stats(&self) -> Option<DifferentialStats> {
        match &self.differential {
            Some(strategy) => Some(strategy.stats().await),
            None => None,
        }
    }

    /// Batch optimizer statistics
    pub fn get_large_project_stats(&self) -> LargeProjectStats {
        self.batch.stats()
    }

    fn dedup_store(&self) -> Result<&DeduplicationStore> {
        self.dedup
            .as_deref()
            .ok_or_else(|| BackstopError::config("deduplication is disabled (deduplication.enabled = false)"))
    }
}

/// Builder for [`Backstop`]
///
/// Starts from [`BackstopConfig::default`] (or a loaded configuration) and
/// overrides individual settings.
///
/// ```rust
/// use backstop::{BackstopBuilder, CompressionAlgorithm, HashAlgorithm};
///
/// let builder = BackstopBuilder::new()
///     .root("./site")
///     .algorithm(HashAlgorithm::Sha512)
///     .compression(CompressionAlgorithm::Brotli, 9)
///     .retention_days(7);
/// assert_eq!(builder.config().backup.retention_days, 7);
/// ```
#[derive(Debug, Clone, Default)]
pub struct BackstopBuilder {
    config: BackstopConfig,
}

impl BackstopBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder starting from `config`
    pub fn from_config(config: BackstopConfig) -> Self {
        Self { config }
    }

    /// Configuration built so far
    pub fn config(&self) -> &BackstopConfig {
        &self.config
    }

    /// Root that relative store directories resolve against
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.root = root.into();
        self
    }

    /// Checksum algorithm
    pub fn algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.config.checksum.algorithm = algorithm;
        self
    }

    /// Largest file that may be hashed (0 = no limit)
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.config.checksum.max_file_size = bytes;
        self
    }

    /// Backup directory
    pub fn backup_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config.backup.directory = directory.into();
        self
    }

    /// Days an artifact is kept by [`Backstop::cleanup_backups`]
    pub fn retention_days(mut self, days: u32) -> Self {
        self.config.backup.retention_days = days;
        self
    }

    /// Codec and level for compressed backups
    pub fn compression(mut self, algorithm: CompressionAlgorithm, level: u32) -> Self {
        self.config.compression.enabled = true;
        self.config.compression.algorithm = algorithm;
        self.config.compression.level = level;
        self
    }

    /// Disable compression
    pub fn no_compression(mut self) -> Self {
        self.config.compression.enabled = false;
        self
    }

    /// Enable or disable the deduplication store
    pub fn deduplication(mut self, enabled: bool) -> Self {
        self.config.deduplication.enabled = enabled;
        self
    }

    /// Whether deduplication or compression wins when both apply
    pub fn storage_policy(mut self, policy: StoragePolicy) -> Self {
        self.config.backup.storage_policy = policy;
        self
    }

    /// Enable or disable incremental backups
    pub fn incremental(mut self, enabled: bool) -> Self {
        self.config.incremental.enabled = enabled;
        self
    }

    /// Enable or disable differential backups
    pub fn differential(mut self, enabled: bool) -> Self {
        self.config.differential.enabled = enabled;
        self
    }

    /// Files processed concurrently in batch runs and batch validation
    pub fn max_concurrency(mut self, count: usize) -> Self {
        self.config.batch.max_concurrency = count.max(1);
        self
    }

    /// Validate the configuration and open the engine
    pub async fn build(self) -> Result<Backstop> {
        Backstop::new(self.config).await
    }
}
