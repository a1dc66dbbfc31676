//! Batch processing for large projects
//!
//! [`BatchOptimizer`] drives one operation (checksum, backup or validate)
//! over a large file set. Files are partitioned into batches; within a batch
//! they run one at a time ([`BatchStrategy::Sequential`]) or concurrently up
//! to `max_concurrency` ([`BatchStrategy::Parallel`],
//! [`BatchStrategy::Adaptive`]).
//!
//! ## Adaptive sizing
//!
//! Before every batch the optimizer samples [`SystemMetrics`]: resident
//! memory of the process, load average per core and scheduler lag. The
//! adaptive strategy halves the next batch when any sample is over its
//! threshold and grows it by half when all samples are below half of their
//! thresholds, always within `[min_batch_size, max_batch_size]`. Metrics are
//! never sampled in the middle of a batch.
//!
//! ## Errors
//!
//! Per-file failures never fail the run. They are passed, in path order, to
//! the caller's [`ErrorHandler`]; returning [`ErrorAction::Abort`] stops the
//! run and reports every file not yet started as skipped.

use crate::backup::BackupManager;
use crate::checksum::ChecksumEngine;
use crate::config::{BatchConfig, BatchStrategy};
use crate::error::{BackstopError, Result};
use crate::progress::ProgressRegistry;
use crate::types::{BackupRecord, ChecksumRecord, ProgressInfo, ValidationOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Operation applied to every file of a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOperation {
    /// Compute checksums
    Checksum,
    /// Create backups
    Backup,
    /// Validate against expected checksums
    Validate,
}

impl fmt::Display for BatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchOperation::Checksum => "checksum",
            BatchOperation::Backup => "backup",
            BatchOperation::Validate => "validate",
        })
    }
}

impl FromStr for BatchOperation {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "checksum" => Ok(BatchOperation::Checksum),
            "backup" => Ok(BatchOperation::Backup),
            "validate" => Ok(BatchOperation::Validate),
            other => Err(BackstopError::config(format!("unknown batch operation '{}'", other))),
        }
    }
}

/// What to do after a file failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Record the failure and go on
    Continue,
    /// Stop; files not yet started are skipped
    Abort,
}

/// Per-file error callback
pub type ErrorHandler = Arc<dyn Fn(&Path, &BackstopError) -> ErrorAction + Send + Sync>;

/// Per-run options
#[derive(Clone, Default)]
pub struct BatchOptions {
    /// Overrides the configured strategy
    pub strategy: Option<BatchStrategy>,
    /// Overrides the configured initial batch size
    pub batch_size: Option<usize>,
    /// Called for every failed file; failures continue without one
    pub error_handler: Option<ErrorHandler>,
    /// Expected hex digests for [`BatchOperation::Validate`]
    pub expected_checksums: HashMap<PathBuf, String>,
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("strategy", &self.strategy)
            .field("batch_size", &self.batch_size)
            .field("error_handler", &self.error_handler.is_some())
            .field("expected_checksums", &self.expected_checksums.len())
            .finish()
    }
}

impl BatchOptions {
    /// Use `strategy` for this run
    pub fn with_strategy(mut self, strategy: BatchStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Start with `size` files per batch
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Route per-file failures to `handler`
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Path, &BackstopError) -> ErrorAction + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Expect `hash` for `path` when validating
    pub fn expect(mut self, path: impl Into<PathBuf>, hash: impl Into<String>) -> Self {
        self.expected_checksums.insert(path.into(), hash.into());
        self
    }
}

/// What happened to one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum ItemOutcome {
    /// Checksum computed
    Checksum(ChecksumRecord),
    /// Backup written and verified
    Backup(BackupRecord),
    /// Validation carried out (the outcome may still be invalid)
    Validation(ValidationOutcome),
    /// The operation failed
    Failed {
        /// Stable error code, for domain errors
        code: Option<String>,
        /// Error description
        message: String,
    },
    /// Not started because the run was aborted
    Skipped,
}

/// Result for one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    /// File
    pub path: PathBuf,
    /// Outcome
    pub outcome: ItemOutcome,
    /// Time spent on this file
    pub duration_ms: u64,
}

/// System load sampled before a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    /// Resident set size of this process (Linux only)
    pub resident_memory_bytes: Option<u64>,
    /// One-minute load average divided by CPU count (Linux only)
    pub load_per_core: Option<f64>,
    /// Delay before a yielded task was polled again
    pub scheduler_lag: Duration,
}

impl SystemMetrics {
    /// Sample the current process and host
    pub async fn sample() -> Self {
        let resident_memory_bytes = tokio::fs::read_to_string("/proc/self/status")
            .await
            .ok()
            .and_then(|status| parse_vm_rss(&status));
        let load_per_core = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .ok()
            .and_then(|loadavg| parse_load_average(&loadavg))
            .map(|load| load / num_cpus::get().max(1) as f64);

        let start = Instant::now();
        tokio::task::yield_now().await;
        let scheduler_lag = start.elapsed();

        Self {
            resident_memory_bytes,
            load_per_core,
            scheduler_lag,
        }
    }
}

/// `VmRSS` from `/proc/<pid>/status`, in bytes
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kb * 1024)
}

/// One-minute load average from `/proc/loadavg`
fn parse_load_average(loadavg: &str) -> Option<f64> {
    loadavg.split_whitespace().next()?.parse().ok()
}

/// Size of the next batch under adaptive sizing
///
/// Halves when any metric is over its threshold, grows by half when every
/// available metric is below half of its threshold, and otherwise keeps the
/// current size. The result is clamped to `[min_batch_size, max_batch_size]`.
pub fn next_batch_size(current: usize, metrics: &SystemMetrics, config: &BatchConfig) -> usize {
    let memory = metrics.resident_memory_bytes;
    let load = metrics.load_per_core;
    let lag = metrics.scheduler_lag;

    let overloaded = memory.is_some_and(|m| m > config.memory_threshold_bytes)
        || load.is_some_and(|l| l > config.cpu_threshold)
        || lag > config.lag_threshold;
    let relaxed = memory.map_or(true, |m| m < config.memory_threshold_bytes / 2)
        && load.map_or(true, |l| l < config.cpu_threshold / 2.0)
        && lag < config.lag_threshold / 2;

    let next = if overloaded {
        current / 2
    } else if relaxed {
        current + current / 2
    } else {
        current
    };
    next.clamp(config.min_batch_size, config.max_batch_size)
}

/// Timing of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTiming {
    /// Zero-based batch number
    pub index: usize,
    /// Files in the batch
    pub size: usize,
    /// Wall time of the batch
    pub duration_ms: u64,
    /// Files that failed
    pub failed: usize,
    /// Metrics sampled before the batch
    pub metrics: SystemMetrics,
}

/// Aggregate result of a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    /// Operation that ran
    pub operation: BatchOperation,
    /// Strategy that was used
    pub strategy: BatchStrategy,
    /// Files requested
    pub total: usize,
    /// Files whose operation completed
    pub succeeded: usize,
    /// Files whose operation failed
    pub failed: usize,
    /// Validations that completed with a mismatch or unreadable file
    pub invalid: usize,
    /// Files not started
    pub skipped: usize,
    /// The error handler stopped the run
    pub aborted: bool,
    /// Per-file results in input order
    pub items: Vec<BatchItemResult>,
    /// Per-batch timings
    pub batches: Vec<BatchTiming>,
    /// Wall time of the run
    pub duration_ms: u64,
    /// Files per second
    pub throughput: f64,
    /// Highest resident memory sampled
    pub peak_memory_bytes: Option<u64>,
    /// Mean resident memory sampled
    pub average_memory_bytes: Option<u64>,
}

/// Lifetime statistics of the optimizer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LargeProjectStats {
    /// Completed runs
    pub runs: u64,
    /// Files processed across runs
    pub files_processed: u64,
    /// Files failed across runs
    pub files_failed: u64,
    /// Files skipped across runs
    pub files_skipped: u64,
    /// Batches across runs
    pub batches: u64,
    /// Batch size the last run ended with
    pub last_batch_size: usize,
    /// Highest resident memory sampled in any run
    pub peak_memory_bytes: Option<u64>,
    /// Throughput of the last run
    pub last_throughput: f64,
    /// Wall time across runs
    pub total_duration_ms: u64,
}

/// Batch driver for large file sets
#[derive(Debug)]
pub struct BatchOptimizer {
    config: BatchConfig,
    checksum: Arc<ChecksumEngine>,
    backups: Arc<BackupManager>,
    progress: Arc<ProgressRegistry>,
    stats: Mutex<LargeProjectStats>,
}

struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    fn due(&mut self) -> bool {
        let now = Instant::now();
        if self.last.is_some_and(|last| now.duration_since(last) < self.interval) {
            return false;
        }
        self.last = Some(now);
        true
    }
}

impl BatchOptimizer {
    /// Create an optimizer over the shared engine components
    pub fn new(
        config: BatchConfig,
        checksum: Arc<ChecksumEngine>,
        backups: Arc<BackupManager>,
        progress: Arc<ProgressRegistry>,
    ) -> Self {
        Self {
            config,
            checksum,
            backups,
            progress,
            stats: Mutex::new(LargeProjectStats::default()),
        }
    }

    /// Lifetime statistics
    pub fn stats(&self) -> LargeProjectStats {
        self.stats.lock().clone()
    }

    /// Apply `operation` to every path
    ///
    /// Never fails because of a single file; see the module docs for error
    /// routing. Items are returned in input order.
    #[instrument(skip(self, paths, options), fields(files = paths.len(), operation = %operation))]
    pub async fn process(
        &self,
        paths: Vec<PathBuf>,
        operation: BatchOperation,
        options: BatchOptions,
    ) -> Result<BatchResult> {
        let started = Instant::now();
        let total = paths.len();

        let (strategy, mut batch_size) = if self.config.enabled {
            (
                options.strategy.unwrap_or(self.config.strategy),
                options.batch_size.unwrap_or(self.config.batch_size).max(1),
            )
        } else {
            (BatchStrategy::Sequential, total.max(1))
        };
        let adaptive =
            self.config.enabled && strategy == BatchStrategy::Adaptive && self.config.dynamic_sizing;
        let expected = Arc::new(options.expected_checksums);

        let mut items: Vec<BatchItemResult> = Vec::with_capacity(total);
        let mut batches = Vec::new();
        let mut memory_samples = Vec::new();
        let mut throttle = ProgressThrottle {
            interval: self.config.progress_interval,
            last: None,
        };
        let mut processed = 0usize;
        let mut aborted = false;
        let mut remaining = paths.into_iter().peekable();

        while remaining.peek().is_some() && !aborted {
            let metrics = SystemMetrics::sample().await;
            if let Some(rss) = metrics.resident_memory_bytes {
                memory_samples.push(rss);
            }
            if adaptive && !batches.is_empty() {
                let next = next_batch_size(batch_size, &metrics, &self.config);
                if next != batch_size {
                    debug!("Batch size {} -> {} ({:?})", batch_size, next, metrics);
                }
                batch_size = next;
            }

            let batch: Vec<PathBuf> = remaining.by_ref().take(batch_size).collect();
            let batch_index = batches.len();
            let batch_started = Instant::now();

            let results = match strategy {
                BatchStrategy::Sequential => {
                    self.run_sequential(batch, operation, &expected, &options.error_handler, &mut aborted, |done| {
                        processed += done;
                        if throttle.due() {
                            self.progress.emit(&ProgressInfo::new(
                                processed,
                                total,
                                started.elapsed(),
                                batch_index,
                                batch_size,
                            ));
                        }
                    })
                    .await
                }
                BatchStrategy::Parallel | BatchStrategy::Adaptive => {
                    let results = self.run_parallel(batch, operation, &expected).await;
                    let mut handled = Vec::with_capacity(results.len());
                    for (path, outcome, duration_ms) in results {
                        let item = self.route(path, outcome, duration_ms, &options.error_handler, &mut aborted);
                        processed += 1;
                        if throttle.due() {
                            self.progress.emit(&ProgressInfo::new(
                                processed,
                                total,
                                started.elapsed(),
                                batch_index,
                                batch_size,
                            ));
                        }
                        handled.push(item);
                    }
                    handled
                }
            };

            let failed = results
                .iter()
                .filter(|item| matches!(item.outcome, ItemOutcome::Failed { .. }))
                .count();
            batches.push(BatchTiming {
                index: batch_index,
                size: results.len(),
                duration_ms: batch_started.elapsed().as_millis() as u64,
                failed,
                metrics,
            });
            items.extend(results);
        }

        let skipped_paths: Vec<PathBuf> = remaining.collect();
        if !skipped_paths.is_empty() {
            warn!("Batch run aborted, {} files skipped", skipped_paths.len());
        }
        items.extend(skipped_paths.into_iter().map(|path| BatchItemResult {
            path,
            outcome: ItemOutcome::Skipped,
            duration_ms: 0,
        }));

        self.progress.emit(&ProgressInfo::new(
            processed,
            total,
            started.elapsed(),
            batches.len().saturating_sub(1),
            batch_size,
        ));

        let elapsed = started.elapsed();
        let mut result = BatchResult {
            operation,
            strategy,
            total,
            succeeded: 0,
            failed: 0,
            invalid: 0,
            skipped: 0,
            aborted,
            items,
            batches,
            duration_ms: elapsed.as_millis() as u64,
            throughput: if elapsed.as_secs_f64() > 0.0 {
                processed as f64 / elapsed.as_secs_f64()
            } else {
                0.0
            },
            peak_memory_bytes: memory_samples.iter().copied().max(),
            average_memory_bytes: if memory_samples.is_empty() {
                None
            } else {
                Some(memory_samples.iter().sum::<u64>() / memory_samples.len() as u64)
            },
        };
        for item in &result.items {
            match &item.outcome {
                ItemOutcome::Failed { .. } => result.failed += 1,
                ItemOutcome::Skipped => result.skipped += 1,
                ItemOutcome::Validation(v) if !v.is_valid => {
                    result.succeeded += 1;
                    result.invalid += 1;
                }
                _ => result.succeeded += 1,
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.runs += 1;
            stats.files_processed += processed as u64;
            stats.files_failed += result.failed as u64;
            stats.files_skipped += result.skipped as u64;
            stats.batches += result.batches.len() as u64;
            stats.last_batch_size = batch_size;
            stats.peak_memory_bytes = stats.peak_memory_bytes.max(result.peak_memory_bytes);
            stats.last_throughput = result.throughput;
            stats.total_duration_ms += result.duration_ms;
        }

        info!(
            "Batch {} of {} files: {} succeeded, {} failed, {} skipped in {} batches ({:.1} files/s)",
            operation,
            total,
            result.succeeded,
            result.failed,
            result.skipped,
            result.batches.len(),
            result.throughput
        );
        Ok(result)
    }

    async fn run_sequential(
        &self,
        batch: Vec<PathBuf>,
        operation: BatchOperation,
        expected: &Arc<HashMap<PathBuf, String>>,
        handler: &Option<ErrorHandler>,
        aborted: &mut bool,
        mut on_done: impl FnMut(usize),
    ) -> Vec<BatchItemResult> {
        let mut results = Vec::with_capacity(batch.len());
        for path in batch {
            if *aborted {
                results.push(BatchItemResult {
                    path,
                    outcome: ItemOutcome::Skipped,
                    duration_ms: 0,
                });
                continue;
            }
            let started = Instant::now();
            let outcome = run_item(
                Arc::clone(&self.checksum),
                Arc::clone(&self.backups),
                operation,
                &path,
                expected.get(&path).cloned(),
            )
            .await;
            let duration_ms = started.elapsed().as_millis() as u64;
            results.push(self.route(path, outcome, duration_ms, handler, aborted));
            on_done(1);
        }
        results
    }

    async fn run_parallel(
        &self,
        batch: Vec<PathBuf>,
        operation: BatchOperation,
        expected: &Arc<HashMap<PathBuf, String>>,
    ) -> Vec<(PathBuf, Result<ItemOutcome>, u64)> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, path) in batch.iter().enumerate() {
            let checksum = Arc::clone(&self.checksum);
            let backups = Arc::clone(&self.backups);
            let permits = Arc::clone(&permits);
            let expected = expected.get(path).cloned();
            let path = path.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let started = Instant::now();
                let outcome = run_item(checksum, backups, operation, &path, expected).await;
                (index, outcome, started.elapsed().as_millis() as u64)
            });
        }

        let mut slots: Vec<Option<(Result<ItemOutcome>, u64)>> = (0..batch.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome, duration_ms)) => slots[index] = Some((outcome, duration_ms)),
                Err(e) => warn!("Batch task did not complete: {}", e),
            }
        }

        batch
            .into_iter()
            .zip(slots)
            .map(|(path, slot)| match slot {
                Some((outcome, duration_ms)) => (path, outcome, duration_ms),
                None => (
                    path,
                    Err(BackstopError::internal("batch task did not complete")),
                    0,
                ),
            })
            .collect()
    }

    /// Turn an item result into a recorded outcome, consulting the error handler
    fn route(
        &self,
        path: PathBuf,
        outcome: Result<ItemOutcome>,
        duration_ms: u64,
        handler: &Option<ErrorHandler>,
        aborted: &mut bool,
    ) -> BatchItemResult {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Batch item {:?} failed: {}", path, e);
                if !*aborted {
                    if let Some(handler) = handler {
                        if handler(&path, &e) == ErrorAction::Abort {
                            *aborted = true;
                        }
                    }
                }
                ItemOutcome::Failed {
                    code: e.code().map(|c| c.as_str().to_string()),
                    message: e.to_string(),
                }
            }
        };
        BatchItemResult {
            path,
            outcome,
            duration_ms,
        }
    }
}

async fn run_item(
    checksum: Arc<ChecksumEngine>,
    backups: Arc<BackupManager>,
    operation: BatchOperation,
    path: &Path,
    expected: Option<String>,
) -> Result<ItemOutcome> {
    match operation {
        BatchOperation::Checksum => Ok(ItemOutcome::Checksum(checksum.compute(path).await?)),
        BatchOperation::Backup => Ok(ItemOutcome::Backup(backups.create_backup(path).await?)),
        BatchOperation::Validate => {
            let outcome = match expected {
                Some(hex) => checksum.validate(path, hex).await,
                None => ValidationOutcome {
                    file_path: path.to_path_buf(),
                    is_valid: false,
                    expected: String::new(),
                    observed: None,
                    algorithm: checksum.algorithm(),
                    error: Some("no expected checksum supplied".to_string()),
                },
            };
            Ok(ItemOutcome::Validation(outcome))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackstopConfig;
    use std::fs;
    use tempfile::TempDir;

    fn optimizer(root: &Path, tweak: impl FnOnce(&mut BackstopConfig)) -> BatchOptimizer {
        let mut config = BackstopConfig {
            root: root.to_path_buf(),
            ..Default::default()
        };
        tweak(&mut config);
        let checksum = Arc::new(ChecksumEngine::new(&config.checksum, &config.cache));
        let backups = Arc::new(BackupManager::new(&config, Arc::clone(&checksum), None).unwrap());
        BatchOptimizer::new(config.batch, checksum, backups, Arc::new(ProgressRegistry::new()))
    }

    fn files(root: &Path, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = root.join(format!("file{:03}.css", i));
                fs::write(&path, format!(".c{} {{ color: red; }}", i)).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_parse_proc_files() {
        let status = "Name:\tbackstop\nVmPeak:\t  20000 kB\nVmRSS:\t   12345 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(12345 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
        assert_eq!(parse_load_average("0.52 0.58 0.59 1/467 12345\n"), Some(0.52));
    }

    #[test]
    fn test_next_batch_size() {
        let config = BatchConfig {
            min_batch_size: 10,
            max_batch_size: 100,
            memory_threshold_bytes: 1000,
            cpu_threshold: 1.0,
            lag_threshold: Duration::from_millis(100),
            ..Default::default()
        };
        let calm = SystemMetrics {
            resident_memory_bytes: Some(100),
            load_per_core: Some(0.1),
            scheduler_lag: Duration::from_millis(1),
        };
        let busy = SystemMetrics {
            resident_memory_bytes: Some(2000),
            ..calm
        };
        let middling = SystemMetrics {
            load_per_core: Some(0.7),
            ..calm
        };

        assert_eq!(next_batch_size(40, &calm, &config), 60);
        assert_eq!(next_batch_size(80, &calm, &config), 100);
        assert_eq!(next_batch_size(40, &busy, &config), 20);
        assert_eq!(next_batch_size(12, &busy, &config), 10);
        assert_eq!(next_batch_size(40, &middling, &config), 40);

        let laggy = SystemMetrics {
            scheduler_lag: Duration::from_millis(250),
            ..calm
        };
        assert_eq!(next_batch_size(40, &laggy, &config), 20);
    }

    #[tokio::test]
    async fn test_checksum_run_partitions_into_batches() {
        let temp = TempDir::new().unwrap();
        let optimizer = optimizer(temp.path(), |c| {
            c.batch.strategy = BatchStrategy::Parallel;
            c.batch.min_batch_size = 2;
            c.batch.batch_size = 4;
        });
        let paths = files(temp.path(), 10);

        let result = optimizer
            .process(paths.clone(), BatchOperation::Checksum, BatchOptions::default())
            .await
            .unwrap();

        assert_eq!(result.succeeded, 10);
        assert_eq!(result.batches.iter().map(|b| b.size).collect::<Vec<_>>(), vec![4, 4, 2]);
        let order: Vec<PathBuf> = result.items.iter().map(|i| i.path.clone()).collect();
        assert_eq!(order, paths);
        assert!(result
            .items
            .iter()
            .all(|i| matches!(i.outcome, ItemOutcome::Checksum(_))));
        assert_eq!(optimizer.stats().files_processed, 10);
    }

    #[tokio::test]
    async fn test_abort_skips_remaining() {
        let temp = TempDir::new().unwrap();
        let optimizer = optimizer(temp.path(), |c| {
            c.batch.strategy = BatchStrategy::Sequential;
            c.batch.min_batch_size = 1;
            c.batch.batch_size = 2;
        });
        let mut paths = files(temp.path(), 5);
        paths.insert(1, temp.path().join("missing.css"));

        let options = BatchOptions::default().on_error(|_, _| ErrorAction::Abort);
        let result = optimizer
            .process(paths, BatchOperation::Checksum, options)
            .await
            .unwrap();

        assert!(result.aborted);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 4);
        assert_eq!(result.items.len(), 6);
        match &result.items[1].outcome {
            ItemOutcome::Failed { code, .. } => assert_eq!(code.as_deref(), Some("FILE_NOT_FOUND")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failures_continue_by_default() {
        let temp = TempDir::new().unwrap();
        let optimizer = optimizer(temp.path(), |_| {});
        let mut paths = files(temp.path(), 3);
        paths.push(temp.path().join("missing.css"));

        let result = optimizer
            .process(paths, BatchOperation::Backup, BatchOptions::default())
            .await
            .unwrap();
        assert!(!result.aborted);
        assert_eq!(result.succeeded, 3);
        assert_eq!(result.failed, 1);
    }

    #[tokio::test]
    async fn test_validate_uses_expected_checksums() {
        let temp = TempDir::new().unwrap();
        let optimizer = optimizer(temp.path(), |_| {});
        let paths = files(temp.path(), 3);
        let good = crate::checksum::HashAlgorithm::Sha256.hash_hex(&fs::read(&paths[0]).unwrap());

        let options = BatchOptions::default()
            .expect(paths[0].clone(), good)
            .expect(paths[1].clone(), "0".repeat(64));
        let result = optimizer
            .process(paths, BatchOperation::Validate, options)
            .await
            .unwrap();

        assert_eq!(result.succeeded, 3);
        assert_eq!(result.invalid, 2);
        let valid: Vec<bool> = result
            .items
            .iter()
            .map(|i| match &i.outcome {
                ItemOutcome::Validation(v) => v.is_valid,
                _ => false,
            })
            .collect();
        assert_eq!(valid, vec![true, false, false]);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_final() {
        let temp = TempDir::new().unwrap();
        let optimizer = optimizer(temp.path(), |c| c.batch.progress_interval = Duration::ZERO);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        optimizer.progress.on(move |info| sink.lock().push(info.processed));

        optimizer
            .process(files(temp.path(), 12), BatchOperation::Checksum, BatchOptions::default())
            .await
            .unwrap();

        let seen = seen.lock();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&12));
    }

    #[tokio::test]
    async fn test_disabled_batching_runs_single_batch() {
        let temp = TempDir::new().unwrap();
        let optimizer = optimizer(temp.path(), |c| c.batch.enabled = false);
        let result = optimizer
            .process(files(temp.path(), 25), BatchOperation::Checksum, BatchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.strategy, BatchStrategy::Sequential);
        assert_eq!(result.batches.len(), 1);
        assert_eq!(result.succeeded, 25);
    }
}
