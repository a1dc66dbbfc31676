//! Incremental backup chains
//!
//! Each tracked file has a chain of backups: a full backup as the root,
//! followed by incremental backups that each point at their predecessor
//! through `parent_id`. A new backup is only taken when the file changed
//! since the last recorded one.
//!
//! ```text
//! Full(a1) <- Incremental(b7) <- Incremental(c3) <- ...
//! ```
//!
//! A chain never grows past `max_chain_length` entries: the backup that would
//! exceed it is taken as a full backup and starts a new chain. A chain whose
//! full backup is older than `full_backup_interval` is restarted the same way.
//!
//! ## Change detection
//!
//! | Method   | Changed when                                            |
//! |----------|---------------------------------------------------------|
//! | mtime    | modification time or size differs from the last backup  |
//! | checksum | content digest differs                                  |
//! | hybrid   | mtime or size differs *and* the digest differs          |
//!
//! ## Persistence
//!
//! Chains live in `incremental-index.json`, rewritten atomically after every
//! backup and every skip. A corrupt index is replaced by an empty one (with a
//! warning), so the next backup of every file is a full backup.

use crate::backup::BackupManager;
use crate::checksum::ChecksumEngine;
use crate::config::{BackstopConfig, ChangeDetection};
use crate::error::{BackstopError, ErrorCode, Result};
use crate::types::BackupRecord;
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Index file name inside the incremental directory
pub const INDEX_FILE: &str = "incremental-index.json";

const INDEX_VERSION: u32 = 1;

/// Kind of an incremental strategy result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncrementalBackupType {
    /// Self-sufficient backup, root of a chain
    Full,
    /// Backup linked to the chain tail
    Incremental,
    /// Nothing changed, no backup taken
    Skipped,
}

/// One backup in a chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalChainEntry {
    /// Unique id
    pub backup_id: String,
    /// Previous entry; `None` for the chain root
    pub parent_id: Option<String>,
    /// Full or Incremental
    pub backup_type: IncrementalBackupType,
    /// Files captured by this backup
    pub changed_files: BTreeSet<PathBuf>,
    /// When it was taken
    pub created_at: DateTime<Utc>,
    /// Artifact written by the backup manager
    pub backup_path: PathBuf,
    /// Content digest at backup time
    pub content_hash: String,
    /// Source size at backup time
    pub size: u64,
}

/// State a file is compared against to decide whether it changed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileBaseline {
    /// Modification time
    pub mtime: Option<DateTime<Utc>>,
    /// Size in bytes
    pub size: u64,
    /// Hex digest with the engine's default algorithm
    pub checksum: String,
}

impl FileBaseline {
    /// Baseline from a finished backup and the metadata read before it
    pub fn from_backup(record: &BackupRecord, metadata: &std::fs::Metadata) -> Self {
        Self {
            mtime: metadata.modified().ok().map(utils::system_time_to_utc),
            size: record.original_size,
            checksum: record.content_hash.clone(),
        }
    }
}

/// Whether `path` changed relative to `baseline`
pub(crate) async fn detect_change(
    method: ChangeDetection,
    checksum: &ChecksumEngine,
    path: &Path,
    metadata: &std::fs::Metadata,
    baseline: &FileBaseline,
) -> Result<bool> {
    let mtime = metadata.modified().ok().map(utils::system_time_to_utc);
    let stat_unchanged = mtime.is_some() && mtime == baseline.mtime && metadata.len() == baseline.size;

    match method {
        ChangeDetection::Mtime => Ok(!stat_unchanged),
        ChangeDetection::Hybrid if stat_unchanged => Ok(false),
        ChangeDetection::Hybrid | ChangeDetection::Checksum => {
            let current = checksum.compute(path).await?;
            Ok(current.hex() != baseline.checksum)
        }
    }
}

/// Stat a backup source, mapping failures like the backup manager does
pub(crate) async fn stat_source(path: &Path, operation: &'static str) -> Result<std::fs::Metadata> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        BackstopError::rollback(
            ErrorCode::SourceUnavailable,
            operation,
            path,
            "Backup source does not exist or cannot be accessed",
        )
        .caused_by(e)
    })?;
    if !metadata.is_file() {
        return Err(BackstopError::rollback(
            ErrorCode::SourceUnavailable,
            operation,
            path,
            "Backup source is not a regular file",
        ));
    }
    Ok(metadata)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackedFile {
    chain: Vec<IncrementalChainEntry>,
    baseline: FileBaseline,
    last_checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Counters {
    full_backups: u64,
    incremental_backups: u64,
    skipped_backups: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncrementalIndex {
    version: u32,
    last_updated: DateTime<Utc>,
    files: BTreeMap<PathBuf, TrackedFile>,
    #[serde(default)]
    counters: Counters,
}

impl IncrementalIndex {
    fn empty() -> Self {
        Self {
            version: INDEX_VERSION,
            last_updated: Utc::now(),
            files: BTreeMap::new(),
            counters: Counters::default(),
        }
    }
}

/// Result of an incremental backup request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalBackupResult {
    /// Id of the new chain entry; `None` when skipped
    pub backup_id: Option<String>,
    /// What was done
    pub backup_type: IncrementalBackupType,
    /// Chain predecessor (for skips: the current chain tail)
    pub parent_id: Option<String>,
    /// Files captured (0 or 1)
    pub files_changed: usize,
    /// Chain length after this call
    pub chain_length: usize,
    /// Why this backup type was chosen
    pub reason: String,
    /// Backup written, if any
    pub backup: Option<BackupRecord>,
}

/// Incremental strategy statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalStats {
    /// Files with a chain
    pub tracked_files: usize,
    /// Full backups taken
    pub full_backups: u64,
    /// Incremental backups taken
    pub incremental_backups: u64,
    /// Requests that found nothing to back up
    pub skipped_backups: u64,
    /// Longest current chain
    pub longest_chain: usize,
    /// Configured maximum chain length
    pub max_chain_length: usize,
    /// The index was unreadable at startup and reinitialized
    pub index_reinitialized: bool,
}

/// Incremental backup strategy
#[derive(Debug)]
pub struct IncrementalStrategy {
    index_path: PathBuf,
    detection: ChangeDetection,
    max_chain_length: usize,
    full_backup_interval: Duration,
    checksum: Arc<ChecksumEngine>,
    backups: Arc<BackupManager>,
    index: Mutex<IncrementalIndex>,
    reinitialized: bool,
}

impl IncrementalStrategy {
    /// Open the strategy, loading (or reinitializing) its index
    pub async fn open(
        config: &BackstopConfig,
        checksum: Arc<ChecksumEngine>,
        backups: Arc<BackupManager>,
    ) -> Result<Self> {
        let directory = config.incremental_directory();
        tokio::fs::create_dir_all(&directory).await?;
        let index_path = directory.join(INDEX_FILE);

        let (index, reinitialized) = match utils::read_json::<IncrementalIndex>(&index_path).await {
            Ok(Some(index)) => {
                debug!("Loaded incremental index with {} tracked files", index.files.len());
                (index, false)
            }
            Ok(None) => (IncrementalIndex::empty(), false),
            Err(e) => {
                warn!(
                    "Incremental index {:?} is unreadable, chain history is reset: {}",
                    index_path, e
                );
                let index = IncrementalIndex::empty();
                utils::write_json_atomic(&index_path, &index).await?;
                (index, true)
            }
        };

        Ok(Self {
            index_path,
            detection: config.incremental.change_detection,
            max_chain_length: config.incremental.max_chain_length,
            full_backup_interval: config.incremental.full_backup_interval,
            checksum,
            backups,
            index: Mutex::new(index),
            reinitialized,
        })
    }

    /// Back up `path` if it changed since its last recorded backup
    ///
    /// # Errors
    ///
    /// Propagates backup failures; the chain is left unchanged when the
    /// backup fails.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn create_backup(&self, path: &Path) -> Result<IncrementalBackupResult> {
        let path = utils::absolute(path);
        let metadata = stat_source(&path, "incremental").await?;

        let mut index = self.index.lock().await;
        let now = Utc::now();
        let tracked = index.files.get(&path).filter(|t| !t.chain.is_empty()).cloned();

        let (backup_type, reason) = match &tracked {
            None => (IncrementalBackupType::Full, "no previous backup".to_string()),
            Some(tracked) => {
                let changed =
                    detect_change(self.detection, &self.checksum, &path, &metadata, &tracked.baseline).await?;
                let root_age = tracked
                    .chain
                    .first()
                    .and_then(|root| (now - root.created_at).to_std().ok())
                    .unwrap_or_default();

                if !changed {
                    (IncrementalBackupType::Skipped, "unchanged since last backup".to_string())
                } else if tracked.chain.len() >= self.max_chain_length {
                    (
                        IncrementalBackupType::Full,
                        format!("chain reached {} entries", self.max_chain_length),
                    )
                } else if root_age > self.full_backup_interval {
                    (
                        IncrementalBackupType::Full,
                        format!(
                            "full backup is older than {}",
                            humantime::format_duration(self.full_backup_interval)
                        ),
                    )
                } else {
                    (IncrementalBackupType::Incremental, "changed since last backup".to_string())
                }
            }
        };

        if backup_type == IncrementalBackupType::Skipped {
            let mut chain_length = 0;
            let mut parent_id = None;
            if let Some(tracked) = index.files.get_mut(&path) {
                tracked.baseline.mtime = metadata.modified().ok().map(utils::system_time_to_utc);
                tracked.last_checked_at = now;
                chain_length = tracked.chain.len();
                parent_id = tracked.chain.last().map(|e| e.backup_id.clone());
            }
            index.counters.skipped_backups += 1;
            index.last_updated = now;
            utils::write_json_atomic(&self.index_path, &*index).await?;

            debug!("Skipped incremental backup of {:?}", path);
            return Ok(IncrementalBackupResult {
                backup_id: None,
                backup_type,
                parent_id,
                files_changed: 0,
                chain_length,
                reason,
                backup: None,
            });
        }

        let record = self.backups.create_backup(&path).await?;
        let backup_id = Uuid::new_v4().to_string();
        let baseline = FileBaseline::from_backup(&record, &metadata);

        let tracked = index.files.entry(path.clone()).or_insert_with(|| TrackedFile {
            chain: Vec::new(),
            baseline: baseline.clone(),
            last_checked_at: now,
        });
        if backup_type == IncrementalBackupType::Full {
            tracked.chain.clear();
        }
        let parent_id = tracked.chain.last().map(|e| e.backup_id.clone());
        tracked.chain.push(IncrementalChainEntry {
            backup_id: backup_id.clone(),
            parent_id: parent_id.clone(),
            backup_type,
            changed_files: BTreeSet::from([path.clone()]),
            created_at: record.created_at,
            backup_path: record.backup_path.clone(),
            content_hash: record.content_hash.clone(),
            size: record.original_size,
        });
        tracked.baseline = baseline;
        tracked.last_checked_at = now;
        let chain_length = tracked.chain.len();

        match backup_type {
            IncrementalBackupType::Full => index.counters.full_backups += 1,
            _ => index.counters.incremental_backups += 1,
        }
        index.last_updated = now;
        utils::write_json_atomic(&self.index_path, &*index).await?;

        info!(
            "{:?} backup of {:?} ({}), chain length {}",
            backup_type,
            path.file_name().unwrap_or_default(),
            reason,
            chain_length
        );

        Ok(IncrementalBackupResult {
            backup_id: Some(backup_id),
            backup_type,
            parent_id,
            files_changed: 1,
            chain_length,
            reason,
            backup: Some(record),
        })
    }

    /// Current chain of `path`, root first
    pub async fn chain(&self, path: &Path) -> Vec<IncrementalChainEntry> {
        let path = utils::absolute(path);
        self.index
            .lock()
            .await
            .files
            .get(&path)
            .map(|t| t.chain.clone())
            .unwrap_or_default()
    }

    /// Strategy statistics
    pub async fn stats(&self) -> IncrementalStats {
        let index = self.index.lock().await;
        IncrementalStats {
            tracked_files: index.files.len(),
            full_backups: index.counters.full_backups,
            incremental_backups: index.counters.incremental_backups,
            skipped_backups: index.counters.skipped_backups,
            longest_chain: index.files.values().map(|t| t.chain.len()).max().unwrap_or(0),
            max_chain_length: self.max_chain_length,
            index_reinitialized: self.reinitialized,
        }
    }
}
