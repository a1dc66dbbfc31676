//! Differential backups against the latest full backup
//!
//! Unlike incremental chains, every differential backup is compared with the
//! most recent *full* backup of the file, not with the previous differential.
//! The strategy accumulates the files and bytes captured since that full
//! backup and recommends a new one once the accumulation gets expensive:
//!
//! - cumulative size exceeds `base size × size_multiplier`
//! - the full backup is older than `full_backup_interval`
//! - `full_backup_threshold` differentials were taken
//!
//! The recommendation is advisory unless `auto_promote` is set, in which case
//! the next changed backup after a recommendation is taken as a full backup.
//!
//! State lives in `differential-index.json` with the same reinitialize-on-
//! corruption contract as the incremental index.

use crate::backup::BackupManager;
use crate::checksum::ChecksumEngine;
use crate::config::{BackstopConfig, ChangeDetection};
use crate::error::Result;
use crate::incremental::{detect_change, stat_source, FileBaseline};
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

/// Index file name inside the differential directory
pub const INDEX_FILE: &str = "differential-index.json";

const INDEX_VERSION: u32 = 1;

/// Kind of a differential strategy result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifferentialBackupType {
    /// New base backup
    Full,
    /// Change relative to the base
    Differential,
    /// Unchanged since the base
    Skipped,
}

/// Accumulated changes since the latest full backup of a file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DifferentialState {
    /// Id of the base full backup
    pub current_full_backup_id: String,
    /// Artifact of the base full backup
    pub full_backup_path: PathBuf,
    /// When the base was taken
    pub created_at: DateTime<Utc>,
    /// File state at the base backup
    pub base: FileBaseline,
    /// Files captured by differentials since the base
    pub cumulative_changed_files: BTreeSet<PathBuf>,
    /// Bytes captured by differentials since the base
    pub cumulative_size: u64,
    /// Differentials since the base
    pub differential_count: u64,
    /// Artifact of the latest differential
    pub last_backup_path: Option<PathBuf>,
    /// A full backup was recommended and not yet taken
    pub promotion_pending: bool,
}

impl DifferentialState {
    fn new(backup_id: String, record: &BackupRecord, metadata: &std::fs::Metadata) -> Self {
        Self {
            current_full_backup_id: backup_id,
            full_backup_path: record.backup_path.clone(),
            created_at: record.created_at,
            base: FileBaseline::from_backup(record, metadata),
            cumulative_changed_files: BTreeSet::new(),
            cumulative_size: 0,
            differential_count: 0,
            last_backup_path: None,
            promotion_pending: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Counters {
    full_backups: u64,
    differential_backups: u64,
    skipped_backups: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DifferentialIndex {
    version: u32,
    last_updated: DateTime<Utc>,
    roots: BTreeMap<PathBuf, DifferentialState>,
    #[serde(default)]
    counters: Counters,
}

impl DifferentialIndex {
    fn empty() -> Self {
        Self {
            version: INDEX_VERSION,
            last_updated: Utc::now(),
            roots: BTreeMap::new(),
            counters: Counters::default(),
        }
    }
}

/// Result of a differential backup request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DifferentialBackupResult {
    /// Id of the backup taken; `None` when skipped
    pub backup_id: Option<String>,
    /// What was done
    pub backup_type: DifferentialBackupType,
    /// Full backup the state is relative to
    pub base_full_backup_id: String,
    /// Files captured (0 or 1)
    pub files_changed: usize,
    /// Bytes accumulated since the base
    pub cumulative_size: u64,
    /// Differentials since the base
    pub differential_count: u64,
    /// A new full backup is advisable
    pub recommend_full_backup: bool,
    /// Why it is advisable
    pub recommendation_reason: Option<String>,
    /// Backup written, if any
    pub backup: Option<BackupRecord>,
}

/// Differential strategy statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DifferentialStats {
    /// Files with a base full backup
    pub tracked_roots: usize,
    /// Full backups taken
    pub full_backups: u64,
    /// Differential backups taken
    pub differential_backups: u64,
    /// Requests that found nothing to back up
    pub skipped_backups: u64,
    /// Roots with an outstanding full-backup recommendation
    pub pending_recommendations: usize,
    /// Sum of cumulative sizes over all roots
    pub total_cumulative_size: u64,
    /// The index was unreadable at startup and reinitialized
    pub index_reinitialized: bool,
}

/// Differential backup strategy
#[derive(Debug)]
pub struct DifferentialStrategy {
    index_path: PathBuf,
    detection: ChangeDetection,
    full_backup_threshold: u64,
    full_backup_interval: Duration,
    size_multiplier: f64,
    auto_promote: bool,
    checksum: Arc<ChecksumEngine>,
    backups: Arc<BackupManager>,
    index: Mutex<DifferentialIndex>,
    reinitialized: bool,
}

impl DifferentialStrategy {
    /// Open the strategy, loading (or reinitializing) its index
    pub async fn open(
        config: &BackstopConfig,
        checksum: Arc<ChecksumEngine>,
        backups: Arc<BackupManager>,
    ) -> Result<Self> {
        let directory = config.differential_directory();
        tokio::fs::create_dir_all(&directory).await?;
        let index_path = directory.join(INDEX_FILE);

        let (index, reinitialized) = match utils::read_json::<DifferentialIndex>(&index_path).await {
            Ok(Some(index)) => (index, false),
            Ok(None) => (DifferentialIndex::empty(), false),
            Err(e) => {
                warn!(
                    "Differential index {:?} is unreadable, base backups are forgotten: {}",
                    index_path, e
                );
                let index = DifferentialIndex::empty();
                utils::write_json_atomic(&index_path, &index).await?;
                (index, true)
            }
        };

        Ok(Self {
            index_path,
            detection: config.differential.change_detection,
            full_backup_threshold: config.differential.full_backup_threshold as u64,
            full_backup_interval: config.differential.full_backup_interval,
            size_multiplier: config.differential.size_multiplier,
            auto_promote: config.differential.auto_promote,
            checksum,
            backups,
            index: Mutex::new(index),
            reinitialized,
        })
    }

    /// Reason to take a new full backup, if any
    fn recommendation(&self, state: &DifferentialState, now: DateTime<Utc>) -> Option<String> {
        let size_limit = state.base.size as f64 * self.size_multiplier;
        if state.cumulative_size as f64 > size_limit {
            return Some(format!(
                "cumulative size {} exceeds {} ({}x base)",
                utils::format_bytes(state.cumulative_size),
                utils::format_bytes(size_limit as u64),
                self.size_multiplier
            ));
        }

        let age = (now - state.created_at).to_std().unwrap_or_default();
        if age > self.full_backup_interval {
            return Some(format!(
                "full backup is older than {}",
                humantime::format_duration(self.full_backup_interval)
            ));
        }

        if state.differential_count >= self.full_backup_threshold {
            return Some(format!(
                "{} differential backups since the last full backup",
                state.differential_count
            ));
        }

        None
    }

    /// Back up `path` relative to its latest full backup
    ///
    /// # Errors
    ///
    /// Propagates backup failures; the state is left unchanged when the
    /// backup fails.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn create_backup(&self, path: &Path) -> Result<DifferentialBackupResult> {
        let path = utils::absolute(path);
        let metadata = stat_source(&path, "differential").await?;

        let mut index = self.index.lock().await;
        let now = Utc::now();
        let current = index.roots.get(&path).cloned();

        let backup_type = match &current {
            None => DifferentialBackupType::Full,
            Some(state) => {
                let changed =
                    detect_change(self.detection, &self.checksum, &path, &metadata, &state.base).await?;
                if !changed {
                    DifferentialBackupType::Skipped
                } else if self.auto_promote && state.promotion_pending {
                    DifferentialBackupType::Full
                } else {
                    DifferentialBackupType::Differential
                }
            }
        };

        let (state, backup_id, record) = match (backup_type, current) {
            (DifferentialBackupType::Skipped, Some(state)) => {
                index.counters.skipped_backups += 1;
                debug!("Skipped differential backup of {:?}", path);
                (state, None, None)
            }
            (DifferentialBackupType::Differential, Some(mut state)) => {
                let record = self.backups.create_backup(&path).await?;
                state.cumulative_changed_files.insert(path.clone());
                state.cumulative_size += record.original_size;
                state.differential_count += 1;
                state.last_backup_path = Some(record.backup_path.clone());
                index.counters.differential_backups += 1;
                (state, Some(Uuid::new_v4().to_string()), Some(record))
            }
            _ => {
                let record = self.backups.create_backup(&path).await?;
                let backup_id = Uuid::new_v4().to_string();
                index.counters.full_backups += 1;
                (
                    DifferentialState::new(backup_id.clone(), &record, &metadata),
                    Some(backup_id),
                    Some(record),
                )
            }
        };

        let recommendation = self.recommendation(&state, now);
        let mut state = state;
        state.promotion_pending = recommendation.is_some();

        let result = DifferentialBackupResult {
            backup_id,
            backup_type,
            base_full_backup_id: state.current_full_backup_id.clone(),
            files_changed: usize::from(record.is_some()),
            cumulative_size: state.cumulative_size,
            differential_count: state.differential_count,
            recommend_full_backup: recommendation.is_some(),
            recommendation_reason: recommendation,
            backup: record,
        };

        index.roots.insert(path.clone(), state);
        index.last_updated = now;
        utils::write_json_atomic(&self.index_path, &*index).await?;

        if backup_type != DifferentialBackupType::Skipped {
            info!(
                "{:?} backup of {:?}, cumulative {}",
                backup_type,
                path.file_name().unwrap_or_default(),
                utils::format_bytes(result.cumulative_size)
            );
        }
        if let Some(reason) = &result.recommendation_reason {
            debug!("Full backup recommended for {:?}: {}", path, reason);
        }

        Ok(result)
    }

    /// State of `path`, if it has a base full backup
    pub async fn state(&self, path: &Path) -> Option<DifferentialState> {
        let path = utils::absolute(path);
        self.index.lock().await.roots.get(&path).cloned()
    }

    /// Strategy statistics
    pub async fn stats(&self) -> DifferentialStats {
        let index = self.index.lock().await;
        DifferentialStats {
            tracked_roots: index.roots.len(),
            full_backups: index.counters.full_backups,
            differential_backups: index.counters.differential_backups,
            skipped_backups: index.counters.skipped_backups,
            pending_recommendations: index.roots.values().filter(|s| s.promotion_pending).count(),
            total_cumulative_size: index.roots.values().map(|s| s.cumulative_size).sum(),
            index_reinitialized: self.reinitialized,
        }
    }
}
