//! Backup and restore manager
//!
//! Creates a verified backup of a file before it is mutated and restores it
//! afterwards. Every artifact is checked against the source checksum right
//! after it is written; every restore is checked against the backup and
//! guarded by a safety backup of the pre-restore content.
//!
//! ## Artifact naming
//!
//! ```text
//! <stem>.<timestamp>[-<n>].<ext>.backup[.gz|.deflate|.br|.dedup]
//! ```
//!
//! `timestamp` is UTC with microseconds (`20261019T142501123456Z`). A
//! numeric `-<n>` is appended if two backups of the same file land on the
//! same microsecond. The suffix encodes the storage kind, so restore and
//! cleanup need nothing but the file name. Files in the backup directory that
//! do not follow this pattern are never touched.
//!
//! ## Storage forms
//!
//! | Kind         | Artifact content                              |
//! |--------------|-----------------------------------------------|
//! | Plain        | byte copy of the source                       |
//! | Compressed   | codec stream, codec named by the suffix       |
//! | Deduplicated | JSON reference into the deduplication store   |
//!
//! With both deduplication and compression enabled and eligible, the
//! [`StoragePolicy`] decides which one applies; they are never combined.
//!
//! Plain and compressed artifacts get an [`ArtifactDigest`] record under
//! `digests/`, so a restore is checked against the source digest even if the
//! artifact was altered after it was written. Deduplicated artifacts carry
//! the digest in their reference document.

use crate::checksum::{ChecksumEngine, HashAlgorithm};
use crate::compression::{CompressionAlgorithm, CompressionEngine};
use crate::config::{BackstopConfig, StoragePolicy};
use crate::dedup::{DeduplicationResult, DeduplicationStore};
use crate::error::{BackstopError, ErrorCode, Result};
use crate::types::{BackupArtifact, BackupKind, BackupRecord, ChecksumRecord, CleanupStats, RestoreResult};
use crate::utils;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, instrument, warn};

/// Timestamp segment format of artifact names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%6fZ";

/// `type` field of deduplication reference documents
pub const REFERENCE_TYPE: &str = "deduplication_reference";

/// Directory next to plain and compressed artifacts holding their source digests
pub const DIGEST_DIR: &str = "digests";

const BACKUP_SUFFIX: &str = ".backup";
const DEDUP_SUFFIX: &str = ".dedup";

/// Artifact content of a deduplicated backup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeduplicationReference {
    /// Always [`REFERENCE_TYPE`]
    #[serde(rename = "type")]
    pub kind: String,
    /// File that was backed up
    pub original_path: PathBuf,
    /// Content address in the store
    pub content_hash: String,
    /// Blob location
    pub storage_path: PathBuf,
    /// References to the blob when this backup was taken
    pub reference_count: u64,
    /// When the backup was taken
    pub timestamp: DateTime<Utc>,
    /// Algorithm of `content_hash`
    pub algorithm: HashAlgorithm,
}

/// Source digest of a plain or compressed artifact
///
/// Stored as `<backup dir>/digests/<artifact file name>.json`, so restore can
/// check the written file against the source rather than against the
/// artifact itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDigest {
    /// Hex digest of the source when the backup was taken
    pub content_hash: String,
    /// Algorithm of `content_hash`
    pub algorithm: HashAlgorithm,
}

/// Location of the digest record for `artifact`
pub fn digest_path(artifact: &Path) -> PathBuf {
    let name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    artifact.with_file_name(DIGEST_DIR).join(format!("{}.json", name))
}

/// Fields encoded in an artifact file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    /// File name of the original file
    pub original_name: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Storage form
    pub kind: BackupKind,
    /// Codec, for compressed artifacts
    pub compression: Option<CompressionAlgorithm>,
}

/// Build the artifact file name for `original`
///
/// `collision` > 0 appends `-<collision>` to the timestamp.
pub fn artifact_file_name(
    original: &Path,
    created_at: DateTime<Utc>,
    kind: BackupKind,
    compression: Option<CompressionAlgorithm>,
    collision: u32,
) -> String {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let mut timestamp = created_at.format(TIMESTAMP_FORMAT).to_string();
    if collision > 0 {
        timestamp.push_str(&format!("-{}", collision));
    }
    let suffix = match (kind, compression) {
        (BackupKind::Plain, _) => "",
        (BackupKind::Compressed, Some(algorithm)) => algorithm.extension(),
        (BackupKind::Compressed, None) => CompressionAlgorithm::default().extension(),
        (BackupKind::Deduplicated, _) => DEDUP_SUFFIX,
    };

    match original.extension() {
        Some(ext) => format!(
            "{}.{}.{}{}{}",
            stem,
            timestamp,
            ext.to_string_lossy(),
            BACKUP_SUFFIX,
            suffix
        ),
        None => format!("{}.{}{}{}", stem, timestamp, BACKUP_SUFFIX, suffix),
    }
}

/// Parse an artifact file name; `None` if it does not follow the convention
pub fn parse_artifact_name(name: &str) -> Option<ArtifactName> {
    let (rest, kind, compression) = if let Some(rest) = name.strip_suffix(BACKUP_SUFFIX) {
        (rest, BackupKind::Plain, None)
    } else if let Some(rest) = name
        .strip_suffix(DEDUP_SUFFIX)
        .and_then(|r| r.strip_suffix(BACKUP_SUFFIX))
    {
        (rest, BackupKind::Deduplicated, None)
    } else {
        let (algorithm, rest) = CompressionAlgorithm::ALL.into_iter().find_map(|algorithm| {
            name.strip_suffix(algorithm.extension())
                .and_then(|r| r.strip_suffix(BACKUP_SUFFIX))
                .map(|r| (algorithm, r))
        })?;
        (rest, BackupKind::Compressed, Some(algorithm))
    };

    let segments: Vec<&str> = rest.split('.').collect();
    let n = segments.len();
    if n < 2 {
        return None;
    }

    let (original_name, created_at) = if let Some(ts) = parse_timestamp(segments[n - 1]) {
        (segments[..n - 1].join("."), ts)
    } else if n >= 3 {
        let ts = parse_timestamp(segments[n - 2])?;
        (format!("{}.{}", segments[..n - 2].join("."), segments[n - 1]), ts)
    } else {
        return None;
    };

    if original_name.is_empty() {
        return None;
    }

    Some(ArtifactName {
        original_name,
        created_at,
        kind,
        compression,
    })
}

fn parse_timestamp(segment: &str) -> Option<DateTime<Utc>> {
    let base = match segment.split_once('-') {
        Some((base, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => base,
        Some(_) => return None,
        None => segment,
    };
    // <YYYYmmddTHHMMSS><micros:6>Z
    let base = base.strip_suffix('Z')?;
    if base.len() != 21 || !base.is_ascii() {
        return None;
    }
    let (seconds, micros) = base.split_at(15);
    if !micros.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(seconds, "%Y%m%dT%H%M%S").ok()?;
    let micros: i64 = micros.parse().ok()?;
    Some(naive.and_utc() + chrono::Duration::microseconds(micros))
}

/// What was written for an artifact
struct WrittenArtifact {
    stored_size: u64,
    dedup: Option<DeduplicationResult>,
}

/// Verified backup creation, restore and retention cleanup
#[derive(Debug)]
pub struct BackupManager {
    directory: PathBuf,
    retention: Duration,
    verify_after_rollback: bool,
    policy: StoragePolicy,
    compression: Arc<CompressionEngine>,
    dedup: Option<Arc<DeduplicationStore>>,
    dedup_threshold: u64,
    checksum: Arc<ChecksumEngine>,
}

impl BackupManager {
    /// Create a manager
    ///
    /// `dedup` is the shared store when deduplication is enabled.
    pub fn new(
        config: &BackstopConfig,
        checksum: Arc<ChecksumEngine>,
        dedup: Option<Arc<DeduplicationStore>>,
    ) -> Result<Self> {
        Ok(Self {
            directory: config.backup_directory(),
            retention: Duration::from_secs(u64::from(config.backup.retention_days) * 24 * 60 * 60),
            verify_after_rollback: config.backup.verify_after_rollback,
            policy: config.backup.storage_policy,
            compression: Arc::new(CompressionEngine::new(&config.compression)?),
            dedup,
            dedup_threshold: config.deduplication.threshold,
            checksum,
        })
    }

    /// Backup directory
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Compression codec with its statistics
    pub fn compression(&self) -> &CompressionEngine {
        &self.compression
    }

    fn storage_kind(&self, size: u64) -> BackupKind {
        let dedup = self.dedup.is_some() && size >= self.dedup_threshold;

        // The codec only sees sizes it is actually asked about
        match self.policy {
            StoragePolicy::DeduplicationFirst if dedup => BackupKind::Deduplicated,
            _ if self.compression.should_compress(size) => BackupKind::Compressed,
            _ if dedup => BackupKind::Deduplicated,
            _ => BackupKind::Plain,
        }
    }

    /// Back up `source`
    ///
    /// Picks the storage form, writes the artifact atomically and verifies it
    /// against the source checksum. A failed backup leaves no artifact and no
    /// deduplication reference behind.
    ///
    /// # Errors
    ///
    /// - [`BackstopError::Rollback`] with [`ErrorCode::SourceUnavailable`] if
    ///   the source is missing, not a file or unreadable
    /// - [`BackstopError::Rollback`] with [`ErrorCode::BackupWriteFailed`] if
    ///   the artifact cannot be written
    /// - [`BackstopError::Rollback`] with [`ErrorCode::ArtifactCorrupted`] if
    ///   the written artifact does not match the source
    /// - [`BackstopError::Checksum`] if the source cannot be hashed (e.g. too large)
    #[instrument(skip(self), fields(source = %source.display()))]
    pub async fn create_backup(&self, source: &Path) -> Result<BackupRecord> {
        let start = Instant::now();
        let source = utils::absolute(source);

        let metadata = tokio::fs::metadata(&source).await.map_err(|e| {
            BackstopError::rollback(
                ErrorCode::SourceUnavailable,
                "backup",
                &source,
                "Backup source does not exist or cannot be accessed",
            )
            .caused_by(e)
        })?;
        if !metadata.is_file() {
            return Err(BackstopError::rollback(
                ErrorCode::SourceUnavailable,
                "backup",
                &source,
                "Backup source is not a regular file",
            ));
        }
        if let Err(e) = tokio::fs::File::open(&source).await {
            return Err(BackstopError::rollback(
                ErrorCode::SourceUnavailable,
                "backup",
                &source,
                "Backup source is not readable",
            )
            .caused_by(e));
        }

        tokio::fs::create_dir_all(&self.directory).await.map_err(|e| {
            BackstopError::rollback(
                ErrorCode::BackupWriteFailed,
                "backup",
                &self.directory,
                "Cannot create backup directory",
            )
            .caused_by(e)
        })?;

        let source_record = self.checksum.compute(&source).await?;
        let original_size = source_record.file_size;
        let kind = self.storage_kind(original_size);
        let compression = (kind == BackupKind::Compressed).then(|| self.compression.algorithm());
        let created_at = Utc::now();
        let artifact = self
            .reserve_artifact_path(&source, created_at, kind, compression)
            .await;

        let written = match kind {
            BackupKind::Plain => self.write_plain(&source, &artifact).await,
            BackupKind::Compressed => self.write_compressed(&source, &artifact).await,
            BackupKind::Deduplicated => self.write_reference(&source, &artifact, created_at).await,
        }
        .map_err(|e| write_failed(&artifact, e))?;

        if let Err(e) = self
            .verify_artifact(&artifact, kind, compression, &written, &source_record)
            .await
        {
            warn!("Discarding unverifiable backup {:?}: {}", artifact, e);
            self.discard(&artifact, written.dedup.as_ref()).await;
            return Err(e);
        }
        if kind != BackupKind::Deduplicated {
            if let Err(e) = self.write_digest(&artifact, &source_record).await {
                self.discard(&artifact, None).await;
                return Err(write_failed(&artifact, e));
            }
        }

        let compression_ratio = (kind == BackupKind::Compressed && written.stored_size > 0)
            .then(|| original_size as f64 / written.stored_size as f64);

        info!(
            "Backed up {:?} as {} ({} -> {} bytes) in {:?}",
            source.file_name().unwrap_or_default(),
            kind,
            original_size,
            written.stored_size,
            start.elapsed()
        );

        Ok(BackupRecord {
            original_path: source,
            backup_path: artifact,
            created_at,
            kind,
            original_size,
            stored_size: written.stored_size,
            compression,
            compression_ratio,
            content_hash: source_record.hex(),
            algorithm: source_record.algorithm,
            dedup_reference_count: written.dedup.as_ref().map(|d| d.reference_count),
            success: true,
            error: None,
        })
    }

    async fn reserve_artifact_path(
        &self,
        source: &Path,
        created_at: DateTime<Utc>,
        kind: BackupKind,
        compression: Option<CompressionAlgorithm>,
    ) -> PathBuf {
        let mut collision = 0u32;
        loop {
            let candidate = self.directory.join(artifact_file_name(
                source,
                created_at,
                kind,
                compression,
                collision,
            ));
            match tokio::fs::try_exists(&candidate).await {
                Ok(true) if collision < u32::MAX => collision += 1,
                _ => return candidate,
            }
        }
    }

    async fn write_plain(&self, source: &Path, artifact: &Path) -> Result<WrittenArtifact> {
        let stored_size = utils::atomic_copy(source, artifact).await?;
        Ok(WrittenArtifact {
            stored_size,
            dedup: None,
        })
    }

    async fn write_compressed(&self, source: &Path, artifact: &Path) -> Result<WrittenArtifact> {
        let data = tokio::fs::read(source).await?;
        let engine = Arc::clone(&self.compression);
        let packed = tokio::task::spawn_blocking(move || engine.compress(&data))
            .await
            .map_err(|e| BackstopError::internal(format!("compression task failed: {}", e)))??;

        utils::atomic_write(artifact, &packed).await?;
        Ok(WrittenArtifact {
            stored_size: packed.len() as u64,
            dedup: None,
        })
    }

    async fn write_reference(
        &self,
        source: &Path,
        artifact: &Path,
        created_at: DateTime<Utc>,
    ) -> Result<WrittenArtifact> {
        let store = self
            .dedup
            .as_ref()
            .ok_or_else(|| BackstopError::internal("deduplication store is not configured"))?;
        let stored = store.store(source).await?;

        let reference = DeduplicationReference {
            kind: REFERENCE_TYPE.to_string(),
            original_path: source.to_path_buf(),
            content_hash: stored.content_hash.clone(),
            storage_path: stored.storage_path.clone(),
            reference_count: stored.reference_count,
            timestamp: created_at,
            algorithm: stored.algorithm,
        };
        if let Err(e) = utils::write_json_atomic(artifact, &reference).await {
            // Undo the reference we just added
            if let Err(release) = store.release(&stored.content_hash).await {
                warn!("Failed to release reference {}: {}", stored.content_hash, release);
            }
            return Err(e);
        }

        Ok(WrittenArtifact {
            stored_size: stored.size,
            dedup: Some(stored),
        })
    }

    async fn verify_artifact(
        &self,
        artifact: &Path,
        kind: BackupKind,
        compression: Option<CompressionAlgorithm>,
        written: &WrittenArtifact,
        source: &ChecksumRecord,
    ) -> Result<()> {
        let observed = match (kind, &written.dedup) {
            (BackupKind::Deduplicated, Some(dedup)) => {
                self.checksum
                    .compute_uncached(&dedup.storage_path, source.algorithm)
                    .await?
                    .hash
            }
            (BackupKind::Compressed, _) => {
                let algorithm = compression.unwrap_or(self.compression.algorithm());
                let content = self.decompress_artifact(artifact, algorithm).await?;
                source.algorithm.hash_bytes(&content)
            }
            _ => {
                self.checksum
                    .compute_uncached(artifact, source.algorithm)
                    .await?
                    .hash
            }
        };

        if observed != source.hash {
            return Err(BackstopError::rollback(
                ErrorCode::ArtifactCorrupted,
                "backup",
                artifact,
                "Backup artifact does not match its source",
            ));
        }
        debug!("Verified backup artifact {:?}", artifact);
        Ok(())
    }

    async fn decompress_artifact(&self, artifact: &Path, algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
        let data = tokio::fs::read(artifact).await.map_err(|e| {
            BackstopError::rollback(
                ErrorCode::ArtifactMissing,
                "restore",
                artifact,
                "Backup artifact cannot be read",
            )
            .caused_by(e)
        })?;

        let engine = Arc::clone(&self.compression);
        tokio::task::spawn_blocking(move || engine.decompress(&data, algorithm))
            .await
            .map_err(|e| BackstopError::internal(format!("decompression task failed: {}", e)))?
            .map_err(|e| {
                BackstopError::rollback(
                    ErrorCode::ArtifactCorrupted,
                    "restore",
                    artifact,
                    "Backup artifact cannot be decompressed",
                )
                .caused_by(e)
            })
    }

    async fn write_digest(&self, artifact: &Path, source: &ChecksumRecord) -> Result<()> {
        let path = digest_path(artifact);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let digest = ArtifactDigest {
            content_hash: source.hex(),
            algorithm: source.algorithm,
        };
        utils::write_json_atomic(&path, &digest).await
    }

    /// Recorded source digest of `artifact`, if there is a usable one
    async fn read_digest(&self, artifact: &Path) -> Option<(HashAlgorithm, Vec<u8>)> {
        let path = digest_path(artifact);
        let digest = match utils::read_json::<ArtifactDigest>(&path).await {
            Ok(digest) => digest?,
            Err(e) => {
                warn!("Ignoring unreadable digest record {:?}: {}", path, e);
                return None;
            }
        };
        match hex::decode(&digest.content_hash) {
            Ok(hash) => Some((digest.algorithm, hash)),
            Err(e) => {
                warn!("Ignoring invalid digest in {:?}: {}", path, e);
                None
            }
        }
    }

    async fn remove_digest(&self, artifact: &Path) {
        let path = digest_path(artifact);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to delete digest record {:?}: {}", path, e);
            }
        }
    }

    async fn discard(&self, artifact: &Path, dedup: Option<&DeduplicationResult>) {
        if let Err(e) = tokio::fs::remove_file(artifact).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to delete artifact {:?}: {}", artifact, e);
            }
        }
        self.remove_digest(artifact).await;
        if let (Some(store), Some(dedup)) = (&self.dedup, dedup) {
            if let Err(e) = store.release(&dedup.content_hash).await {
                warn!("Failed to release reference {}: {}", dedup.content_hash, e);
            }
        }
    }

    /// Read a deduplication reference document
    pub async fn read_reference(&self, artifact: &Path) -> Result<DeduplicationReference> {
        let raw = tokio::fs::read(artifact).await.map_err(|e| {
            BackstopError::rollback(
                ErrorCode::ArtifactMissing,
                "restore",
                artifact,
                "Backup artifact cannot be read",
            )
            .caused_by(e)
        })?;
        let reference: DeduplicationReference = serde_json::from_slice(&raw).map_err(|e| {
            BackstopError::rollback(
                ErrorCode::ArtifactCorrupted,
                "restore",
                artifact,
                "Deduplication reference is not valid JSON",
            )
            .caused_by(e)
        })?;
        if reference.kind != REFERENCE_TYPE {
            return Err(BackstopError::rollback(
                ErrorCode::ArtifactCorrupted,
                "restore",
                artifact,
                format!("Unexpected reference type '{}'", reference.kind),
            ));
        }
        Ok(reference)
    }

    /// Artifact content plus the digest it must have, when the artifact records one
    async fn load_artifact(
        &self,
        artifact: &Path,
        kind: BackupKind,
        compression: Option<CompressionAlgorithm>,
    ) -> Result<(Vec<u8>, Option<(HashAlgorithm, Vec<u8>)>)> {
        match kind {
            BackupKind::Plain => {
                let content = tokio::fs::read(artifact).await.map_err(|e| {
                    BackstopError::rollback(
                        ErrorCode::ArtifactMissing,
                        "restore",
                        artifact,
                        "Backup artifact cannot be read",
                    )
                    .caused_by(e)
                })?;
                Ok((content, self.read_digest(artifact).await))
            }
            BackupKind::Compressed => {
                let algorithm = compression.unwrap_or(self.compression.algorithm());
                let content = self.decompress_artifact(artifact, algorithm).await?;
                Ok((content, self.read_digest(artifact).await))
            }
            BackupKind::Deduplicated => {
                let reference = self.read_reference(artifact).await?;
                let expected = hex::decode(&reference.content_hash).map_err(|e| {
                    BackstopError::rollback(
                        ErrorCode::ArtifactCorrupted,
                        "restore",
                        artifact,
                        "Deduplication reference has an invalid content hash",
                    )
                    .caused_by(e)
                })?;
                let content = tokio::fs::read(&reference.storage_path).await.map_err(|e| {
                    BackstopError::rollback(
                        ErrorCode::ArtifactMissing,
                        "restore",
                        &reference.storage_path,
                        "Deduplicated content is missing",
                    )
                    .caused_by(e)
                })?;
                Ok((content, Some((reference.algorithm, expected))))
            }
        }
    }

    /// Restore `target` from `artifact`
    ///
    /// The current content of `target` (if any) is first saved as a plain
    /// safety backup. The artifact content is written atomically, the
    /// target's cached checksum is dropped and, with `verify_after_rollback`,
    /// the written file is re-hashed. On a mismatch the safety backup is put
    /// back before the error is raised.
    ///
    /// # Errors
    ///
    /// - [`ErrorCode::ArtifactMissing`] if the artifact (or its blob) is gone
    /// - [`ErrorCode::ArtifactCorrupted`] if it cannot be decoded
    /// - [`ErrorCode::RestoreWriteFailed`] if the target cannot be written
    /// - [`ErrorCode::VerificationFailed`] if the restored content is wrong
    #[instrument(skip(self), fields(target = %target.display(), artifact = %artifact.display()))]
    pub async fn restore_from_backup(&self, target: &Path, artifact: &Path) -> Result<RestoreResult> {
        let start = Instant::now();
        let target = utils::absolute(target);
        let artifact = utils::absolute(artifact);

        match tokio::fs::metadata(&artifact).await {
            Ok(m) if m.is_file() => {}
            Ok(_) => {
                return Err(BackstopError::rollback(
                    ErrorCode::ArtifactMissing,
                    "restore",
                    &artifact,
                    "Backup artifact is not a regular file",
                ))
            }
            Err(e) => {
                return Err(BackstopError::rollback(
                    ErrorCode::ArtifactMissing,
                    "restore",
                    &artifact,
                    "Backup artifact does not exist",
                )
                .caused_by(e))
            }
        }

        let parsed = artifact
            .file_name()
            .and_then(|n| parse_artifact_name(&n.to_string_lossy()));
        let (kind, compression) = parsed
            .map(|p| (p.kind, p.compression))
            .unwrap_or((BackupKind::Plain, None));

        let (content, expected) = self.load_artifact(&artifact, kind, compression).await?;

        let mut warnings = Vec::new();
        let safety_backup_path = match tokio::fs::metadata(&target).await {
            Ok(m) if m.is_file() => match self.write_safety_backup(&target).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Safety backup of {:?} failed, restoring anyway: {}", target, e);
                    warnings.push(format!("safety backup failed: {}", e));
                    None
                }
            },
            _ => None,
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BackstopError::rollback(
                    ErrorCode::RestoreWriteFailed,
                    "restore",
                    &target,
                    "Cannot create target directory",
                )
                .caused_by(e)
            })?;
        }
        utils::atomic_write(&target, &content).await.map_err(|e| {
            BackstopError::rollback(
                ErrorCode::RestoreWriteFailed,
                "restore",
                &target,
                "Cannot write restored content",
            )
            .caused_by(e)
        })?;
        self.checksum.invalidate(&target);

        let mut integrity_verified = false;
        if self.verify_after_rollback {
            let (algorithm, expected_hash) = match expected {
                Some(expected) => expected,
                None => {
                    let algorithm = self.checksum.algorithm();
                    (algorithm, algorithm.hash_bytes(&content))
                }
            };

            let observed = self.checksum.compute_uncached(&target, algorithm).await;
            let verified = matches!(&observed, Ok(record) if record.hash == expected_hash);
            if !verified {
                let reverted = self.revert(&target, safety_backup_path.as_deref()).await;
                warn!("Restore of {:?} failed verification (reverted: {})", target, reverted);
                return Err(BackstopError::rollback(
                    ErrorCode::VerificationFailed,
                    "restore",
                    &target,
                    if reverted {
                        "Restored content does not match the backup; previous contents were put back"
                    } else {
                        "Restored content does not match the backup"
                    },
                ));
            }
            integrity_verified = true;
        }

        info!(
            "Restored {:?} from {:?} ({} bytes, verified: {})",
            target.file_name().unwrap_or_default(),
            artifact.file_name().unwrap_or_default(),
            content.len(),
            integrity_verified
        );

        Ok(RestoreResult {
            target_path: target,
            backup_path: artifact,
            kind,
            bytes_written: content.len() as u64,
            integrity_verified,
            safety_backup_path,
            duration_ms: start.elapsed().as_millis() as u64,
            warnings,
        })
    }

    async fn write_safety_backup(&self, target: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self
            .reserve_artifact_path(target, Utc::now(), BackupKind::Plain, None)
            .await;
        utils::atomic_copy(target, &path).await?;
        let recorded = match self.checksum.compute_uncached(&path, self.checksum.algorithm()).await {
            Ok(record) => self.write_digest(&path, &record).await,
            Err(e) => Err(e),
        };
        if let Err(e) = recorded {
            debug!("No digest record for safety backup {:?}: {}", path, e);
        }
        debug!("Safety backup of {:?} written to {:?}", target, path);
        Ok(path)
    }

    /// Put the pre-restore state back; without a safety backup the target is removed
    async fn revert(&self, target: &Path, safety: Option<&Path>) -> bool {
        let reverted = match safety {
            Some(safety) => utils::atomic_copy(safety, target).await.is_ok(),
            None => tokio::fs::remove_file(target).await.is_ok(),
        };
        self.checksum.invalidate(target);
        reverted && safety.is_some()
    }

    /// Delete artifacts older than the retention period
    ///
    /// Age is judged by the artifact's modification time. Deleting a
    /// deduplicated artifact releases its reference in the store. A missing
    /// backup directory yields zero counts.
    #[instrument(skip(self))]
    pub async fn cleanup_backups(&self) -> Result<CleanupStats> {
        let mut stats = CleanupStats::default();
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };
        let now = SystemTime::now();

        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            stats.scanned += 1;

            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(parsed) = parse_artifact_name(&name) else {
                stats.skipped += 1;
                continue;
            };

            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    stats.errors.push(format!("{}: {}", name, e));
                    continue;
                }
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= self.retention {
                stats.kept += 1;
                continue;
            }

            let path = entry.path();
            let reference = if parsed.kind == BackupKind::Deduplicated {
                self.read_reference(&path).await.ok()
            } else {
                None
            };

            if let Err(e) = tokio::fs::remove_file(&path).await {
                stats.errors.push(format!("{}: {}", name, e));
                continue;
            }
            stats.deleted += 1;
            stats.bytes_reclaimed += metadata.len();
            if parsed.kind != BackupKind::Deduplicated {
                self.remove_digest(&path).await;
            }

            if let (Some(store), Some(reference)) = (&self.dedup, reference) {
                match store.release(&reference.content_hash).await {
                    Ok(Some(outcome)) => stats.bytes_reclaimed += outcome.bytes_freed,
                    Ok(None) => {}
                    Err(e) => stats.errors.push(format!("{}: {}", name, e)),
                }
            }
        }

        info!(
            "Backup cleanup: {} deleted, {} kept, {} skipped, {} reclaimed",
            stats.deleted,
            stats.kept,
            stats.skipped,
            utils::format_bytes(stats.bytes_reclaimed)
        );
        Ok(stats)
    }

    /// Artifacts in the backup directory, newest first
    ///
    /// With `original`, only artifacts of files with the same file name.
    pub async fn list_backups(&self, original: Option<&Path>) -> Result<Vec<BackupArtifact>> {
        let wanted = original.and_then(|p| p.file_name()).map(|n| n.to_string_lossy().into_owned());
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(parsed) = parse_artifact_name(&name) else {
                continue;
            };
            if wanted.as_deref().is_some_and(|w| w != parsed.original_name) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            artifacts.push(BackupArtifact {
                path: entry.path(),
                original_name: parsed.original_name,
                created_at: parsed.created_at,
                kind: parsed.kind,
                compression: parsed.compression,
                size: metadata.len(),
            });
        }

        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.path.cmp(&a.path)));
        Ok(artifacts)
    }
}

/// Wrap a write-phase failure as a rollback error unless it already is a domain error
fn write_failed(artifact: &Path, e: BackstopError) -> BackstopError {
    if e.is_rollback() || e.is_checksum() {
        e
    } else {
        BackstopError::rollback(
            ErrorCode::BackupWriteFailed,
            "backup",
            artifact,
            "Cannot write backup artifact",
        )
        .caused_by(e)
    }
}
