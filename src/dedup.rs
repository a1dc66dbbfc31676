//! Content-addressable deduplication store
//!
//! Identical file contents are stored once, addressed by their digest, with a
//! reference count per content. The store backs deduplicated backups: the
//! backup artifact is a small JSON reference and the bytes live here.
//!
//! ## Layout
//!
//! ```text
//! <dedup root>/
//! ├── dedup-index.json      # Index: entries, counters, last update
//! └── objects/
//!     └── <prefix>/         # First 2 hex chars of the digest
//!         └── <suffix>      # Remaining hex chars
//! ```
//!
//! ## Index persistence
//!
//! The index is loaded when the store opens and rewritten (atomically) after
//! every mutation, while the store's lock is still held, so there is exactly
//! one writer. An index that does not parse is logged with `warn!` and
//! replaced with an empty one; blobs already on disk are left untouched.
//!
//! ## Invariants
//!
//! - Every entry has `reference_count >= 1`; releasing the last reference
//!   removes the entry and its blob.
//! - A blob's content always hashes to its address. Content that changes
//!   while it is being stored is rejected rather than stored under a stale
//!   address. Blobs are written read-only, and a blob that no longer hashes
//!   to its address is rewritten from the next source that references it.

use crate::checksum::{ChecksumEngine, HashAlgorithm};
use crate::config::DeduplicationConfig;
use crate::error::{BackstopError, ErrorCode, Result};
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

/// Index format version
const INDEX_VERSION: u32 = 1;

/// Index file name inside the store root
pub const INDEX_FILE: &str = "dedup-index.json";

/// One stored content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeduplicationEntry {
    /// Hex digest (the content address)
    pub content_hash: String,
    /// Blob location
    pub storage_path: PathBuf,
    /// Backups and files referring to this content
    pub reference_count: u64,
    /// Content size in bytes
    pub size: u64,
    /// When the content was first stored
    pub first_seen_at: DateTime<Utc>,
    /// When a reference was last added
    pub last_referenced_at: DateTime<Utc>,
}

/// Store-wide counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DeduplicationStats {
    /// Distinct contents stored
    pub unique_contents: usize,
    /// Sum of all reference counts
    pub total_references: u64,
    /// Bytes occupied by blobs
    pub bytes_stored: u64,
    /// Bytes that were not stored again because the content already existed
    pub bytes_saved: u64,
    /// Duplicates materialized as hard links
    pub hard_links_created: u64,
    /// Duplicates materialized as copies
    pub copies_made: u64,
    /// Times a corrupt index was replaced with an empty one
    pub index_reinitializations: u64,
}

/// Persisted index document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeduplicationIndex {
    version: u32,
    total_entries: usize,
    last_updated: DateTime<Utc>,
    entries: BTreeMap<String, DeduplicationEntry>,
    stats: DeduplicationStats,
}

impl DeduplicationIndex {
    fn empty() -> Self {
        Self {
            version: INDEX_VERSION,
            total_entries: 0,
            last_updated: Utc::now(),
            entries: BTreeMap::new(),
            stats: DeduplicationStats::default(),
        }
    }

    fn refresh_totals(&mut self) {
        self.total_entries = self.entries.len();
        self.stats.unique_contents = self.entries.len();
        self.stats.total_references = self.entries.values().map(|e| e.reference_count).sum();
        self.stats.bytes_stored = self.entries.values().map(|e| e.size).sum();
        self.last_updated = Utc::now();
    }
}

/// Result of deduplicating one file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeduplicationResult {
    /// File that was deduplicated
    pub file_path: PathBuf,
    /// Content address
    pub content_hash: String,
    /// Algorithm of the content address
    pub algorithm: HashAlgorithm,
    /// Content was not in the store before
    pub is_new_entry: bool,
    /// References after this call
    pub reference_count: u64,
    /// Bytes not stored again (0 for new content)
    pub space_saved: u64,
    /// Blob location
    pub storage_path: PathBuf,
    /// Content size
    pub size: u64,
    /// How the caller's file now relates to the blob, when it was replaced
    pub link: Option<LinkMode>,
}

/// How stored content was materialized at a destination
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Destination is a hard link to the blob
    HardLink,
    /// Destination is an independent copy
    Copy,
}

/// Content-addressable store with reference counting
#[derive(Debug)]
pub struct DeduplicationStore {
    root: PathBuf,
    algorithm: HashAlgorithm,
    prefer_hard_links: bool,
    checksum: Arc<ChecksumEngine>,
    index: Mutex<DeduplicationIndex>,
}

impl DeduplicationStore {
    /// Open (or create) a store rooted at `root`
    ///
    /// A missing index starts empty. A corrupt one is replaced with an empty
    /// index and a warning is logged.
    #[instrument(skip(config, checksum), fields(root = %root.display()))]
    pub async fn open(
        root: PathBuf,
        config: &DeduplicationConfig,
        checksum: Arc<ChecksumEngine>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(root.join("objects")).await?;
        let index_path = root.join(INDEX_FILE);

        let index = match utils::read_json::<DeduplicationIndex>(&index_path).await {
            Ok(Some(index)) => {
                debug!("Loaded deduplication index with {} entries", index.entries.len());
                index
            }
            Ok(None) => {
                info!("Initializing deduplication store at {:?}", root);
                let index = DeduplicationIndex::empty();
                utils::write_json_atomic(&index_path, &index).await?;
                index
            }
            Err(e) => {
                warn!(
                    "Deduplication index {:?} is unreadable, starting with an empty index: {}",
                    index_path, e
                );
                let mut index = DeduplicationIndex::empty();
                index.stats.index_reinitializations = 1;
                utils::write_json_atomic(&index_path, &index).await?;
                index
            }
        };

        Ok(Self {
            root,
            algorithm: config.algorithm,
            prefer_hard_links: config.prefer_hard_links,
            checksum,
            index: Mutex::new(index),
        })
    }

    /// Store root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Content address algorithm
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Blob location for a content address
    pub fn blob_path(&self, hash: &str) -> PathBuf {
        let (prefix, suffix) = hash.split_at(2.min(hash.len()));
        self.root.join("objects").join(prefix).join(suffix)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Add a reference to the content of `path`, storing it if new
    ///
    /// The caller's file is left untouched. Returns the entry state after the
    /// reference was added.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn store(&self, path: &Path) -> Result<DeduplicationResult> {
        let record = self.checksum.compute_with(path, self.algorithm).await?;
        let hash = record.hex();
        let blob = self.blob_path(&hash);

        let mut index = self.index.lock().await;
        let now = Utc::now();

        let result = if let Some(entry) = index.entries.get(&hash).cloned() {
            // Content known; put the blob back if it went missing or was altered
            if !self.blob_matches(&blob, &hash).await {
                warn!(
                    "Blob {} is missing or damaged, storing it again",
                    &hash[..8.min(hash.len())]
                );
                self.write_blob(path, &hash, &blob).await?;
            }

            let reference_count = entry.reference_count + 1;
            if let Some(e) = index.entries.get_mut(&hash) {
                e.reference_count = reference_count;
                e.last_referenced_at = now;
            }
            index.stats.bytes_saved += entry.size;
            debug!(
                "Content {} already stored, {} references",
                &hash[..8.min(hash.len())],
                reference_count
            );

            DeduplicationResult {
                file_path: record.file_path.clone(),
                content_hash: hash.clone(),
                algorithm: self.algorithm,
                is_new_entry: false,
                reference_count,
                space_saved: entry.size,
                storage_path: blob,
                size: entry.size,
                link: None,
            }
        } else {
            self.write_blob(path, &hash, &blob).await?;
            index.entries.insert(
                hash.clone(),
                DeduplicationEntry {
                    content_hash: hash.clone(),
                    storage_path: blob.clone(),
                    reference_count: 1,
                    size: record.file_size,
                    first_seen_at: now,
                    last_referenced_at: now,
                },
            );
            debug!("Stored new content {} ({} bytes)", &hash[..8.min(hash.len())], record.file_size);

            DeduplicationResult {
                file_path: record.file_path.clone(),
                content_hash: hash.clone(),
                algorithm: self.algorithm,
                is_new_entry: true,
                reference_count: 1,
                space_saved: 0,
                storage_path: blob,
                size: record.file_size,
                link: None,
            }
        };

        index.refresh_totals();
        utils::write_json_atomic(&self.index_path(), &*index).await?;
        Ok(result)
    }

    /// Deduplicate a file in place
    ///
    /// Adds a reference like [`store`](Self::store). When the content was
    /// already stored, the caller's file is replaced by a hard link to the
    /// blob (or a copy of it when hard links are disabled or unsupported), so
    /// the bytes exist once on disk. Blobs are read-only, so a linked file
    /// must be replaced rather than rewritten in place.
    pub async fn deduplicate(&self, path: &Path) -> Result<DeduplicationResult> {
        let mut result = self.store(path).await?;
        if !result.is_new_entry {
            result.link = Some(self.materialize(&result.content_hash, path).await?);
        }
        Ok(result)
    }

    async fn write_blob(&self, source: &Path, hash: &str, blob: &Path) -> Result<()> {
        if let Some(parent) = blob.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        utils::atomic_copy(source, blob).await?;

        // The source may have changed after it was hashed
        let stored = self.checksum.compute_uncached(blob, self.algorithm).await?;
        if stored.hex() != hash {
            let _ = tokio::fs::remove_file(blob).await;
            return Err(BackstopError::rollback(
                ErrorCode::SourceUnavailable,
                "deduplicate",
                source,
                "Source changed while it was being stored",
            ));
        }

        let mut permissions = tokio::fs::metadata(blob).await?.permissions();
        permissions.set_readonly(true);
        tokio::fs::set_permissions(blob, permissions).await?;

        trace!("Wrote blob {:?}", blob);
        Ok(())
    }

    async fn blob_matches(&self, blob: &Path, hash: &str) -> bool {
        match self.checksum.compute_uncached(blob, self.algorithm).await {
            Ok(record) => record.hex() == hash,
            Err(e) => {
                trace!("Cannot hash blob {:?}: {}", blob, e);
                false
            }
        }
    }

    /// Place the content `hash` at `dest`, replacing it atomically
    ///
    /// Uses a hard link when preferred and possible, a copy otherwise.
    pub async fn materialize(&self, hash: &str, dest: &Path) -> Result<LinkMode> {
        let blob = self.blob_path(hash);
        if tokio::fs::metadata(&blob).await.is_err() {
            return Err(BackstopError::rollback(
                ErrorCode::ArtifactMissing,
                "materialize",
                &blob,
                "Stored content is missing",
            ));
        }

        let dest_permissions = tokio::fs::metadata(dest).await.ok().map(|m| m.permissions());
        let mode = if self.prefer_hard_links && self.try_hard_link(&blob, dest).await {
            LinkMode::HardLink
        } else {
            utils::atomic_copy(&blob, dest).await?;
            // A copy belongs to the caller and keeps the caller's permissions
            if let Some(permissions) = dest_permissions {
                tokio::fs::set_permissions(dest, permissions).await?;
            }
            LinkMode::Copy
        };

        let mut index = self.index.lock().await;
        match mode {
            LinkMode::HardLink => index.stats.hard_links_created += 1,
            LinkMode::Copy => index.stats.copies_made += 1,
        }
        index.last_updated = Utc::now();
        utils::write_json_atomic(&self.index_path(), &*index).await?;
        Ok(mode)
    }

    async fn try_hard_link(&self, blob: &Path, dest: &Path) -> bool {
        let temp = utils::temp_sibling(dest);
        if let Err(e) = tokio::fs::hard_link(blob, &temp).await {
            debug!("Hard link to {:?} failed, copying instead: {}", dest, e);
            return false;
        }
        if let Err(e) = tokio::fs::rename(&temp, dest).await {
            debug!("Replacing {:?} with hard link failed: {}", dest, e);
            let _ = tokio::fs::remove_file(&temp).await;
            return false;
        }
        true
    }

    /// Read stored content
    pub async fn load(&self, hash: &str) -> Result<Vec<u8>> {
        let blob = self.blob_path(hash);
        tokio::fs::read(&blob).await.map_err(|e| {
            BackstopError::rollback(
                ErrorCode::ArtifactMissing,
                "restore",
                &blob,
                "Stored content is missing or unreadable",
            )
            .caused_by(e)
        })
    }

    /// Drop one reference to `hash`
    ///
    /// Returns the remaining count, or `None` if the hash is unknown. When the
    /// last reference goes, the entry and its blob are removed and the blob's
    /// size is reported through [`ReleaseOutcome::bytes_freed`].
    pub async fn release(&self, hash: &str) -> Result<Option<ReleaseOutcome>> {
        let mut index = self.index.lock().await;
        let Some(entry) = index.entries.get_mut(hash) else {
            return Ok(None);
        };

        entry.reference_count = entry.reference_count.saturating_sub(1);
        let remaining = entry.reference_count;
        let mut bytes_freed = 0;

        if remaining == 0 {
            if let Some(entry) = index.entries.remove(hash) {
                match tokio::fs::remove_file(&entry.storage_path).await {
                    Ok(()) => bytes_freed = entry.size,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to delete blob {:?}: {}", entry.storage_path, e),
                }
                if let Some(shard) = entry.storage_path.parent() {
                    // Only succeeds when the shard is empty
                    let _ = tokio::fs::remove_dir(shard).await;
                }
            }
            debug!("Released last reference to {}", &hash[..8.min(hash.len())]);
        }

        index.refresh_totals();
        utils::write_json_atomic(&self.index_path(), &*index).await?;
        Ok(Some(ReleaseOutcome {
            remaining,
            bytes_freed,
        }))
    }

    /// Entry for `hash`, if stored
    pub async fn entry(&self, hash: &str) -> Option<DeduplicationEntry> {
        self.index.lock().await.entries.get(hash).cloned()
    }

    /// Store statistics
    pub async fn stats(&self) -> DeduplicationStats {
        self.index.lock().await.stats.clone()
    }
}

/// Result of releasing a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// References left
    pub remaining: u64,
    /// Blob bytes deleted (non-zero only when the last reference went)
    pub bytes_freed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, ChecksumConfig};
    use std::fs;
    use tempfile::TempDir;

    async fn open_store(root: &Path, prefer_hard_links: bool) -> DeduplicationStore {
        let checksum = Arc::new(ChecksumEngine::new(
            &ChecksumConfig::default(),
            &CacheConfig::default(),
        ));
        let config = DeduplicationConfig {
            enabled: true,
            prefer_hard_links,
            ..Default::default()
        };
        DeduplicationStore::open(root.join("dedup"), &config, checksum)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_counts_references() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), true).await;
        let a = temp.path().join("a.css");
        let b = temp.path().join("b.css");
        fs::write(&a, b".shared{}").unwrap();
        fs::write(&b, b".shared{}").unwrap();

        let first = store.store(&a).await.unwrap();
        assert!(first.is_new_entry);
        assert_eq!(first.reference_count, 1);
        assert_eq!(first.space_saved, 0);
        assert_eq!(fs::read(&first.storage_path).unwrap(), b".shared{}");

        let second = store.store(&b).await.unwrap();
        assert!(!second.is_new_entry);
        assert_eq!(second.reference_count, 2);
        assert_eq!(second.space_saved, 9);
        assert_eq!(second.content_hash, first.content_hash);

        let stats = store.stats().await;
        assert_eq!(stats.unique_contents, 1);
        assert_eq!(stats.total_references, 2);
        assert_eq!(stats.bytes_saved, 9);
    }

    #[tokio::test]
    async fn test_blob_layout_is_sharded() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), true).await;
        let hash = "abcdef0123";
        assert_eq!(
            store.blob_path(hash),
            temp.path().join("dedup/objects/ab/cdef0123")
        );
    }

    #[tokio::test]
    async fn test_release_removes_blob_at_zero() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), true).await;
        let a = temp.path().join("a.css");
        fs::write(&a, b"x".repeat(100)).unwrap();

        let r = store.store(&a).await.unwrap();
        store.store(&a).await.unwrap();

        let outcome = store.release(&r.content_hash).await.unwrap().unwrap();
        assert_eq!(outcome.remaining, 1);
        assert_eq!(outcome.bytes_freed, 0);
        assert!(r.storage_path.exists());

        let outcome = store.release(&r.content_hash).await.unwrap().unwrap();
        assert_eq!(outcome.remaining, 0);
        assert_eq!(outcome.bytes_freed, 100);
        assert!(!r.storage_path.exists());
        assert!(store.entry(&r.content_hash).await.is_none());

        assert!(store.release(&r.content_hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deduplicate_replaces_duplicate_with_link() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), true).await;
        let a = temp.path().join("a.css");
        let b = temp.path().join("b.css");
        fs::write(&a, b"body{}").unwrap();
        fs::write(&b, b"body{}").unwrap();

        let first = store.deduplicate(&a).await.unwrap();
        assert_eq!(first.link, None);

        let second = store.deduplicate(&b).await.unwrap();
        assert!(matches!(second.link, Some(LinkMode::HardLink) | Some(LinkMode::Copy)));
        assert_eq!(fs::read(&b).unwrap(), b"body{}");

        #[cfg(unix)]
        if second.link == Some(LinkMode::HardLink) {
            use std::os::unix::fs::MetadataExt;
            let blob_ino = fs::metadata(&second.storage_path).unwrap().ino();
            assert_eq!(fs::metadata(&b).unwrap().ino(), blob_ino);
        }
    }

    #[tokio::test]
    async fn test_copy_mode_when_links_disabled() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), false).await;
        let a = temp.path().join("a.css");
        let b = temp.path().join("b.css");
        fs::write(&a, b"p{}").unwrap();
        fs::write(&b, b"p{}").unwrap();

        store.deduplicate(&a).await.unwrap();
        let second = store.deduplicate(&b).await.unwrap();
        assert_eq!(second.link, Some(LinkMode::Copy));
        assert_eq!(store.stats().await.copies_made, 1);
    }

    #[tokio::test]
    async fn test_index_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.css");
        fs::write(&a, b"h1{}").unwrap();

        let hash = {
            let store = open_store(temp.path(), true).await;
            store.store(&a).await.unwrap();
            store.store(&a).await.unwrap().content_hash
        };

        let store = open_store(temp.path(), true).await;
        assert_eq!(store.entry(&hash).await.unwrap().reference_count, 2);
    }

    #[tokio::test]
    async fn test_corrupt_index_reinitialized() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("dedup")).unwrap();
        fs::write(temp.path().join("dedup").join(INDEX_FILE), b"{ broken").unwrap();

        let store = open_store(temp.path(), true).await;
        let stats = store.stats().await;
        assert_eq!(stats.unique_contents, 0);
        assert_eq!(stats.index_reinitializations, 1);

        // The rewritten index parses again
        let raw = fs::read_to_string(temp.path().join("dedup").join(INDEX_FILE)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["version"], 1);
        assert_eq!(parsed["totalEntries"], 0);
    }

    #[tokio::test]
    async fn test_missing_blob_is_restored_on_next_store() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), true).await;
        let a = temp.path().join("a.css");
        fs::write(&a, b"div{}").unwrap();

        let r = store.store(&a).await.unwrap();
        fs::remove_file(&r.storage_path).unwrap();

        store.store(&a).await.unwrap();
        assert_eq!(store.load(&r.content_hash).await.unwrap(), b"div{}");
    }

    #[tokio::test]
    async fn test_damaged_blob_is_rewritten_on_next_store() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), true).await;
        let a = temp.path().join("a.css");
        fs::write(&a, b"span{}").unwrap();

        let r = store.store(&a).await.unwrap();
        assert!(fs::metadata(&r.storage_path).unwrap().permissions().readonly());

        fs::remove_file(&r.storage_path).unwrap();
        fs::write(&r.storage_path, b"SPAN{}").unwrap();

        let second = store.store(&a).await.unwrap();
        assert_eq!(second.reference_count, 2);
        assert_eq!(store.load(&r.content_hash).await.unwrap(), b"span{}");
        assert!(fs::metadata(&r.storage_path).unwrap().permissions().readonly());
    }

    #[tokio::test]
    async fn test_copy_keeps_caller_permissions() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), false).await;
        let a = temp.path().join("a.css");
        let b = temp.path().join("b.css");
        fs::write(&a, b"em{}").unwrap();
        fs::write(&b, b"em{}").unwrap();

        let first = store.deduplicate(&a).await.unwrap();
        store.deduplicate(&b).await.unwrap();
        assert!(!fs::metadata(&b).unwrap().permissions().readonly());

        fs::write(&b, b"strong{}").unwrap();
        assert_eq!(store.load(&first.content_hash).await.unwrap(), b"em{}");
    }
}
