//! Integration tests for Backstop
//!
//! End-to-end scenarios through the [`Backstop`] facade: backup before a
//! rewrite, rollback after a bad rewrite, deduplicated and compressed
//! storage, backup strategies and batch runs over a generated project.

use ::backstop::*;
use filetime::FileTime;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// Test harness owning a project directory and an engine rooted in it
pub struct BackstopTestHarness {
    pub temp_dir: TempDir,
    pub backstop: Backstop,
}

impl BackstopTestHarness {
    /// Engine with default settings
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Engine with a tweaked configuration
    pub async fn with_config(tweak: impl FnOnce(&mut BackstopConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = BackstopConfig {
            root: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        tweak(&mut config);
        let backstop = Backstop::new(config).await.unwrap();
        Self { temp_dir, backstop }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Write `content` to a project-relative path, creating parents
    pub fn write(&self, relative: &str, content: impl AsRef<[u8]>) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    /// Generate `count` stylesheets under `src/`
    pub fn generate_stylesheets(&self, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                self.write(
                    &format!("src/components/c{:03}.css", i),
                    format!(".c{i} {{ padding: {i}px; margin: {}px; }}\n", i * 2),
                )
            })
            .collect()
    }
}

/// Compressible stylesheet body of roughly `bytes` bytes
fn stylesheet(bytes: usize) -> String {
    let rule = ".btn { color: #1f2937; background: #f3f4f6; padding: 0.5rem 1rem; }\n";
    rule.repeat(bytes / rule.len() + 1)
}

#[tokio::test]
async fn test_backup_before_rewrite_then_rollback() {
    let harness = BackstopTestHarness::new().await;
    let css = harness.write("dist/app.css", ".a { color: red; }\n");

    let before = harness.backstop.calculate_checksum(&css).await.unwrap();
    let backup = harness.backstop.create_backup(&css).await.unwrap();
    assert!(backup.success);
    assert_eq!(backup.content_hash, before.hex());

    // A tool rewrites the stylesheet and breaks it
    fs::write(&css, ".a { color: red;\n/* truncated */").unwrap();
    let outcome = harness.backstop.validate_file(&css, before.hex()).await;
    assert!(!outcome.is_valid);

    let restored = harness
        .backstop
        .restore_from_backup(&css, &backup.backup_path)
        .await
        .unwrap();
    assert!(restored.integrity_verified);
    assert_eq!(fs::read_to_string(&css).unwrap(), ".a { color: red; }\n");

    // The broken state was preserved as a safety backup
    let safety = restored.safety_backup_path.unwrap();
    assert_eq!(
        fs::read_to_string(&safety).unwrap(),
        ".a { color: red;\n/* truncated */"
    );

    let after = harness.backstop.validate_file(&css, &before).await;
    assert!(after.is_valid);
}

#[tokio::test]
async fn test_roundtrip_for_every_storage_kind() {
    let harness = BackstopTestHarness::with_config(|c| {
        c.deduplication.enabled = true;
        c.deduplication.threshold = 4096;
        c.compression.threshold = 512;
    })
    .await;

    let plain = harness.write("tiny.css", ".t{}");
    let compressed = harness.write("medium.css", stylesheet(1500));
    let deduplicated = harness.write("large.css", stylesheet(8000));

    let expectations = [
        (&plain, BackupKind::Plain),
        (&compressed, BackupKind::Compressed),
        (&deduplicated, BackupKind::Deduplicated),
    ];

    for (path, kind) in expectations {
        let original = fs::read(path).unwrap();
        let record = harness.backstop.create_backup(path).await.unwrap();
        assert_eq!(record.kind, kind, "{:?}", path);

        fs::write(path, b"overwritten").unwrap();
        let restored = harness
            .backstop
            .restore_from_backup(path, &record.backup_path)
            .await
            .unwrap();
        assert_eq!(restored.kind, kind);
        assert!(restored.integrity_verified);
        assert_eq!(fs::read(path).unwrap(), original);
    }
}

#[tokio::test]
async fn test_identical_files_share_one_blob() {
    let harness = BackstopTestHarness::with_config(|c| {
        c.deduplication.enabled = true;
        c.deduplication.threshold = 1024;
    })
    .await;

    let body = "x".repeat(5 * 1024);
    let first = harness.write("a/theme.css", &body);
    let second = harness.write("b/theme.css", &body);

    let one = harness.backstop.create_backup(&first).await.unwrap();
    let two = harness.backstop.create_backup(&second).await.unwrap();
    assert_eq!(one.kind, BackupKind::Deduplicated);
    assert_eq!(one.dedup_reference_count, Some(1));
    assert_eq!(two.dedup_reference_count, Some(2));
    assert_eq!(one.content_hash, two.content_hash);

    let stats = harness.backstop.get_deduplication_stats().await.unwrap();
    assert_eq!(stats.unique_contents, 1);
    assert_eq!(stats.total_references, 2);
    assert_eq!(stats.bytes_stored, 5 * 1024);
    assert_eq!(stats.bytes_saved, 5 * 1024);

    // Reference documents point at the same blob
    let reference: DeduplicationReference =
        serde_json::from_slice(&fs::read(&two.backup_path).unwrap()).unwrap();
    assert_eq!(reference.kind, "deduplication_reference");
    assert_eq!(reference.content_hash, one.content_hash);
    assert_eq!(reference.reference_count, 2);
}

#[tokio::test]
async fn test_deduplicate_file_in_place() {
    let harness = BackstopTestHarness::with_config(|c| c.deduplication.enabled = true).await;
    let body = stylesheet(4096);
    let first = harness.write("one.css", &body);
    let second = harness.write("two.css", &body);

    let stored = harness.backstop.deduplicate_file(&first).await.unwrap();
    assert!(stored.is_new_entry);
    assert_eq!(stored.space_saved, 0);
    assert!(stored.link.is_none());

    let linked = harness.backstop.deduplicate_file(&second).await.unwrap();
    assert!(!linked.is_new_entry);
    assert_eq!(linked.reference_count, 2);
    assert_eq!(linked.space_saved, body.len() as u64);
    assert!(linked.link.is_some());
    assert_eq!(fs::read_to_string(&second).unwrap(), body);
}

#[tokio::test]
async fn test_compression_threshold_and_ratio() {
    let harness = BackstopTestHarness::with_config(|c| {
        c.compression.algorithm = CompressionAlgorithm::Brotli;
        c.compression.level = 9;
        c.compression.threshold = 2048;
    })
    .await;

    let small = harness.write("small.css", stylesheet(1000));
    let large = harness.write("large.css", stylesheet(20_000));

    let small_record = harness.backstop.create_backup(&small).await.unwrap();
    assert_eq!(small_record.kind, BackupKind::Plain);
    assert!(small_record.compression_ratio.is_none());

    let large_record = harness.backstop.create_backup(&large).await.unwrap();
    assert_eq!(large_record.kind, BackupKind::Compressed);
    assert_eq!(large_record.compression, Some(CompressionAlgorithm::Brotli));
    assert!(large_record.compression_ratio.unwrap() > 1.0);
    assert!(large_record.stored_size < large_record.original_size);
    assert!(large_record
        .backup_path
        .to_string_lossy()
        .ends_with(".css.backup.br"));

    let stats = harness.backstop.get_compression_stats();
    assert_eq!(stats.files_compressed, 1);
    assert!(stats.compression_ratio() > 1.0);
}

#[tokio::test]
async fn test_storage_policy_compression_first() {
    let harness = BackstopTestHarness::with_config(|c| {
        c.deduplication.enabled = true;
        c.deduplication.threshold = 1024;
        c.compression.threshold = 1024;
        c.backup.storage_policy = StoragePolicy::CompressionFirst;
    })
    .await;

    let file = harness.write("both.css", stylesheet(4096));
    let record = harness.backstop.create_backup(&file).await.unwrap();
    assert_eq!(record.kind, BackupKind::Compressed);
    assert_eq!(
        harness.backstop.get_deduplication_stats().await.unwrap().unique_contents,
        0
    );
}

#[tokio::test]
async fn test_checksum_cache_follows_modification_time() {
    let harness = BackstopTestHarness::new().await;
    let file = harness.write("cached.css", ".c{}");

    let first = harness.backstop.calculate_checksum(&file).await.unwrap();
    let second = harness.backstop.calculate_checksum(&file).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(harness.backstop.get_cache_stats().hits, 1);

    // Same content, newer mtime: the entry is stale
    let later = FileTime::from_system_time(SystemTime::now() + Duration::from_secs(60));
    filetime::set_file_mtime(&file, later).unwrap();
    let third = harness.backstop.calculate_checksum(&file).await.unwrap();
    assert_eq!(third.hash, first.hash);

    let stats = harness.backstop.get_cache_stats();
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.invalidations, 1);

    harness.backstop.invalidate_checksum(&file);
    harness.backstop.calculate_checksum(&file).await.unwrap();
    assert_eq!(harness.backstop.get_cache_stats().misses, 3);
}

#[tokio::test]
async fn test_compare_and_algorithms() {
    let harness = BackstopTestHarness::new().await;
    let a = harness.write("a.css", ".same{}");
    let b = harness.write("b.css", ".same{}");
    let c = harness.write("c.css", ".other{}");

    assert!(harness.backstop.compare_files(&a, &b).await.unwrap().identical);
    assert!(!harness.backstop.compare_files(&a, &c).await.unwrap().identical);

    let md5 = harness
        .backstop
        .calculate_checksum_with(&a, HashAlgorithm::Md5)
        .await
        .unwrap();
    assert_eq!(md5.hash.len(), 16);
    assert!(harness.backstop.validate_file(&a, md5.hex()).await.is_valid);

    let outcomes = harness
        .backstop
        .validate_batch(vec![
            (a.clone(), ExpectedChecksum::from(md5.hex())),
            (harness.root().join("missing.css"), ExpectedChecksum::from(md5.hex())),
        ])
        .await
        .unwrap();
    assert!(outcomes[0].is_valid);
    assert!(!outcomes[1].is_valid);
    assert!(outcomes[1].error.is_some());
}

#[tokio::test]
async fn test_cleanup_respects_retention() {
    let harness = BackstopTestHarness::with_config(|c| {
        c.backup.retention_days = 7;
        c.deduplication.enabled = true;
        c.deduplication.threshold = 1024;
    })
    .await;

    let fresh = harness.write("fresh.css", ".f{}");
    let old = harness.write("old.css", ".o{}");
    let shared = harness.write("shared.css", stylesheet(2048));

    let fresh_record = harness.backstop.create_backup(&fresh).await.unwrap();
    let old_record = harness.backstop.create_backup(&old).await.unwrap();
    let dedup_record = harness.backstop.create_backup(&shared).await.unwrap();
    assert_eq!(dedup_record.kind, BackupKind::Deduplicated);

    // A stray file in the backup directory is never touched
    let stray = harness.root().join(".backups/README.txt");
    fs::write(&stray, "keep me").unwrap();

    let ten_days_ago = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(10 * 86_400));
    filetime::set_file_mtime(&old_record.backup_path, ten_days_ago).unwrap();
    filetime::set_file_mtime(&dedup_record.backup_path, ten_days_ago).unwrap();

    let stats = harness.backstop.cleanup_backups().await.unwrap();
    assert_eq!(stats.deleted, 2);
    assert_eq!(stats.kept, 1);
    assert_eq!(stats.skipped, 1);
    assert!(stats.errors.is_empty());
    assert!(stats.bytes_reclaimed >= 2048);

    assert!(fresh_record.backup_path.exists());
    assert!(!old_record.backup_path.exists());
    assert!(!dedup_record.backup_path.exists());
    assert!(stray.exists());

    let dedup = harness.backstop.get_deduplication_stats().await.unwrap();
    assert_eq!(dedup.unique_contents, 0);
    assert_eq!(dedup.total_references, 0);
}

#[tokio::test]
async fn test_list_backups_newest_first() {
    let harness = BackstopTestHarness::new().await;
    let app = harness.write("app.css", ".a{}");
    let other = harness.write("other.css", ".o{}");

    let first = harness.backstop.create_backup(&app).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = harness.backstop.create_backup(&app).await.unwrap();
    harness.backstop.create_backup(&other).await.unwrap();

    let listed = harness.backstop.list_backups(Some(&app)).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].path, second.backup_path);
    assert_eq!(listed[1].path, first.backup_path);
    assert!(listed.iter().all(|a| a.original_name == "app.css"));

    assert_eq!(harness.backstop.list_backups(None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_incremental_chain_through_facade() {
    let harness = BackstopTestHarness::with_config(|c| {
        c.incremental.enabled = true;
        c.incremental.max_chain_length = 3;
    })
    .await;
    let file = harness.write("tokens.css", ":root{--a:1}");

    let full = harness.backstop.create_incremental_backup(&file).await.unwrap();
    assert_eq!(full.backup_type, IncrementalBackupType::Full);
    assert_eq!(full.chain_length, 1);

    let skipped = harness.backstop.create_incremental_backup(&file).await.unwrap();
    assert_eq!(skipped.backup_type, IncrementalBackupType::Skipped);
    assert!(skipped.backup_id.is_none());

    fs::write(&file, ":root{--a:22}").unwrap();
    let inc = harness.backstop.create_incremental_backup(&file).await.unwrap();
    assert_eq!(inc.backup_type, IncrementalBackupType::Incremental);
    assert_eq!(inc.parent_id, full.backup_id);
    assert_eq!(inc.chain_length, 2);

    // The chain entry restores like any other backup
    let artifact = inc.backup.unwrap().backup_path;
    fs::write(&file, "garbage").unwrap();
    harness.backstop.restore_from_backup(&file, &artifact).await.unwrap();
    assert_eq!(fs::read_to_string(&file).unwrap(), ":root{--a:22}");

    let stats = harness.backstop.get_incremental_stats().await.unwrap();
    assert_eq!(stats.tracked_files, 1);
    assert_eq!(stats.full_backups, 1);
    assert_eq!(stats.incremental_backups, 1);
    assert_eq!(stats.skipped_backups, 1);
}

#[tokio::test]
async fn test_differential_through_facade() {
    let harness = BackstopTestHarness::with_config(|c| {
        c.differential.enabled = true;
        c.differential.full_backup_threshold = 2;
        c.differential.size_multiplier = 100.0;
    })
    .await;
    let file = harness.write("layout.css", ".l{}");

    let full = harness.backstop.create_differential_backup(&file).await.unwrap();
    assert_eq!(full.backup_type, DifferentialBackupType::Full);

    fs::write(&file, ".l{display:grid}").unwrap();
    let first = harness.backstop.create_differential_backup(&file).await.unwrap();
    assert_eq!(first.backup_type, DifferentialBackupType::Differential);
    assert_eq!(Some(first.base_full_backup_id.clone()), full.backup_id);
    assert_eq!(first.differential_count, 1);
    assert!(!first.recommend_full_backup);

    fs::write(&file, ".l{display:flex;gap:1rem}").unwrap();
    let second = harness.backstop.create_differential_backup(&file).await.unwrap();
    assert_eq!(second.differential_count, 2);
    assert!(second.recommend_full_backup);
    assert!(second.recommendation_reason.is_some());

    let stats = harness.backstop.get_differential_stats().await.unwrap();
    assert_eq!(stats.tracked_roots, 1);
    assert_eq!(stats.full_backups, 1);
    assert_eq!(stats.differential_backups, 2);
    assert_eq!(stats.pending_recommendations, 1);
}

#[tokio::test]
async fn test_large_project_backup_with_progress() {
    let harness = BackstopTestHarness::with_config(|c| {
        c.batch.min_batch_size = 1;
        c.batch.batch_size = 8;
        c.batch.progress_interval = Duration::ZERO;
    })
    .await;
    let files = harness.generate_stylesheets(30);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener = harness
        .backstop
        .on_progress(move |info| sink.lock().push(info.processed));

    let result = harness
        .backstop
        .process_large_project(
            files.clone(),
            BatchOperation::Backup,
            BatchOptions::default().with_strategy(BatchStrategy::Parallel),
        )
        .await
        .unwrap();

    assert_eq!(result.total, 30);
    assert_eq!(result.succeeded, 30);
    assert_eq!(result.failed, 0);
    assert!(!result.aborted);
    assert_eq!(result.batches.len(), 4);
    assert_eq!(harness.backstop.list_backups(None).await.unwrap().len(), 30);

    let seen = seen.lock().clone();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last(), Some(&30));

    assert!(harness.backstop.off_progress(listener));
    let stats = harness.backstop.get_large_project_stats();
    assert_eq!(stats.runs, 1);
    assert_eq!(stats.files_processed, 30);
}

#[tokio::test]
async fn test_large_project_checksum_with_missing_files() {
    let harness = BackstopTestHarness::new().await;
    let mut files = harness.generate_stylesheets(12);
    files.insert(5, harness.root().join("src/components/gone.css"));

    let result = harness
        .backstop
        .process_large_project(
            files,
            BatchOperation::Checksum,
            BatchOptions::default()
                .with_strategy(BatchStrategy::Sequential)
                .with_batch_size(4),
        )
        .await
        .unwrap();

    assert_eq!(result.total, 13);
    assert_eq!(result.succeeded, 12);
    assert_eq!(result.failed, 1);
    assert!(matches!(
        result.items[5].outcome,
        ItemOutcome::Failed { .. }
    ));
    assert!(result.throughput > 0.0);
}
