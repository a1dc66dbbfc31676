//! Chaos tests for Backstop
//!
//! Corrupted indexes and artifacts, vanished blobs and concurrent writers.
//! Every scenario checks that the engine either recovers or fails with the
//! documented error while leaving the user's files intact.

use ::backstop::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;
use tracing_test::traced_test;

/// Project directory plus the configuration used to (re)open engines on it
pub struct BackstopChaosTest {
    pub temp_dir: TempDir,
    pub config: BackstopConfig,
}

impl BackstopChaosTest {
    pub fn new(tweak: impl FnOnce(&mut BackstopConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = BackstopConfig {
            root: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        tweak(&mut config);
        Self { temp_dir, config }
    }

    /// Open a fresh engine, reloading every persisted index
    pub async fn open(&self) -> Backstop {
        Backstop::new(self.config.clone()).await.unwrap()
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn write(&self, name: &str, content: impl AsRef<[u8]>) -> PathBuf {
        let path = self.root().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    /// Overwrite `path` with bytes that are neither JSON nor any codec stream
    pub fn corrupt(&self, path: &Path) {
        info!("Corrupting {:?}", path);
        fs::write(path, b"\x00\xffnot what you expected{{{").unwrap();
    }
}

fn dedup_config(c: &mut BackstopConfig) {
    c.deduplication.enabled = true;
    c.deduplication.threshold = 1024;
}

#[tokio::test]
#[traced_test]
async fn test_corrupt_dedup_index_is_reinitialized() {
    let chaos = BackstopChaosTest::new(dedup_config);
    let file = chaos.write("big.css", "a".repeat(2048));
    {
        let backstop = chaos.open().await;
        backstop.create_backup(&file).await.unwrap();
    }

    chaos.corrupt(&chaos.config.deduplication_directory().join("dedup-index.json"));

    let backstop = chaos.open().await;
    let stats = backstop.get_deduplication_stats().await.unwrap();
    assert_eq!(stats.index_reinitializations, 1);
    assert_eq!(stats.unique_contents, 0);

    // The store keeps working after the reset
    let record = backstop.create_backup(&file).await.unwrap();
    assert_eq!(record.kind, BackupKind::Deduplicated);
    assert_eq!(record.dedup_reference_count, Some(1));
}

#[tokio::test]
#[traced_test]
async fn test_corrupt_strategy_indexes_are_reinitialized() {
    let chaos = BackstopChaosTest::new(|c| {
        c.incremental.enabled = true;
        c.differential.enabled = true;
    });
    let file = chaos.write("app.css", ".a{}");
    {
        let backstop = chaos.open().await;
        backstop.create_incremental_backup(&file).await.unwrap();
        backstop.create_differential_backup(&file).await.unwrap();
    }

    chaos.corrupt(&chaos.config.incremental_directory().join("incremental-index.json"));
    chaos.corrupt(&chaos.config.differential_directory().join("differential-index.json"));

    let backstop = chaos.open().await;
    assert!(backstop.get_incremental_stats().await.unwrap().index_reinitialized);
    assert!(backstop.get_differential_stats().await.unwrap().index_reinitialized);

    // With the history gone both strategies start over with a full backup
    let inc = backstop.create_incremental_backup(&file).await.unwrap();
    assert_eq!(inc.backup_type, IncrementalBackupType::Full);
    let diff = backstop.create_differential_backup(&file).await.unwrap();
    assert_eq!(diff.backup_type, DifferentialBackupType::Full);
}

#[tokio::test]
async fn test_tampered_blob_fails_verification_and_reverts() {
    let chaos = BackstopChaosTest::new(dedup_config);
    let backstop = chaos.open().await;
    let file = chaos.write("theme.css", "b".repeat(4096));

    let record = backstop.create_backup(&file).await.unwrap();
    assert_eq!(record.kind, BackupKind::Deduplicated);

    let reference: DeduplicationReference =
        serde_json::from_slice(&fs::read(&record.backup_path).unwrap()).unwrap();
    // Blobs are read-only; swap in a different file under the same address
    fs::remove_file(&reference.storage_path).unwrap();
    fs::write(&reference.storage_path, "c".repeat(4096)).unwrap();

    fs::write(&file, ".edited{}").unwrap();
    let err = backstop
        .restore_from_backup(&file, &record.backup_path)
        .await
        .unwrap_err();
    assert!(err.is_rollback());
    assert_eq!(err.code(), Some(ErrorCode::VerificationFailed));

    // The pre-restore content is back in place
    assert_eq!(fs::read_to_string(&file).unwrap(), ".edited{}");
}

#[tokio::test]
async fn test_linked_file_rewritten_in_place() {
    let chaos = BackstopChaosTest::new(dedup_config);
    let backstop = chaos.open().await;
    let body = "x".repeat(5000);
    let first = chaos.write("a.css", &body);
    let linked = chaos.write("b.css", &body);

    let record = backstop.create_backup(&first).await.unwrap();
    assert_eq!(record.kind, BackupKind::Deduplicated);
    let dedup = backstop.deduplicate_file(&linked).await.unwrap();
    assert!(dedup.link.is_some());
    assert!(fs::metadata(&dedup.storage_path).unwrap().permissions().readonly());

    // A tool rewriting b.css in place; refused unless running with privileges
    let rewrite = fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&linked)
        .and_then(|mut f| std::io::Write::write_all(&mut f, "y".repeat(5000).as_bytes()));
    if rewrite.is_err() {
        assert_eq!(fs::read_to_string(&linked).unwrap(), body);
        assert_eq!(fs::read_to_string(&dedup.storage_path).unwrap(), body);
    }

    // Backing up the original content again repairs a damaged blob
    let third = chaos.write("c.css", &body);
    let again = backstop.create_backup(&third).await.unwrap();
    assert_eq!(again.kind, BackupKind::Deduplicated);
    assert_eq!(fs::read_to_string(&dedup.storage_path).unwrap(), body);

    fs::write(&first, ".a{}").unwrap();
    let restored = backstop
        .restore_from_backup(&first, &record.backup_path)
        .await
        .unwrap();
    assert!(restored.integrity_verified);
    assert_eq!(fs::read_to_string(&first).unwrap(), body);
}

#[tokio::test]
async fn test_corrupt_compressed_artifact_leaves_target_untouched() {
    let chaos = BackstopChaosTest::new(|c| c.compression.threshold = 64);
    let backstop = chaos.open().await;
    let file = chaos.write("site.css", ".s{margin:0}\n".repeat(100));

    let record = backstop.create_backup(&file).await.unwrap();
    assert_eq!(record.kind, BackupKind::Compressed);
    chaos.corrupt(&record.backup_path);

    fs::write(&file, ".current{}").unwrap();
    let err = backstop
        .restore_from_backup(&file, &record.backup_path)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::ArtifactCorrupted));
    assert_eq!(fs::read_to_string(&file).unwrap(), ".current{}");
}

#[tokio::test]
async fn test_corrupt_reference_document() {
    let chaos = BackstopChaosTest::new(dedup_config);
    let backstop = chaos.open().await;
    let file = chaos.write("ref.css", "r".repeat(2048));

    let record = backstop.create_backup(&file).await.unwrap();
    chaos.corrupt(&record.backup_path);

    let err = backstop
        .restore_from_backup(&file, &record.backup_path)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::ArtifactCorrupted));
}

#[tokio::test]
async fn test_missing_artifact_and_missing_blob() {
    let chaos = BackstopChaosTest::new(dedup_config);
    let backstop = chaos.open().await;
    let file = chaos.write("gone.css", "g".repeat(2048));

    let err = backstop
        .restore_from_backup(&file, &chaos.root().join(".backups/nothing.css.backup"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::ArtifactMissing));

    let record = backstop.create_backup(&file).await.unwrap();
    let reference: DeduplicationReference =
        serde_json::from_slice(&fs::read(&record.backup_path).unwrap()).unwrap();
    fs::remove_file(&reference.storage_path).unwrap();

    let err = backstop
        .restore_from_backup(&file, &record.backup_path)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::ArtifactMissing));

    // Backing up the same content again puts the blob back
    let again = backstop.create_backup(&file).await.unwrap();
    assert_eq!(again.dedup_reference_count, Some(2));
    assert!(reference.storage_path.exists());
    backstop
        .restore_from_backup(&file, &record.backup_path)
        .await
        .unwrap();
    assert_eq!(fs::read_to_string(&file).unwrap(), "g".repeat(2048));
}

#[tokio::test]
#[traced_test]
async fn test_concurrent_backups_of_identical_content() {
    let chaos = BackstopChaosTest::new(dedup_config);
    let backstop = Arc::new(chaos.open().await);
    let body = "d".repeat(3000);

    let files: Vec<PathBuf> = (0..16)
        .map(|i| chaos.write(&format!("copy{:02}.css", i), &body))
        .collect();

    let mut handles = Vec::new();
    for file in files {
        let backstop = Arc::clone(&backstop);
        handles.push(tokio::spawn(async move { backstop.create_backup(&file).await }));
    }
    for handle in handles {
        let record = handle.await.unwrap().unwrap();
        assert_eq!(record.kind, BackupKind::Deduplicated);
    }

    let stats = backstop.get_deduplication_stats().await.unwrap();
    assert_eq!(stats.unique_contents, 1);
    assert_eq!(stats.total_references, 16);
    assert_eq!(stats.bytes_saved, 15 * 3000);

    // The persisted index agrees after a reopen
    drop(backstop);
    let reopened = chaos.open().await;
    assert_eq!(
        reopened.get_deduplication_stats().await.unwrap().total_references,
        16
    );
}

#[tokio::test]
async fn test_source_vanishes_between_backups() {
    let chaos = BackstopChaosTest::new(|c| c.incremental.enabled = true);
    let backstop = chaos.open().await;
    let file = chaos.write("flaky.css", ".f{}");

    backstop.create_incremental_backup(&file).await.unwrap();
    fs::remove_file(&file).unwrap();

    let err = backstop.create_incremental_backup(&file).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::SourceUnavailable));

    // History is intact once the file reappears
    fs::write(&file, ".f{color:red}").unwrap();
    let result = backstop.create_incremental_backup(&file).await.unwrap();
    assert_eq!(result.backup_type, IncrementalBackupType::Incremental);
    assert_eq!(result.chain_length, 2);
}
