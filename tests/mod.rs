//! Main test module for Backstop
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end scenarios
//! - Chaos tests for corruption and concurrent access
//! - Property-based tests for invariants

pub mod chaos;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::backstop::*;
    use std::fs;
    use tempfile::TempDir;

    async fn engine(root: &std::path::Path) -> Backstop {
        BackstopBuilder::new().root(root).build().await.unwrap()
    }

    #[tokio::test]
    async fn test_empty_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let backstop = engine(temp_dir.path()).await;
        let file = temp_dir.path().join("empty.css");
        fs::write(&file, b"").unwrap();

        let record = backstop.create_backup(&file).await.unwrap();
        assert_eq!(record.kind, BackupKind::Plain);
        assert_eq!(record.original_size, 0);

        fs::write(&file, b"not empty anymore").unwrap();
        let restored = backstop.restore_from_backup(&file, &record.backup_path).await.unwrap();
        assert!(restored.integrity_verified);
        assert_eq!(fs::read(&file).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_restore_to_missing_target_has_no_safety_backup() {
        let temp_dir = TempDir::new().unwrap();
        let backstop = engine(temp_dir.path()).await;
        let file = temp_dir.path().join("app.css");
        fs::write(&file, b".a{}").unwrap();

        let record = backstop.create_backup(&file).await.unwrap();
        fs::remove_file(&file).unwrap();

        let restored = backstop.restore_from_backup(&file, &record.backup_path).await.unwrap();
        assert!(restored.safety_backup_path.is_none());
        assert_eq!(fs::read(&file).unwrap(), b".a{}");
    }

    #[tokio::test]
    async fn test_restore_into_new_directory() {
        let temp_dir = TempDir::new().unwrap();
        let backstop = engine(temp_dir.path()).await;
        let file = temp_dir.path().join("app.css");
        fs::write(&file, b".a{}").unwrap();
        let record = backstop.create_backup(&file).await.unwrap();

        let elsewhere = temp_dir.path().join("restored/nested/app.css");
        backstop.restore_from_backup(&elsewhere, &record.backup_path).await.unwrap();
        assert_eq!(fs::read(&elsewhere).unwrap(), b".a{}");
    }

    #[tokio::test]
    async fn test_backup_of_directory_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let backstop = engine(temp_dir.path()).await;

        let err = backstop.create_backup(temp_dir.path()).await.unwrap_err();
        assert!(err.is_rollback());
        assert_eq!(err.code(), Some(ErrorCode::SourceUnavailable));
    }

    #[tokio::test]
    async fn test_file_names_with_many_dots() {
        let temp_dir = TempDir::new().unwrap();
        let backstop = engine(temp_dir.path()).await;
        let file = temp_dir.path().join("vendor.bundle.min.css");
        fs::write(&file, b".x{}").unwrap();

        backstop.create_backup(&file).await.unwrap();
        let listed = backstop.list_backups(Some(&file)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].original_name, "vendor.bundle.min.css");
    }

    #[tokio::test]
    async fn test_backups_in_same_instant_do_not_collide() {
        let temp_dir = TempDir::new().unwrap();
        let backstop = engine(temp_dir.path()).await;
        let file = temp_dir.path().join("app.css");
        fs::write(&file, b".a{}").unwrap();

        let mut paths = Vec::new();
        for _ in 0..5 {
            paths.push(backstop.create_backup(&file).await.unwrap().backup_path);
        }
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 5);
    }
}
