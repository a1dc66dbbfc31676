//! Property-based tests for Backstop
//!
//! Uses proptest to check invariants over generated contents, settings
//! and edit sequences.

use ::backstop::backup::{artifact_file_name, parse_artifact_name};
use ::backstop::batch::next_batch_size;
use ::backstop::config::BatchConfig;
use ::backstop::*;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn algorithm_strategy() -> impl Strategy<Value = HashAlgorithm> {
    prop_oneof![
        Just(HashAlgorithm::Md5),
        Just(HashAlgorithm::Sha1),
        Just(HashAlgorithm::Sha256),
        Just(HashAlgorithm::Sha512),
    ]
}

fn codec_strategy() -> impl Strategy<Value = CompressionAlgorithm> {
    prop_oneof![
        Just(CompressionAlgorithm::Gzip),
        Just(CompressionAlgorithm::Deflate),
        Just(CompressionAlgorithm::Brotli),
    ]
}

/// Contents ranging from empty to a few kilobytes, some highly repetitive
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..4096),
        ("[a-z{}:;. ]{1,40}", 1usize..200).prop_map(|(rule, n)| rule.repeat(n).into_bytes()),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_checksum_matches_in_memory_digest(
        content in content_strategy(),
        algorithm in algorithm_strategy(),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("input.css");
        fs::write(&file, &content).unwrap();

        let (first, second) = block_on(async {
            let backstop = BackstopBuilder::new()
                .root(temp_dir.path())
                .algorithm(algorithm)
                .build()
                .await
                .unwrap();
            let first = backstop.calculate_checksum(&file).await.unwrap();
            let second = backstop.calculate_checksum(&file).await.unwrap();
            (first, second)
        });

        prop_assert_eq!(&first.hash, &algorithm.hash_bytes(&content));
        prop_assert_eq!(first.hash.len(), algorithm.digest_len());
        prop_assert_eq!(first.file_size, content.len() as u64);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_backup_restore_roundtrip(
        content in content_strategy(),
        codec in codec_strategy(),
        compression_threshold in 0u64..2048,
        dedup in any::<bool>(),
        dedup_threshold in 0u64..2048,
    ) {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("roundtrip.css");
        fs::write(&file, &content).unwrap();

        let mut config = BackstopConfig {
            root: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        config.compression.algorithm = codec;
        config.compression.threshold = compression_threshold;
        config.deduplication.enabled = dedup;
        config.deduplication.threshold = dedup_threshold;

        let (record, restored) = block_on(async {
            let backstop = Backstop::new(config).await.unwrap();
            let record = backstop.create_backup(&file).await.unwrap();
            fs::write(&file, b"clobbered by a bad rewrite").unwrap();
            let restored = backstop
                .restore_from_backup(&file, &record.backup_path)
                .await
                .unwrap();
            (record, restored)
        });

        prop_assert_eq!(fs::read(&file).unwrap(), content.clone());
        prop_assert!(restored.integrity_verified);
        prop_assert_eq!(restored.kind, record.kind);
        prop_assert_eq!(record.original_size, content.len() as u64);
        if record.kind == BackupKind::Deduplicated {
            prop_assert!(dedup);
        }
    }

    #[test]
    fn prop_incremental_chain_never_exceeds_bound(
        max_chain_length in 1usize..6,
        edits in prop::collection::vec(any::<bool>(), 1..20),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("chain.css");
        let mut content = String::from(".c{}");
        fs::write(&file, &content).unwrap();

        let results = block_on(async {
            let mut config = BackstopBuilder::new()
                .root(temp_dir.path())
                .incremental(true)
                .config()
                .clone();
            config.incremental.max_chain_length = max_chain_length;
            let backstop = Backstop::new(config).await.unwrap();
            let mut results = vec![backstop.create_incremental_backup(&file).await.unwrap()];
            for changed in &edits {
                if *changed {
                    // Grow the file so size alone reveals the change
                    content.push(' ');
                    fs::write(&file, &content).unwrap();
                }
                results.push(backstop.create_incremental_backup(&file).await.unwrap());
            }
            results
        });

        prop_assert_eq!(results[0].backup_type, IncrementalBackupType::Full);
        for (result, changed) in results[1..].iter().zip(&edits) {
            prop_assert!(result.chain_length <= max_chain_length);
            prop_assert_eq!(result.backup_type == IncrementalBackupType::Skipped, !changed);
            if result.backup_type == IncrementalBackupType::Full {
                prop_assert_eq!(result.chain_length, 1);
            }
        }
    }

    #[test]
    fn prop_artifact_names_parse_back(
        stem in "[a-zA-Z0-9_-]{1,12}(\\.[a-z0-9]{1,6}){0,3}",
        micros in 0i64..1_000_000,
        collision in 0u32..4,
        kind in prop_oneof![
            Just(BackupKind::Plain),
            Just(BackupKind::Compressed),
            Just(BackupKind::Deduplicated),
        ],
        codec in codec_strategy(),
    ) {
        let created_at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap()
            + chrono::Duration::microseconds(micros);
        let compression = (kind == BackupKind::Compressed).then_some(codec);
        let name = artifact_file_name(Path::new(&stem), created_at, kind, compression, collision);

        let parsed = parse_artifact_name(&name).unwrap();
        prop_assert_eq!(parsed.original_name, stem);
        prop_assert_eq!(parsed.created_at, created_at);
        prop_assert_eq!(parsed.kind, kind);
        prop_assert_eq!(parsed.compression, compression);
    }

    #[test]
    fn prop_batch_size_stays_within_bounds(
        current in 1usize..2000,
        min in 1usize..50,
        span in 0usize..500,
        memory in prop::option::of(0u64..(4 << 30)),
        load in prop::option::of(0.0f64..8.0),
        lag_ms in 0u64..500,
    ) {
        let config = BatchConfig {
            min_batch_size: min,
            max_batch_size: min + span,
            ..Default::default()
        };
        let metrics = SystemMetrics {
            resident_memory_bytes: memory,
            load_per_core: load,
            scheduler_lag: Duration::from_millis(lag_ms),
        };

        let next = next_batch_size(current, &metrics, &config);
        prop_assert!(next >= config.min_batch_size);
        prop_assert!(next <= config.max_batch_size);
    }
}
