//! # Backstop - File integrity and backup engine
//!
//! Backstop snapshots files before they are rewritten and puts them back when
//! a rewrite goes wrong. Every backup is verified against the source checksum
//! when it is written, and every restore is verified again after the target
//! has been overwritten.
//!
//! ## Overview
//!
//! - Streaming checksums (MD5, SHA-1, SHA-256, SHA-512) with an mtime-validated cache
//! - Plain, compressed (gzip, deflate, brotli) and deduplicated backup artifacts
//! - Restore with a safety backup of the pre-restore state and automatic revert
//!   when verification fails
//! - Content-addressable deduplication with reference counting and hard links
//! - Incremental chains and differential backups with full-backup policies
//! - Batch processing of large file sets with adaptive batch sizing and progress
//!   listeners
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backstop::{BackstopBuilder, CompressionAlgorithm};
//! use std::path::Path;
//!
//! # #[tokio::main]
//! # async fn main() -> backstop::Result<()> {
//! let backstop = BackstopBuilder::new()
//!     .root("./site")
//!     .compression(CompressionAlgorithm::Brotli, 9)
//!     .build()
//!     .await?;
//!
//! let css = Path::new("./site/styles/app.css");
//! let before = backstop.calculate_checksum(css).await?;
//! let backup = backstop.create_backup(css).await?;
//!
//! // ... a tool rewrites app.css ...
//!
//! if !backstop.validate_file(css, &before).await.is_valid {
//!     let restored = backstop.restore_from_backup(css, &backup.backup_path).await?;
//!     println!("restored {} bytes", restored.bytes_written);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Storage layout
//!
//! All directories are relative to the configured root unless absolute:
//!
//! ```text
//! .backups/
//! ├── app.20240501T120000123456Z.css.backup          plain copy
//! ├── app.20240501T120100654321Z.css.backup.gz       compressed
//! ├── logo.20240501T120200000001Z.svg.backup.dedup   reference document
//! ├── digests/app.20240501T120000123456Z.css.backup.json   source digest
//! ├── dedup/
//! │   ├── dedup-index.json
//! │   └── objects/ab/cdef...                         read-only blobs
//! ├── incremental/incremental-index.json
//! └── differential/differential-index.json
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`](error::Result) with a
//! [`BackstopError`]. Hashing failures are [`BackstopError::Checksum`],
//! comparison failures [`BackstopError::Validation`] and backup or restore
//! failures [`BackstopError::Rollback`]; each carries a stable
//! [`ErrorCode`], the file involved and the underlying cause. A checksum
//! *mismatch* is not an error: it is reported in a [`ValidationOutcome`].
//!
//! ## Module Organization
//!
//! - [`backstop`]: the [`Backstop`] facade and its builder
//! - [`checksum`]: hashing and the checksum cache
//! - [`compression`]: compression codecs
//! - [`dedup`]: content-addressable deduplication store
//! - [`backup`]: backup creation, restore and retention
//! - [`incremental`] / [`differential`]: backup strategies
//! - [`batch`] / [`progress`]: large file sets and progress listeners
//! - [`config`], [`types`], [`error`]: configuration, shared records, errors

pub mod backstop;
pub mod backup;
pub mod batch;
pub mod checksum;
pub mod compression;
pub mod config;
pub mod dedup;
pub mod differential;
pub mod error;
pub mod incremental;
pub mod progress;
pub mod types;
pub mod utils;

pub use crate::backstop::{Backstop, BackstopBuilder};
pub use backup::{ArtifactDigest, BackupManager, DeduplicationReference};
pub use batch::{
    BatchOperation, BatchOptions, BatchResult, ErrorAction, ItemOutcome, LargeProjectStats,
    SystemMetrics,
};
pub use checksum::{CacheStats, ChecksumEngine, ExpectedChecksum, HashAlgorithm};
pub use compression::{CompressionAlgorithm, CompressionEngine, CompressionStats};
pub use config::{BackstopConfig, BatchStrategy, ChangeDetection, StoragePolicy};
pub use dedup::{DeduplicationResult, DeduplicationStats, DeduplicationStore, LinkMode};
pub use differential::{DifferentialBackupResult, DifferentialBackupType, DifferentialStats};
pub use error::{BackstopError, ErrorCode, Result};
pub use incremental::{IncrementalBackupResult, IncrementalBackupType, IncrementalStats};
pub use progress::ListenerId;
pub use types::*;
