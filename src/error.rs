//! Error types for the Backstop library
//!
//! This module defines all error types that can occur during Backstop operations.
//! The three domain errors mirror the engine's failure modes:
//!
//! - [`BackstopError::Checksum`]: the source file could not be hashed (missing,
//!   not a regular file, oversized, unreadable or timed out)
//! - [`BackstopError::Validation`]: a comparison or batch validation could not be
//!   carried out. A hash *mismatch* is not an error, it is a valid
//!   [`ValidationOutcome`](crate::types::ValidationOutcome)
//! - [`BackstopError::Rollback`]: a backup precondition failed, an artifact is
//!   corrupt, or a restore could not be verified
//!
//! Each of them carries an [`ErrorDetail`] with a stable [`ErrorCode`], the file
//! and operation involved, and the underlying cause when there is one.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Type alias for Results in the Backstop library
pub type Result<T> = std::result::Result<T, BackstopError>;

/// Boxed underlying cause of a domain error
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for all Backstop operations
#[derive(Debug, Error)]
pub enum BackstopError {
    /// Hashing a source file failed
    #[error("Checksum error: {0}")]
    Checksum(ErrorDetail),

    /// Comparing files or validating a batch failed
    #[error("Validation error: {0}")]
    Validation(ErrorDetail),

    /// Backup precondition, artifact corruption or restore verification failure
    #[error("Rollback error: {0}")]
    Rollback(ErrorDetail),

    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Decompression errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable, machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Path does not exist
    FileNotFound,
    /// Path exists but is not a regular file
    NotAFile,
    /// File exceeds the configured maximum size
    FileTooLarge,
    /// Reading the file failed
    ReadFailed,
    /// Checksum streaming exceeded the operation timeout
    ChecksumTimeout,
    /// Two files could not be compared
    ComparisonFailed,
    /// A batch validation could not be carried out
    BatchValidationFailed,
    /// Backup source missing or unreadable
    SourceUnavailable,
    /// Writing a backup artifact failed
    BackupWriteFailed,
    /// Writing restored content to the target failed
    RestoreWriteFailed,
    /// Backup artifact missing or unreadable
    ArtifactMissing,
    /// Backup artifact does not match its source
    ArtifactCorrupted,
    /// Restored content does not match the backup
    VerificationFailed,
}

impl ErrorCode {
    /// String form used in logs and CLI output
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::NotAFile => "NOT_A_FILE",
            ErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ErrorCode::ReadFailed => "READ_FAILED",
            ErrorCode::ChecksumTimeout => "CHECKSUM_TIMEOUT",
            ErrorCode::ComparisonFailed => "COMPARISON_FAILED",
            ErrorCode::BatchValidationFailed => "BATCH_VALIDATION_FAILED",
            ErrorCode::SourceUnavailable => "SOURCE_UNAVAILABLE",
            ErrorCode::BackupWriteFailed => "BACKUP_WRITE_FAILED",
            ErrorCode::RestoreWriteFailed => "RESTORE_WRITE_FAILED",
            ErrorCode::ArtifactMissing => "ARTIFACT_MISSING",
            ErrorCode::ArtifactCorrupted => "ARTIFACT_CORRUPTED",
            ErrorCode::VerificationFailed => "VERIFICATION_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context shared by the checksum, validation and rollback errors
#[derive(Debug, Error)]
#[error("[{code}] {message}{}", path_suffix(.path))]
pub struct ErrorDetail {
    /// Machine-readable code
    pub code: ErrorCode,
    /// Human-readable description
    pub message: String,
    /// File the failure relates to
    pub path: Option<PathBuf>,
    /// Operation that was running
    pub operation: Option<&'static str>,
    /// Underlying cause
    #[source]
    pub cause: Option<Cause>,
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" ({})", p.display()),
        None => String::new(),
    }
}

impl ErrorDetail {
    /// Create a detail with a code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
            operation: None,
            cause: None,
        }
    }

    /// Attach the file path
    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Attach the operation name
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Attach the underlying cause
    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl BackstopError {
    /// Create a checksum error
    pub fn checksum(code: ErrorCode, path: impl AsRef<Path>, msg: impl Into<String>) -> Self {
        BackstopError::Checksum(
            ErrorDetail::new(code, msg)
                .with_path(path)
                .with_operation("checksum"),
        )
    }

    /// Create a validation error
    pub fn validation(code: ErrorCode, msg: impl Into<String>) -> Self {
        BackstopError::Validation(ErrorDetail::new(code, msg).with_operation("validate"))
    }

    /// Create a rollback error for the given operation
    pub fn rollback(
        code: ErrorCode,
        operation: &'static str,
        path: impl AsRef<Path>,
        msg: impl Into<String>,
    ) -> Self {
        BackstopError::Rollback(
            ErrorDetail::new(code, msg)
                .with_path(path)
                .with_operation(operation),
        )
    }

    /// Create a compression error with a custom message
    pub fn compression(msg: impl Into<String>) -> Self {
        BackstopError::Compression(msg.into())
    }

    /// Create a decompression error with a custom message
    pub fn decompression(msg: impl Into<String>) -> Self {
        BackstopError::Decompression(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        BackstopError::InvalidConfiguration(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackstopError::Internal(msg.into())
    }

    /// Attach a cause to a domain error; other variants are returned unchanged
    pub fn caused_by(self, cause: impl Into<Cause>) -> Self {
        match self {
            BackstopError::Checksum(d) => BackstopError::Checksum(d.with_cause(cause)),
            BackstopError::Validation(d) => BackstopError::Validation(d.with_cause(cause)),
            BackstopError::Rollback(d) => BackstopError::Rollback(d.with_cause(cause)),
            other => other,
        }
    }

    fn detail(&self) -> Option<&ErrorDetail> {
        match self {
            BackstopError::Checksum(d) | BackstopError::Validation(d) | BackstopError::Rollback(d) => {
                Some(d)
            }
            _ => None,
        }
    }

    /// Error code, for the checksum, validation and rollback errors
    pub fn code(&self) -> Option<ErrorCode> {
        self.detail().map(|d| d.code)
    }

    /// File path the error relates to, if known
    pub fn path(&self) -> Option<&Path> {
        self.detail().and_then(|d| d.path.as_deref())
    }

    /// Operation that failed, if known
    pub fn operation(&self) -> Option<&'static str> {
        self.detail().and_then(|d| d.operation)
    }

    /// Check if this error is a checksum error
    pub fn is_checksum(&self) -> bool {
        matches!(self, BackstopError::Checksum(_))
    }

    /// Check if this error is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, BackstopError::Validation(_))
    }

    /// Check if this error is a rollback error
    pub fn is_rollback(&self) -> bool {
        matches!(self, BackstopError::Rollback(_))
    }

    /// Check if this error was caused by a timeout
    pub fn is_timeout(&self) -> bool {
        self.code() == Some(ErrorCode::ChecksumTimeout)
    }

    /// Check if this error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self.code(),
            Some(ErrorCode::ArtifactCorrupted) | Some(ErrorCode::VerificationFailed)
        ) || matches!(self, BackstopError::Decompression(_))
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self.code() {
            Some(ErrorCode::FileTooLarge) => format!(
                "{}. Raise `checksum.max_file_size` or exclude the file.",
                self
            ),
            Some(ErrorCode::ChecksumTimeout) => format!(
                "{}. Raise `checksum.timeout` for slow or very large files.",
                self
            ),
            Some(ErrorCode::ArtifactMissing) => format!(
                "{}. Use `backstop list` to see available backups.",
                self
            ),
            Some(ErrorCode::VerificationFailed) => format!(
                "{}. The previous contents were put back from the safety backup.",
                self
            ),
            _ => self.to_string(),
        }
    }
}
