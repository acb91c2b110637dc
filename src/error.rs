//! Error types for the calibration store.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! the specific failure. The ledger and artifact store share [`IndexError`];
//! the load cache reports [`CacheError`]. [`CalibError`] wraps both.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the version ledger, the file lock and the artifact store.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum IndexError {
    #[error(
        "Index file {} is corrupt: {reason}. Manual repair is required; contact support or run index recovery",
        .path.display()
    )]
    CorruptIndex { path: PathBuf, reason: String },

    #[error(
        "Index under {} lists versions {versions:?} with no version directory; the directory tree was modified externally",
        .root.display()
    )]
    MissingVersionDirectories { root: PathBuf, versions: Vec<u32> },

    #[error("Version {version} already exists at {}; pass overwrite to replace it", .path.display())]
    VersionCollision { version: u32, path: PathBuf },

    #[error("No version is left after {current} under {}", .root.display())]
    VersionsExhausted { root: PathBuf, current: u32 },

    #[error("Invalid version '{value}': this is a software defect, not a user error")]
    InvalidVersion { value: String },

    #[error("File not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("Invalid applicability expression '{expression}': {reason}")]
    InvalidAppliesTo { expression: String, reason: String },

    #[error("Run number '{value}' is not numeric")]
    InvalidRunNumber { value: String },

    #[error("Failed to acquire lock {}: {message}", .path.display())]
    Lock { path: PathBuf, message: String },

    #[error("Timed out after {waited_ms}ms waiting for lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to (de)serialize {}: {reason}", .path.display())]
    Serialization { path: PathBuf, reason: String },
}

impl IndexError {
    /// Wraps an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates an `InvalidVersion` error from any displayable value.
    pub fn invalid_version(value: impl ToString) -> Self {
        Self::InvalidVersion {
            value: value.to_string(),
        }
    }

    /// Returns true if the caller can recover by choosing different inputs.
    #[must_use]
    pub const fn is_user_recoverable(&self) -> bool {
        matches!(self, Self::VersionCollision { .. } | Self::NotFound { .. })
    }
}

/// Errors raised by the load cache.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to load run {run} from {}", .path.display())]
    LoadFailed { run: String, path: PathBuf },

    #[error("Run number '{value}' is not numeric")]
    InvalidRun { value: String },

    #[error("Resident item operation '{operation}' failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    #[error("Poisoned lock: {context}")]
    Poisoned { context: &'static str },
}

impl CacheError {
    /// Creates a backend error for the named resident-item operation.
    pub fn backend(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            message: message.into(),
        }
    }
}

/// Top-level error type.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum CalibError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CalibError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a ledger or artifact store error.
    #[must_use]
    pub const fn is_index(&self) -> bool {
        matches!(self, Self::Index(_))
    }

    /// Returns true if this is a load cache error.
    #[must_use]
    pub const fn is_cache(&self) -> bool {
        matches!(self, Self::Cache(_))
    }

    /// Returns true if the error reports a software defect rather than bad input or bad data.
    #[must_use]
    pub const fn is_defect(&self) -> bool {
        matches!(
            self,
            Self::Index(IndexError::InvalidVersion { .. }) | Self::Internal { .. }
        )
    }
}

/// Result type alias for store operations.
pub type CalibResult<T> = Result<T, CalibError>;
