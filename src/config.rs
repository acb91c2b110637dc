//! Store configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::IndexError;

/// Configuration shared by every [`Indexer`](crate::store::Indexer) and its ledger.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding lock files for every guarded artifact directory.
    pub lock_root: PathBuf,
    /// How long a writer waits for the ledger lock before giving up.
    pub lock_timeout: Duration,
    /// Delay between lock acquisition attempts.
    pub lock_poll_interval: Duration,
    /// Downgrade ledger entries without a version directory from an error to a warning.
    ///
    /// Meant for test harnesses that build directory trees by hand.
    pub lenient_reconcile: bool,
    /// Whether to fsync ledger and payload files before they are renamed into place.
    pub sync_on_write: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_root: std::env::temp_dir().join("calib-store-locks"),
            lock_timeout: Duration::from_secs(30),
            lock_poll_interval: Duration::from_millis(25),
            lenient_reconcile: false,
            sync_on_write: true,
        }
    }
}

impl StoreConfig {
    /// Default configuration with locks kept under `lock_root`.
    #[must_use]
    pub fn with_lock_root(lock_root: impl Into<PathBuf>) -> Self {
        Self {
            lock_root: lock_root.into(),
            ..Self::default()
        }
    }

    /// Checks the configuration for values that would make locking degenerate.
    ///
    /// # Errors
    /// Returns `IndexError::InvalidConfig` if the poll interval is zero, exceeds the
    /// timeout, or the lock root is empty.
    pub fn validate(self) -> Result<Self, IndexError> {
        if self.lock_root.as_os_str().is_empty() {
            return Err(IndexError::InvalidConfig {
                message: "lock_root must not be empty".to_string(),
            });
        }

        if self.lock_poll_interval.is_zero() {
            return Err(IndexError::InvalidConfig {
                message: "lock_poll_interval must be non-zero".to_string(),
            });
        }

        if self.lock_poll_interval > self.lock_timeout {
            return Err(IndexError::InvalidConfig {
                message: format!(
                    "lock_poll_interval ({}ms) exceeds lock_timeout ({}ms)",
                    self.lock_poll_interval.as_millis(),
                    self.lock_timeout.as_millis()
                ),
            });
        }

        Ok(self)
    }
}

/// How a ledger treats an unreadable index file when it is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// A corrupt ledger is fatal.
    #[default]
    Normal,
    /// First-time setup; a corrupt ledger is replaced by an empty one.
    Initializing,
    /// Disaster recovery; a corrupt ledger is replaced by an empty one.
    Recovery,
}

impl OpenMode {
    /// Returns true if a corrupt ledger should be replaced by an empty one.
    #[must_use]
    pub const fn tolerates_corruption(self) -> bool {
        matches!(self, Self::Initializing | Self::Recovery)
    }
}
