//! The version ledger and the rows it stores.
//!
//! Each artifact directory carries one ledger file mapping concrete version
//! numbers to [`IndexEntry`] rows. Writers serialise through [`FileLock`];
//! readers never lock and rely on reconciliation instead.

mod file_lock;
mod ledger;

pub use file_lock::FileLock;
pub use ledger::{IndexRead, VersionLedger};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::applicability::{parse_run_number, AppliesTo};
use crate::error::IndexError;
use crate::version::Version;

/// One ledger row describing a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    /// Version this row describes. Concrete once persisted.
    pub version: Version,
    /// Run the artifact was produced from.
    pub run_number: String,
    /// Runs the version is valid for. Unset means `>=run_number`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applies_to: Option<AppliesTo>,
    /// Creation time; the tie-breaker between applicable versions.
    pub timestamp: DateTime<Utc>,
    /// Who produced the version.
    #[serde(default)]
    pub author: String,
    /// Free-form notes.
    #[serde(default)]
    pub comments: String,
}

impl IndexEntry {
    /// Creates a builder for an entry produced from `run_number`.
    #[must_use]
    pub fn builder(run_number: impl Into<String>) -> IndexEntryBuilder {
        IndexEntryBuilder::new(run_number)
    }

    /// The applicability expression in force, filling in `>=run_number` when unset.
    ///
    /// # Errors
    /// Returns `IndexError::InvalidRunNumber` if the entry has no expression and a
    /// non-numeric run number.
    pub fn effective_applies_to(&self) -> Result<AppliesTo, IndexError> {
        match &self.applies_to {
            Some(expr) => Ok(expr.clone()),
            None => Ok(AppliesTo::at_or_after(parse_run_number(&self.run_number)?)),
        }
    }

    /// Returns true if this version may be used for `run`.
    ///
    /// # Errors
    /// See [`effective_applies_to`](Self::effective_applies_to).
    pub fn applies_to_run(&self, run: u64) -> Result<bool, IndexError> {
        Ok(self.effective_applies_to()?.applies_to_run(run))
    }
}

/// Builder for [`IndexEntry`].
#[derive(Debug, Clone)]
pub struct IndexEntryBuilder {
    run_number: String,
    version: Version,
    applies_to: Option<AppliesTo>,
    timestamp: Option<DateTime<Utc>>,
    author: String,
    comments: String,
}

impl IndexEntryBuilder {
    /// Same as [`IndexEntry::builder`].
    #[must_use]
    pub fn new(run_number: impl Into<String>) -> Self {
        Self {
            run_number: run_number.into(),
            version: Version::Next,
            applies_to: None,
            timestamp: None,
            author: String::new(),
            comments: String::new(),
        }
    }

    /// Defaults to [`Version::Next`].
    #[must_use]
    pub fn version(mut self, version: impl Into<Version>) -> Self {
        self.version = version.into();
        self
    }

    /// Defaults to `>=run_number`, filled in when the artifact is written.
    #[must_use]
    pub fn applies_to(mut self, applies_to: AppliesTo) -> Self {
        self.applies_to = Some(applies_to);
        self
    }

    /// Defaults to the time `build` is called.
    #[must_use]
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the author.
    #[must_use]
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Sets the comments.
    #[must_use]
    pub fn comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = comments.into();
        self
    }

    /// Builds the entry.
    ///
    /// # Errors
    /// Returns `IndexError::InvalidRunNumber` if the run number is not numeric.
    pub fn build(self) -> Result<IndexEntry, IndexError> {
        parse_run_number(&self.run_number)?;
        Ok(IndexEntry {
            version: self.version,
            run_number: self.run_number.trim().to_string(),
            applies_to: self.applies_to,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            author: self.author,
            comments: self.comments,
        })
    }
}
