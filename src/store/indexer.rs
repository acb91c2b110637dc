//! Typed record and parameter I/O over a version ledger.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::applicability::{parse_run_number, AppliesTo};
use crate::config::{OpenMode, StoreConfig};
use crate::error::IndexError;
use crate::index::{IndexEntry, VersionLedger};
use crate::version::{Version, DEFAULT_VERSION};

use super::artifacts::ArtifactPayload;
use super::codec;
use super::ArtifactKind;

/// What [`Indexer::recover_index`] found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Versions whose record and parameters validated, ascending.
    pub recovered: Vec<u32>,
    /// Versions left out of the rebuilt ledger, with the reason.
    pub skipped: Vec<(u32, String)>,
    /// True if the rebuilt ledger was not written.
    pub dryrun: bool,
}

/// Artifact store for one domain and one directory root.
///
/// Writes take `&mut self`, so within a process at most one write to a given
/// store is in flight. Call [`close`](Self::close) when done, or use
/// [`scoped`](Self::scoped).
#[derive(Debug)]
pub struct Indexer<K: ArtifactKind> {
    ledger: VersionLedger,
    _kind: PhantomData<K>,
}

impl<K: ArtifactKind> Indexer<K> {
    /// Opens the store rooted at `root`, creating it if needed.
    ///
    /// # Errors
    /// Fails on a corrupt ledger or ledger entries without a version directory.
    pub fn open(root: impl Into<PathBuf>, config: StoreConfig) -> Result<Self, IndexError> {
        Self::open_with_mode(root, config, OpenMode::Normal)
    }

    /// Opens the store with an explicit [`OpenMode`].
    ///
    /// # Errors
    /// See [`VersionLedger::open`].
    pub fn open_with_mode(
        root: impl Into<PathBuf>,
        config: StoreConfig,
        mode: OpenMode,
    ) -> Result<Self, IndexError> {
        let config = config.validate()?;
        let ledger = VersionLedger::open(root, &K::DOMAIN.index_file_name(), config, mode)?;
        Ok(Self {
            ledger,
            _kind: PhantomData,
        })
    }

    /// Opens the store, runs `f`, and closes the store on every path.
    ///
    /// An error from `f` takes precedence over an error from closing.
    ///
    /// # Errors
    /// Errors from opening, from `f`, or from closing.
    pub fn scoped<T>(
        root: impl Into<PathBuf>,
        config: StoreConfig,
        f: impl FnOnce(&mut Self) -> Result<T, IndexError>,
    ) -> Result<T, IndexError> {
        let mut indexer = Self::open(root, config)?;
        let result = f(&mut indexer);
        let closed = indexer.close();
        match result {
            Ok(value) => closed.map(|()| value),
            Err(e) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "closing store after a failed operation also failed");
                }
                Err(e)
            }
        }
    }

    /// Reconciles and flushes the ledger.
    ///
    /// # Errors
    /// See [`VersionLedger::close`].
    pub fn close(self) -> Result<(), IndexError> {
        self.ledger.close()
    }

    /// Re-reads the ledger from disk.
    ///
    /// # Errors
    /// See [`VersionLedger::reload`].
    pub fn reload(&mut self) -> Result<(), IndexError> {
        self.ledger.reload()
    }

    /// The underlying ledger.
    #[must_use]
    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    /// Directory holding the ledger and version directories.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.ledger.root()
    }

    /// The concrete DEFAULT version.
    #[must_use]
    pub const fn default_version() -> u32 {
        DEFAULT_VERSION
    }

    /// # Errors
    /// See [`VersionLedger::next_version`].
    pub fn next_version(&mut self) -> Result<u32, IndexError> {
        self.ledger.next_version()
    }

    /// # Errors
    /// See [`VersionLedger::current_version`].
    pub fn current_version(&self) -> Result<Option<u32>, IndexError> {
        self.ledger.current_version()
    }

    /// # Errors
    /// See [`VersionLedger::latest_applicable_version`].
    pub fn latest_applicable_version(&self, run_number: &str) -> Result<Option<u32>, IndexError> {
        self.ledger.latest_applicable_version(run_number)
    }

    /// Versions present in the ledger.
    #[must_use]
    pub fn versions(&self) -> Vec<u32> {
        self.ledger.entries().keys().copied().collect()
    }

    /// Ledger entries ordered by version.
    #[must_use]
    pub fn index_entries(&self) -> Vec<&IndexEntry> {
        self.ledger.entries().values().collect()
    }

    /// Ledger entry of `version`.
    #[must_use]
    pub fn index_entry(&self, version: u32) -> Option<&IndexEntry> {
        self.ledger.entry(version)
    }

    /// Directory of a concrete version.
    #[must_use]
    pub fn version_path(&self, version: u32) -> PathBuf {
        self.ledger.version_dir(version)
    }

    /// Record file of `version`.
    #[must_use]
    pub fn record_path(&self, version: u32) -> PathBuf {
        self.version_path(version).join(K::DOMAIN.record_file_name())
    }

    /// Parameters file of `version`.
    #[must_use]
    pub fn parameters_path(&self, version: u32) -> PathBuf {
        self.version_path(version).join(K::DOMAIN.parameters_file_name())
    }

    /// Commits `record`, assigning its version if it is a sentinel.
    ///
    /// An unset `appliesTo` becomes `>=<runNumber>`. The ledger entry is added
    /// (creating the version directory) before the payload is written.
    /// Returns the record as stored.
    ///
    /// # Errors
    /// `IndexError::VersionCollision` if the record file exists and `overwrite`
    /// is false; nothing is written in that case.
    pub fn write_record(&mut self, record: K::Record, overwrite: bool) -> Result<K::Record, IndexError> {
        let file_name = K::DOMAIN.record_file_name();
        self.write_payload(record, &file_name, overwrite, true)
    }

    /// Commits `parameters` like [`write_record`](Self::write_record).
    ///
    /// The ledger entry is only added when the version has none yet, so a
    /// record's entry is never replaced by its parameters'.
    ///
    /// # Errors
    /// See [`write_record`](Self::write_record).
    pub fn write_parameters(
        &mut self,
        parameters: K::Parameters,
        overwrite: bool,
    ) -> Result<K::Parameters, IndexError> {
        let file_name = K::DOMAIN.parameters_file_name();
        self.write_payload(parameters, &file_name, overwrite, false)
    }

    fn write_payload<P: ArtifactPayload>(
        &mut self,
        mut payload: P,
        file_name: &str,
        overwrite: bool,
        replace_entry: bool,
    ) -> Result<P, IndexError> {
        if payload.index_entry().applies_to.is_none() {
            let run = parse_run_number(payload.run_number())?;
            payload.index_entry_mut().applies_to = Some(AppliesTo::at_or_after(run));
        }

        // (entry as committed, entry it replaced) while the payload is not yet on disk.
        let (version, committed) = if payload.version() == Version::Next {
            // Assigned under the ledger lock; concurrent writers never share a version.
            let mut entry = payload.index_entry().clone();
            entry.version = Version::Next;
            let version = self.ledger.add_index_entry(entry.clone())?;
            entry.version = Version::Number(version);
            (version, Some((entry, None)))
        } else {
            let version = self.ledger.flatten_version(payload.version())?;
            let path = self.version_path(version).join(file_name);
            if path.exists() && !overwrite {
                return Err(IndexError::VersionCollision { version, path });
            }
            let committed = if replace_entry || self.ledger.entry(version).is_none() {
                let previous = self.ledger.entry(version).cloned();
                let mut entry = payload.index_entry().clone();
                entry.version = Version::Number(version);
                self.ledger.add_index_entry(entry.clone())?;
                Some((entry, previous))
            } else {
                None
            };
            (version, committed)
        };
        payload.set_version(Version::Number(version));

        if let Err(err) = self.persist(version, file_name, &payload, overwrite) {
            if let Some((entry, previous)) = committed {
                if let Err(revert) = self.ledger.revert_index_entry(&entry, previous) {
                    warn!(version, error = %revert, "failed to revert ledger entry after write failure");
                }
            }
            return Err(err);
        }

        info!(
            domain = %K::DOMAIN,
            version,
            file = file_name,
            run_number = payload.run_number(),
            "wrote artifact"
        );
        Ok(payload)
    }

    fn persist<P: ArtifactPayload>(
        &self,
        version: u32,
        file_name: &str,
        payload: &P,
        overwrite: bool,
    ) -> Result<(), IndexError> {
        let path = self.version_path(version).join(file_name);
        self.ledger.validate_version(payload.version())?;
        let written =
            codec::write_json_atomic(&path, payload, overwrite, self.ledger.config().sync_on_write)?;
        if written {
            Ok(())
        } else {
            Err(IndexError::VersionCollision { version, path })
        }
    }

    /// Reads the record of `version`, or of the current version when `None`.
    ///
    /// # Errors
    /// - `IndexError::NotFound` if the store is empty or the file is missing
    /// - `IndexError::InvalidVersion` for `Version::Next`
    pub fn read_record(&self, version: Option<Version>) -> Result<K::Record, IndexError> {
        let version = self.resolve_read_version(version)?;
        codec::read_required(&self.record_path(version))
    }

    /// Reads the parameters of `version`, or of the current version when `None`.
    ///
    /// # Errors
    /// See [`read_record`](Self::read_record).
    pub fn read_parameters(&self, version: Option<Version>) -> Result<K::Parameters, IndexError> {
        let version = self.resolve_read_version(version)?;
        codec::read_required(&self.parameters_path(version))
    }

    fn resolve_read_version(&self, version: Option<Version>) -> Result<u32, IndexError> {
        match version {
            None => self.current_version()?.ok_or_else(|| IndexError::NotFound {
                path: self.root().to_path_buf(),
            }),
            Some(Version::Default) => Ok(DEFAULT_VERSION),
            Some(v) => self.ledger.validate_version(v),
        }
    }

    /// Rebuilds the ledger from the version directories alone.
    ///
    /// A version is recovered only if both its record and parameters parse and
    /// every embedded version matches the directory. The rebuilt ledger replaces
    /// the current one unless `dryrun` is set.
    ///
    /// # Errors
    /// Listing, lock and I/O failures. Invalid versions are reported, not raised.
    pub fn recover_index(&mut self, dryrun: bool) -> Result<RecoveryReport, IndexError> {
        let mut rebuilt = BTreeMap::new();
        let mut report = RecoveryReport {
            dryrun,
            ..RecoveryReport::default()
        };

        for version in self.ledger.dir_versions()? {
            match self.recover_version(version) {
                Ok(entry) => {
                    rebuilt.insert(version, entry);
                    report.recovered.push(version);
                }
                Err(reason) => {
                    warn!(domain = %K::DOMAIN, version, %reason, "skipping version during index recovery");
                    report.skipped.push((version, reason));
                }
            }
        }

        if !dryrun {
            self.ledger.replace_index(rebuilt)?;
        }
        info!(
            domain = %K::DOMAIN,
            recovered = report.recovered.len(),
            skipped = report.skipped.len(),
            dryrun,
            "index recovery finished"
        );
        Ok(report)
    }

    fn recover_version(&self, version: u32) -> Result<IndexEntry, String> {
        let record: K::Record =
            codec::read_required(&self.record_path(version)).map_err(|e| e.to_string())?;
        let parameters: K::Parameters =
            codec::read_required(&self.parameters_path(version)).map_err(|e| e.to_string())?;

        record.check_version(version).map_err(|e| format!("record: {e}"))?;
        parameters.check_version(version).map_err(|e| format!("parameters: {e}"))?;

        Ok(record.index_entry().clone())
    }
}
