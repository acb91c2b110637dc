//! The per-directory version ledger.
//!
//! The ledger maps concrete versions to [`IndexEntry`] rows and is kept
//! consistent with the `v_*` directories beside it:
//! - directories missing from the ledger are tolerated (a concurrent writer
//!   may not have added its entry yet) and only logged
//! - ledger entries with no directory are fatal, unless reconciliation is lenient
//! - after reconciliation the ledger holds exactly the intersection of both
//!
//! Mutations take the [`FileLock`] for a read-modify-write of the ledger
//! file. Reads never lock.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::applicability::parse_run_number;
use crate::config::{OpenMode, StoreConfig};
use crate::error::IndexError;
use crate::store::codec::{self, Decoded};
use crate::version::{folder_name, parse_folder_name, Version, DEFAULT_VERSION};

use super::file_lock::FileLock;
use super::IndexEntry;

/// Result of reading a ledger file from disk.
#[derive(Debug)]
pub enum IndexRead {
    /// No ledger file yet; expected on first use.
    Absent,
    /// The ledger parsed.
    Parsed(BTreeMap<u32, IndexEntry>),
    /// The ledger exists but is unreadable as a ledger.
    Corrupt(String),
}

impl IndexRead {
    /// Reads and validates the ledger file at `path`.
    ///
    /// # Errors
    /// Returns `IndexError::Io` for I/O failures other than a missing file.
    pub fn from_file(path: &Path) -> Result<Self, IndexError> {
        let entries: Vec<IndexEntry> = match codec::read_json(path)? {
            Decoded::Absent => return Ok(Self::Absent),
            Decoded::Corrupt(reason) => return Ok(Self::Corrupt(reason)),
            Decoded::Parsed(entries) => entries,
        };

        let mut index = BTreeMap::new();
        for entry in entries {
            let Version::Number(version) = entry.version else {
                return Ok(Self::Corrupt(format!(
                    "entry for run {} has unflattened version '{}'",
                    entry.run_number, entry.version
                )));
            };
            if index.insert(version, entry).is_some() {
                return Ok(Self::Corrupt(format!("duplicate entries for version {version}")));
            }
        }
        Ok(Self::Parsed(index))
    }
}

/// The version ledger of one artifact directory.
#[derive(Debug)]
pub struct VersionLedger {
    root: PathBuf,
    index_path: PathBuf,
    index: BTreeMap<u32, IndexEntry>,
    config: StoreConfig,
    mode: OpenMode,
    dirty: bool,
}

impl VersionLedger {
    /// Opens the ledger stored as `index_file_name` under `root` and reconciles it.
    ///
    /// The root directory is created if needed. A missing ledger file is an
    /// empty ledger. A corrupt one is fatal unless `mode` tolerates corruption.
    ///
    /// # Errors
    /// - `IndexError::CorruptIndex` for an unparseable ledger in `OpenMode::Normal`
    /// - `IndexError::MissingVersionDirectories` if reconciliation finds ledger-only versions
    pub fn open(
        root: impl Into<PathBuf>,
        index_file_name: &str,
        config: StoreConfig,
        mode: OpenMode,
    ) -> Result<Self, IndexError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| IndexError::io(format!("creating {}", root.display()), e))?;

        let index_path = root.join(index_file_name);
        let mut ledger = Self {
            root,
            index_path,
            index: BTreeMap::new(),
            config,
            mode,
            dirty: false,
        };
        ledger.index = ledger.read_index()?;
        ledger.reconcile_index_to_files()?;
        Ok(ledger)
    }

    /// Parses the ledger file.
    ///
    /// A missing file yields an empty ledger. A corrupt file yields an empty
    /// ledger only when the ledger was opened for initialization or recovery.
    ///
    /// # Errors
    /// Returns `IndexError::CorruptIndex` for a corrupt file in `OpenMode::Normal`.
    pub fn read_index(&self) -> Result<BTreeMap<u32, IndexEntry>, IndexError> {
        match IndexRead::from_file(&self.index_path)? {
            IndexRead::Absent => Ok(BTreeMap::new()),
            IndexRead::Parsed(index) => Ok(index),
            IndexRead::Corrupt(reason) if self.mode.tolerates_corruption() => {
                warn!(
                    path = %self.index_path.display(),
                    mode = ?self.mode,
                    %reason,
                    "substituting empty ledger for corrupt index file"
                );
                Ok(BTreeMap::new())
            }
            IndexRead::Corrupt(reason) => Err(IndexError::CorruptIndex {
                path: self.index_path.clone(),
                reason,
            }),
        }
    }

    /// Re-reads the ledger file after construction, merging concurrent writers' entries.
    ///
    /// After construction a missing file just means nothing has been written yet,
    /// so the in-memory ledger is kept.
    fn refresh(&mut self) -> Result<(), IndexError> {
        match IndexRead::from_file(&self.index_path)? {
            IndexRead::Absent => {}
            IndexRead::Parsed(index) => self.index = index,
            IndexRead::Corrupt(reason) if self.mode.tolerates_corruption() => {
                debug!(%reason, "keeping in-memory ledger over corrupt index file");
            }
            IndexRead::Corrupt(reason) => {
                return Err(IndexError::CorruptIndex {
                    path: self.index_path.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Re-reads the ledger from disk and reconciles it with the directory tree.
    ///
    /// # Errors
    /// See [`reconcile_index_to_files`](Self::reconcile_index_to_files).
    pub fn reload(&mut self) -> Result<(), IndexError> {
        self.refresh()?;
        self.reconcile_index_to_files()
    }

    /// Versions inferred from `v_*` sub-directory names, including `v_default`.
    ///
    /// # Errors
    /// Returns `IndexError::Io` if the root cannot be listed.
    pub fn dir_versions(&self) -> Result<BTreeSet<u32>, IndexError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => {
                return Err(IndexError::io(format!("listing {}", self.root.display()), e));
            }
        };

        let mut versions = BTreeSet::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| IndexError::io(format!("listing {}", self.root.display()), e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(version) = parse_folder_name(&entry.file_name().to_string_lossy()) {
                versions.insert(version);
            }
        }
        Ok(versions)
    }

    /// Versions the ledger currently holds.
    #[must_use]
    pub fn index_versions(&self) -> BTreeSet<u32> {
        self.index.keys().copied().collect()
    }

    /// Trims the ledger to the versions that also have a directory.
    ///
    /// Directory-only versions are logged. Ledger-only versions fail with
    /// `MissingVersionDirectories`, or are logged and dropped when reconciliation
    /// is lenient. Running this twice in a row leaves the same ledger.
    ///
    /// # Errors
    /// Returns `IndexError::MissingVersionDirectories` for ledger-only versions
    /// unless `lenient_reconcile` is set.
    pub fn reconcile_index_to_files(&mut self) -> Result<(), IndexError> {
        let dir_versions = self.dir_versions()?;
        let index_versions = self.index_versions();

        let unindexed: Vec<u32> = dir_versions.difference(&index_versions).copied().collect();
        if !unindexed.is_empty() {
            warn!(
                root = %self.root.display(),
                versions = ?unindexed,
                "version directories have no ledger entry; another writer may still be committing"
            );
        }

        let orphaned: Vec<u32> = index_versions.difference(&dir_versions).copied().collect();
        if !orphaned.is_empty() {
            if !self.config.lenient_reconcile {
                return Err(IndexError::MissingVersionDirectories {
                    root: self.root.clone(),
                    versions: orphaned,
                });
            }
            warn!(
                root = %self.root.display(),
                versions = ?orphaned,
                "dropping ledger entries with no version directory"
            );
            self.index.retain(|version, _| dir_versions.contains(version));
            self.dirty = true;
        }
        Ok(())
    }

    /// Highest version across ledger and directories, or `None` when both are empty.
    ///
    /// # Errors
    /// Returns `IndexError::Io` if the root cannot be listed.
    pub fn current_version(&self) -> Result<Option<u32>, IndexError> {
        let dir_max = self.dir_versions()?.last().copied();
        let index_max = self.index.keys().next_back().copied();
        Ok(dir_max.max(index_max))
    }

    /// The version a `Next` write would receive.
    ///
    /// # Errors
    /// Propagates reconciliation failures. Returns `IndexError::VersionsExhausted`
    /// once the current version is `u32::MAX`.
    pub fn next_version(&mut self) -> Result<u32, IndexError> {
        if self.dir_versions()? != self.index_versions() {
            self.reconcile_index_to_files()?;
        }
        match self.current_version()? {
            Some(current) => current.checked_add(1).ok_or_else(|| IndexError::VersionsExhausted {
                root: self.root.clone(),
                current,
            }),
            None => Ok(DEFAULT_VERSION),
        }
    }

    /// Newest version whose applicability expression accepts `run_number`.
    ///
    /// Candidates are ordered by timestamp, with the higher version winning a
    /// timestamp tie. DEFAULT is dropped whenever another candidate exists.
    ///
    /// # Errors
    /// Returns `IndexError::InvalidRunNumber` if `run_number` (or an entry's own
    /// run number, when it has no expression) is not numeric.
    pub fn latest_applicable_version(&self, run_number: &str) -> Result<Option<u32>, IndexError> {
        let run = parse_run_number(run_number)?;

        let mut candidates = Vec::new();
        for (version, entry) in &self.index {
            if entry.applies_to_run(run)? {
                candidates.push((entry.timestamp, *version));
            }
        }
        candidates.sort_unstable();

        if candidates.len() > 1 {
            candidates.retain(|(_, version)| *version != DEFAULT_VERSION);
        }
        Ok(candidates.last().map(|(_, version)| *version))
    }

    /// Turns a requested version into the concrete number it denotes now.
    ///
    /// # Errors
    /// Propagates [`next_version`](Self::next_version) failures.
    pub fn flatten_version(&mut self, version: Version) -> Result<u32, IndexError> {
        match version {
            Version::Number(n) => Ok(n),
            Version::Default => Ok(DEFAULT_VERSION),
            Version::Next => self.next_version(),
        }
    }

    /// Checks that a version is concrete before it is used for a disk operation.
    ///
    /// # Errors
    /// Returns `IndexError::InvalidVersion`, a defect signal, for unflattened sentinels.
    pub fn validate_version(&self, version: Version) -> Result<u32, IndexError> {
        version.require_concrete()
    }

    /// Adds (or replaces) the entry for its flattened version and persists the ledger.
    ///
    /// Runs under the file lock: re-reads the ledger, reconciles if needed,
    /// flattens the version, makes sure the version directory exists, inserts,
    /// and writes the ledger back. Returns the concrete version.
    ///
    /// # Errors
    /// Lock, corruption, reconciliation and I/O failures.
    pub fn add_index_entry(&mut self, mut entry: IndexEntry) -> Result<u32, IndexError> {
        let lock = FileLock::acquire(&self.config, &self.root)?;

        self.refresh()?;
        if self.dir_versions()? != self.index_versions() {
            self.reconcile_index_to_files()?;
        }

        let version = self.flatten_version(entry.version)?;
        let dir = self.version_dir(version);
        fs::create_dir_all(&dir)
            .map_err(|e| IndexError::io(format!("creating {}", dir.display()), e))?;

        entry.version = Version::Number(version);
        info!(
            root = %self.root.display(),
            version,
            run_number = %entry.run_number,
            "adding ledger entry"
        );
        self.index.insert(version, entry);
        self.write_locked(&lock)?;
        Ok(version)
    }

    /// Undoes an [`add_index_entry`](Self::add_index_entry) whose artifact never landed.
    ///
    /// Under the file lock, and only while the ledger still holds `added`,
    /// restores `previous` or drops the version. The version directory is
    /// removed when the version is left without an entry and the directory is empty.
    ///
    /// # Errors
    /// Lock, corruption and I/O failures. `IndexError::InvalidVersion` if
    /// `added` carries a sentinel version.
    pub fn revert_index_entry(
        &mut self,
        added: &IndexEntry,
        previous: Option<IndexEntry>,
    ) -> Result<(), IndexError> {
        let version = added.version.require_concrete()?;
        let lock = FileLock::acquire(&self.config, &self.root)?;
        self.refresh()?;

        if self.index.get(&version) == Some(added) {
            match previous {
                Some(entry) => {
                    self.index.insert(version, entry);
                }
                None => {
                    self.index.remove(&version);
                }
            }
            self.write_locked(&lock)?;
            info!(root = %self.root.display(), version, "reverted ledger entry");
        }

        if !self.index.contains_key(&version) {
            let dir = self.version_dir(version);
            // Fails harmlessly when another writer has already put files there.
            if let Err(e) = fs::remove_dir(&dir) {
                debug!(dir = %dir.display(), error = %e, "kept version directory");
            }
        }
        Ok(())
    }

    /// Replaces the whole ledger and persists it under the file lock.
    ///
    /// # Errors
    /// Lock and I/O failures.
    pub fn replace_index(&mut self, index: BTreeMap<u32, IndexEntry>) -> Result<(), IndexError> {
        let lock = FileLock::acquire(&self.config, &self.root)?;
        self.index = index;
        self.write_locked(&lock)
    }

    /// Persists the in-memory ledger under the file lock.
    ///
    /// # Errors
    /// Lock and I/O failures.
    pub fn write_index(&mut self) -> Result<(), IndexError> {
        let lock = FileLock::acquire(&self.config, &self.root)?;
        self.write_locked(&lock)
    }

    fn write_locked(&mut self, _lock: &FileLock) -> Result<(), IndexError> {
        let entries: Vec<&IndexEntry> = self.index.values().collect();
        codec::write_json_atomic(&self.index_path, &entries, true, self.config.sync_on_write)?;
        self.dirty = false;
        debug!(path = %self.index_path.display(), entries = entries.len(), "wrote ledger");
        Ok(())
    }

    /// Reconciles and flushes pending changes. Consumes the ledger.
    ///
    /// # Errors
    /// Reconciliation, lock and I/O failures.
    pub fn close(mut self) -> Result<(), IndexError> {
        self.reconcile_index_to_files()?;
        if self.dirty {
            self.write_index()?;
        }
        Ok(())
    }

    /// Directory holding the files of `version`.
    #[must_use]
    pub fn version_dir(&self, version: u32) -> PathBuf {
        self.root.join(folder_name(version))
    }

    /// Directory holding the ledger file and version directories.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the ledger file.
    #[must_use]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Configuration the ledger was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// All entries, ordered by version.
    #[must_use]
    pub fn entries(&self) -> &BTreeMap<u32, IndexEntry> {
        &self.index
    }

    /// Entry of `version`, if the ledger has one.
    #[must_use]
    pub fn entry(&self, version: u32) -> Option<&IndexEntry> {
        self.index.get(&version)
    }

    /// True if the in-memory ledger differs from the last write.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}
