//! In-memory load cache for expensive computational inputs.
//!
//! The cache tracks which items are resident under which identity and loads
//! each (identity, resolution) pair from disk at most once. It keeps three
//! tables, keyed by identity and never by item name:
//!
//! - neutron data: (run, resolution) -> number of copies handed out
//! - grouping definitions: (scheme, run, resolution) -> resident name
//! - instrument donors: (run, resolution) -> resident name
//!
//! Residency is owned by an external [`ResidentItems`] service and can change
//! behind the cache's back, so every lookup re-checks it before trusting a
//! table entry. Loads go through a [`FetchExecutor`].
//!
//! Neutron data requested at reduced resolution falls back to deriving it
//! from full-resolution data, preferring an already resident copy over a
//! disk load.

mod layout;
mod memory;

pub use layout::{DirectoryLayout, SourceLocator};
pub use memory::{MemoryBackend, MemoryItem};

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::applicability::parse_run_number;
use crate::error::CacheError;

/// Loader name reported for cache hits.
pub const CACHED_LOADER: &str = "cached";

/// Loader name reported when reduced data was derived from resident full data.
pub const DERIVED_LOADER: &str = "derived";

const NEUTRON_HINT: &str = "neutron-events";
const GROUPING_HINT: &str = "grouping-definition";
const DONOR_HINT: &str = "instrument-donor";

/// Data resolution of a cached item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Native instrument resolution.
    Full,
    /// Reduced ("lite") resolution, derivable from full resolution.
    Reduced,
}

impl Resolution {
    /// Maps the `useLiteMode` flag carried by records and parameters.
    #[must_use]
    pub const fn from_lite_mode(use_lite_mode: bool) -> Self {
        if use_lite_mode {
            Self::Reduced
        } else {
            Self::Full
        }
    }

    /// Label used in item names and grouping file names.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Full => "native",
            Self::Reduced => "lite",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One load request handed to the [`FetchExecutor`].
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// File to load.
    pub path: &'a Path,
    /// Name the loaded item should be resident under.
    pub target: &'a str,
    /// Kind of data being loaded, for executors that pick a loader.
    pub loader_hint: &'a str,
}

/// What the [`FetchExecutor`] reports back. Failure is a flag, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Whether the executor believes the load worked.
    pub success: bool,
    /// Loader the executor actually used.
    pub loader_used: String,
    /// Name the loaded item is resident under.
    pub resident_name: String,
}

/// Performs the actual file-to-memory load.
pub trait FetchExecutor: Send + Sync {
    /// Loads `request.path` into `request.target`.
    fn fetch(&self, request: &FetchRequest<'_>) -> FetchOutcome;
}

/// The service owning resident items.
pub trait ResidentItems: Send + Sync {
    /// Returns true if an item named `name` currently exists.
    fn is_resident(&self, name: &str) -> bool;

    /// Makes an independent copy of `source` named `target`.
    ///
    /// # Errors
    /// Fails if `source` is not resident or the copy cannot be made.
    fn clone_item(&self, source: &str, target: &str) -> Result<(), CacheError>;

    /// Converts `name` to reduced resolution in place.
    ///
    /// # Errors
    /// Fails if `name` is not resident or the transform fails.
    fn reduce_resolution(&self, name: &str) -> Result<(), CacheError>;
}

/// A name the caller may use, and how it was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    /// Resident item the caller may use.
    pub name: String,
    /// Loader that produced the data, or [`CACHED_LOADER`] / [`DERIVED_LOADER`].
    pub loader_used: String,
}

/// Trims `run` and rejects anything that is not a run number.
///
/// Item names end in the run, so a numeric run keeps them unambiguous.
fn checked_run(run: &str) -> Result<String, CacheError> {
    let run = run.trim();
    parse_run_number(run).map_err(|_| CacheError::InvalidRun {
        value: run.to_string(),
    })?;
    Ok(run.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NeutronKey {
    run: String,
    resolution: Resolution,
}

impl NeutronKey {
    fn new(run: &str, resolution: Resolution) -> Result<Self, CacheError> {
        Ok(Self {
            run: checked_run(run)?,
            resolution,
        })
    }

    fn at(&self, resolution: Resolution) -> Self {
        Self {
            run: self.run.clone(),
            resolution,
        }
    }

    /// The shared item copies are made from; never handed to callers.
    fn raw_name(&self) -> String {
        format!("tof_raw_{}_{}", self.resolution.label(), self.run)
    }

    fn copy_name(&self, generation: u32) -> String {
        format!("tof_{}_copy{generation}_{}", self.resolution.label(), self.run)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupingKey {
    scheme: String,
    run: String,
    resolution: Resolution,
}

impl GroupingKey {
    /// Read right to left, the numeric run and the fixed label leave the scheme unambiguous.
    fn resident_name(&self) -> String {
        format!("group_{}_{}_{}", self.scheme, self.resolution.label(), self.run)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DonorKey {
    run: String,
    resolution: Resolution,
}

impl DonorKey {
    fn resident_name(&self) -> String {
        format!("donor_{}_{}", self.resolution.label(), self.run)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyId {
    Neutron(NeutronKey),
    Grouping(GroupingKey),
    Donor(DonorKey),
}

#[derive(Debug, Default)]
struct CacheTables {
    /// Copies handed out from the current raw item.
    neutron: HashMap<NeutronKey, u32>,
    /// Last copy number used per key. Survives reloads so copy names are not reused.
    issued: HashMap<NeutronKey, u32>,
    grouping: HashMap<GroupingKey, String>,
    donor: HashMap<DonorKey, String>,
}

impl CacheTables {
    fn contains(&self, id: &KeyId) -> bool {
        match id {
            KeyId::Neutron(key) => self.neutron.contains_key(key),
            KeyId::Grouping(key) => self.grouping.contains_key(key),
            KeyId::Donor(key) => self.donor.contains_key(key),
        }
    }
}

/// Drops `key` from `table` unless the item it names is still resident.
fn recheck<K, V>(
    table: &mut HashMap<K, V>,
    key: &K,
    name: impl FnOnce(&K, &V) -> String,
    residents: &dyn ResidentItems,
) -> bool
where
    K: Eq + Hash + fmt::Debug,
{
    let Some(value) = table.get(key) else {
        return false;
    };
    let name = name(key, value);
    if residents.is_resident(&name) {
        return true;
    }
    debug!(?key, item = %name, "dropping cache entry for item that is no longer resident");
    table.remove(key);
    false
}

/// Process-local load cache. Construct one and pass it to whoever loads data.
///
/// Fetches for the same identity are serialised; different identities load
/// in parallel. When a reduced-resolution fetch needs full-resolution data it
/// takes the reduced key first and the full key second, never the reverse.
pub struct LoadCache {
    executor: Arc<dyn FetchExecutor>,
    residents: Arc<dyn ResidentItems>,
    locator: Arc<dyn SourceLocator>,
    tables: Mutex<CacheTables>,
    key_locks: Mutex<HashMap<KeyId, Arc<Mutex<()>>>>,
}

impl fmt::Debug for LoadCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadCache").finish_non_exhaustive()
    }
}

impl LoadCache {
    /// Creates an empty cache over the given collaborators.
    #[must_use]
    pub fn new(
        executor: Arc<dyn FetchExecutor>,
        residents: Arc<dyn ResidentItems>,
        locator: Arc<dyn SourceLocator>,
    ) -> Self {
        Self {
            executor,
            residents,
            locator,
            tables: Mutex::new(CacheTables::default()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    fn tables(&self) -> Result<MutexGuard<'_, CacheTables>, CacheError> {
        self.tables
            .lock()
            .map_err(|_| CacheError::Poisoned { context: "cache tables" })
    }

    fn key_lock(&self, id: KeyId) -> Result<Arc<Mutex<()>>, CacheError> {
        let mut locks = self
            .key_locks
            .lock()
            .map_err(|_| CacheError::Poisoned { context: "cache key locks" })?;
        Ok(Arc::clone(locks.entry(id).or_default()))
    }

    /// Drops per-key locks that no table entry backs and no fetch holds.
    fn prune_key_locks(&self, tables: &CacheTables) -> Result<(), CacheError> {
        let mut locks = self
            .key_locks
            .lock()
            .map_err(|_| CacheError::Poisoned { context: "cache key locks" })?;
        let before = locks.len();
        // The map holds one reference; any other means a fetch has the lock.
        locks.retain(|id, lock| Arc::strong_count(lock) > 1 || tables.contains(id));
        debug!(pruned = before - locks.len(), "pruned cache key locks");
        Ok(())
    }

    /// Loads `path` into `target` and confirms the result is resident.
    fn load_into(&self, path: &Path, target: &str, loader_hint: &str) -> Option<String> {
        let outcome = self.executor.fetch(&FetchRequest {
            path,
            target,
            loader_hint,
        });
        if !outcome.success {
            warn!(path = %path.display(), target, "fetch executor reported failure");
            return None;
        }
        if !self.residents.is_resident(target) {
            warn!(
                path = %path.display(),
                target,
                reported = %outcome.resident_name,
                "fetch reported success but target is not resident"
            );
            return None;
        }
        debug!(path = %path.display(), target, loader = %outcome.loader_used, "loaded item");
        Some(outcome.loader_used)
    }

    /// Returns a fresh copy of the neutron data of `run` at `resolution`.
    ///
    /// Callers always receive a new copy; the cached raw item is never handed out.
    /// The raw item is found, in order: resident in the cache, loaded from its
    /// own file, or (for reduced resolution) derived from resident or loaded
    /// full-resolution data.
    ///
    /// # Errors
    /// - `CacheError::InvalidRun` if `run` is not a run number
    /// - `CacheError::LoadFailed` if every source is exhausted
    pub fn fetch_neutron_data(&self, run: &str, resolution: Resolution) -> Result<Fetched, CacheError> {
        let key = NeutronKey::new(run, resolution)?;
        let lock = self.key_lock(KeyId::Neutron(key.clone()))?;
        let _held = lock
            .lock()
            .map_err(|_| CacheError::Poisoned { context: "neutron key" })?;

        let cached = {
            let mut tables = self.tables()?;
            recheck(&mut tables.neutron, &key, |k, _| k.raw_name(), self.residents.as_ref())
        };

        let loader_used = if cached {
            CACHED_LOADER.to_string()
        } else {
            self.obtain_raw(&key)?
        };

        let name = {
            let mut tables = self.tables()?;
            *tables.neutron.entry(key.clone()).or_insert(0) += 1;
            let issued = tables.issued.entry(key.clone()).or_insert(0);
            loop {
                *issued = issued.wrapping_add(1);
                let name = key.copy_name(*issued);
                if !self.residents.is_resident(&name) {
                    break name;
                }
            }
        };
        self.residents.clone_item(&key.raw_name(), &name)?;

        Ok(Fetched { name, loader_used })
    }

    /// Makes the raw item for `key` resident and registers it. Caller holds the key lock.
    fn obtain_raw(&self, key: &NeutronKey) -> Result<String, CacheError> {
        let path = self.locator.neutron_data_path(&key.run, key.resolution);
        let raw = key.raw_name();

        if path.exists() {
            if let Some(loader) = self.load_into(&path, &raw, NEUTRON_HINT) {
                self.register_neutron(key)?;
                return Ok(loader);
            }
        }

        if key.resolution == Resolution::Reduced {
            if let Some(loader) = self.derive_reduced(key)? {
                self.register_neutron(key)?;
                return Ok(loader);
            }
        }

        Err(CacheError::LoadFailed {
            run: key.run.clone(),
            path,
        })
    }

    /// Builds the reduced raw item for `key` from full-resolution data.
    fn derive_reduced(&self, key: &NeutronKey) -> Result<Option<String>, CacheError> {
        let full = key.at(Resolution::Full);
        let lock = self.key_lock(KeyId::Neutron(full.clone()))?;
        let _held = lock
            .lock()
            .map_err(|_| CacheError::Poisoned { context: "neutron key" })?;

        let full_resident = {
            let mut tables = self.tables()?;
            recheck(&mut tables.neutron, &full, |k, _| k.raw_name(), self.residents.as_ref())
        };

        let loader = if full_resident {
            DERIVED_LOADER.to_string()
        } else {
            let full_path = self.locator.neutron_data_path(&full.run, Resolution::Full);
            if !full_path.exists() {
                return Ok(None);
            }
            let Some(loader) = self.load_into(&full_path, &full.raw_name(), NEUTRON_HINT) else {
                return Ok(None);
            };
            self.register_neutron(&full)?;
            loader
        };

        let raw = key.raw_name();
        self.residents.clone_item(&full.raw_name(), &raw)?;
        self.residents.reduce_resolution(&raw)?;
        info!(run = %key.run, source = %full.raw_name(), target = %raw, "derived reduced-resolution data");
        Ok(Some(loader))
    }

    fn register_neutron(&self, key: &NeutronKey) -> Result<(), CacheError> {
        self.tables()?.neutron.insert(key.clone(), 0);
        Ok(())
    }

    /// Loads neutron data straight into `target` without touching the cache.
    ///
    /// For callers that need exactly one copy. Reduced resolution still falls
    /// back to loading and reducing the full-resolution file.
    ///
    /// # Errors
    /// - `CacheError::InvalidRun` if `run` is not a run number
    /// - `CacheError::LoadFailed` if neither file loads
    pub fn fetch_neutron_data_single_use(
        &self,
        run: &str,
        resolution: Resolution,
        target: &str,
    ) -> Result<Fetched, CacheError> {
        let run = checked_run(run)?;
        let run = run.as_str();
        let path = self.locator.neutron_data_path(run, resolution);

        if path.exists() {
            if let Some(loader_used) = self.load_into(&path, target, NEUTRON_HINT) {
                return Ok(Fetched {
                    name: target.to_string(),
                    loader_used,
                });
            }
        }

        if resolution == Resolution::Reduced {
            let full_path = self.locator.neutron_data_path(run, Resolution::Full);
            if full_path.exists() {
                if let Some(loader_used) = self.load_into(&full_path, target, NEUTRON_HINT) {
                    self.residents.reduce_resolution(target)?;
                    return Ok(Fetched {
                        name: target.to_string(),
                        loader_used,
                    });
                }
            }
        }

        Err(CacheError::LoadFailed {
            run: run.to_string(),
            path,
        })
    }

    /// Returns the resident grouping definition of `scheme` for `run`, loading it once.
    ///
    /// # Errors
    /// - `CacheError::InvalidRun` if `run` is not a run number
    /// - `CacheError::LoadFailed` if the grouping file does not load
    pub fn fetch_grouping_definition(
        &self,
        scheme: &str,
        run: &str,
        resolution: Resolution,
    ) -> Result<Fetched, CacheError> {
        let key = GroupingKey {
            scheme: scheme.to_string(),
            run: checked_run(run)?,
            resolution,
        };
        let lock = self.key_lock(KeyId::Grouping(key.clone()))?;
        let _held = lock
            .lock()
            .map_err(|_| CacheError::Poisoned { context: "grouping key" })?;

        {
            let mut tables = self.tables()?;
            if recheck(&mut tables.grouping, &key, |_, name| name.clone(), self.residents.as_ref()) {
                if let Some(name) = tables.grouping.get(&key) {
                    return Ok(Fetched {
                        name: name.clone(),
                        loader_used: CACHED_LOADER.to_string(),
                    });
                }
            }
        }

        let path = self.locator.grouping_path(scheme, resolution);
        let name = key.resident_name();
        let Some(loader_used) = self.load_into(&path, &name, GROUPING_HINT) else {
            return Err(CacheError::LoadFailed { run: key.run, path });
        };
        self.tables()?.grouping.insert(key, name.clone());
        Ok(Fetched { name, loader_used })
    }

    /// Returns the resident instrument donor for `run`, loading it once.
    ///
    /// # Errors
    /// - `CacheError::InvalidRun` if `run` is not a run number
    /// - `CacheError::LoadFailed` if the donor file does not load
    pub fn fetch_instrument_donor(&self, run: &str, resolution: Resolution) -> Result<Fetched, CacheError> {
        let key = DonorKey {
            run: checked_run(run)?,
            resolution,
        };
        let lock = self.key_lock(KeyId::Donor(key.clone()))?;
        let _held = lock
            .lock()
            .map_err(|_| CacheError::Poisoned { context: "donor key" })?;

        {
            let mut tables = self.tables()?;
            if recheck(&mut tables.donor, &key, |_, name| name.clone(), self.residents.as_ref()) {
                if let Some(name) = tables.donor.get(&key) {
                    return Ok(Fetched {
                        name: name.clone(),
                        loader_used: CACHED_LOADER.to_string(),
                    });
                }
            }
        }

        let path = self.locator.instrument_donor_path(&key.run, resolution);
        let name = key.resident_name();
        let Some(loader_used) = self.load_into(&path, &name, DONOR_HINT) else {
            return Err(CacheError::LoadFailed { run: key.run, path });
        };
        self.tables()?.donor.insert(key, name.clone());
        Ok(Fetched { name, loader_used })
    }

    /// Drops neutron entries whose raw item is gone. Returns how many were dropped.
    ///
    /// # Errors
    /// `CacheError::Poisoned` if the tables lock is poisoned.
    pub fn rebuild_neutron_cache(&self) -> Result<usize, CacheError> {
        let mut guard = self.tables()?;
        let tables = &mut *guard;
        let before = tables.neutron.len();
        tables
            .neutron
            .retain(|key, _| self.residents.is_resident(&key.raw_name()));
        let neutron = &tables.neutron;
        tables.issued.retain(|key, _| neutron.contains_key(key));
        self.prune_key_locks(tables)?;
        Ok(before - tables.neutron.len())
    }

    /// Drops grouping entries whose item is gone. Returns how many were dropped.
    ///
    /// # Errors
    /// `CacheError::Poisoned` if the tables lock is poisoned.
    pub fn rebuild_grouping_cache(&self) -> Result<usize, CacheError> {
        let mut tables = self.tables()?;
        let before = tables.grouping.len();
        tables.grouping.retain(|_, name| self.residents.is_resident(name));
        self.prune_key_locks(&tables)?;
        Ok(before - tables.grouping.len())
    }

    /// Drops instrument donor entries whose item is gone. Returns how many were dropped.
    ///
    /// # Errors
    /// `CacheError::Poisoned` if the tables lock is poisoned.
    pub fn rebuild_donor_cache(&self) -> Result<usize, CacheError> {
        let mut tables = self.tables()?;
        let before = tables.donor.len();
        tables.donor.retain(|_, name| self.residents.is_resident(name));
        self.prune_key_locks(&tables)?;
        Ok(before - tables.donor.len())
    }

    /// Rebuilds all three tables. Use after bulk cleanup of resident items.
    ///
    /// # Errors
    /// `CacheError::Poisoned` if the tables lock is poisoned.
    pub fn rebuild(&self) -> Result<usize, CacheError> {
        let dropped =
            self.rebuild_neutron_cache()? + self.rebuild_grouping_cache()? + self.rebuild_donor_cache()?;
        if dropped > 0 {
            info!(dropped, "rebuilt load cache");
        }
        Ok(dropped)
    }

    /// Forgets every entry. Resident items are left alone.
    ///
    /// # Errors
    /// `CacheError::Poisoned` if a lock is poisoned.
    pub fn clear(&self) -> Result<(), CacheError> {
        *self.tables()? = CacheTables::default();
        self.key_locks
            .lock()
            .map_err(|_| CacheError::Poisoned { context: "cache key locks" })?
            .clear();
        Ok(())
    }

    /// Copies handed out from the cached raw item of `run`, if one is cached.
    ///
    /// # Errors
    /// `CacheError::InvalidRun` for a non-numeric run, `CacheError::Poisoned`
    /// if the tables lock is poisoned.
    pub fn neutron_generation(&self, run: &str, resolution: Resolution) -> Result<Option<u32>, CacheError> {
        let key = NeutronKey::new(run, resolution)?;
        Ok(self.tables()?.neutron.get(&key).copied())
    }

    /// Name of the cached raw neutron item, if cached and still resident.
    ///
    /// # Errors
    /// `CacheError::InvalidRun` for a non-numeric run, `CacheError::Poisoned`
    /// if the tables lock is poisoned.
    pub fn resident_raw_name(&self, run: &str, resolution: Resolution) -> Result<Option<String>, CacheError> {
        let key = NeutronKey::new(run, resolution)?;
        let mut tables = self.tables()?;
        Ok(recheck(&mut tables.neutron, &key, |k, _| k.raw_name(), self.residents.as_ref())
            .then(|| key.raw_name()))
    }

    /// Path the neutron data of `run` would be loaded from.
    #[must_use]
    pub fn neutron_data_path(&self, run: &str, resolution: Resolution) -> PathBuf {
        self.locator.neutron_data_path(run.trim(), resolution)
    }
}
