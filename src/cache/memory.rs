//! In-memory resident item service.
//!
//! [`MemoryBackend`] plays both collaborator roles of the load cache: it
//! "loads" a file by recording its path under the target name and tracks
//! which names are resident. It is intended for embedded usage and tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::{FetchExecutor, FetchOutcome, FetchRequest, ResidentItems};
use crate::error::CacheError;

fn lock_err(context: &'static str) -> CacheError {
    CacheError::Poisoned { context }
}

/// A resident item: where it came from and whether it was reduced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryItem {
    /// File the item was loaded from.
    pub source: PathBuf,
    /// Whether the item was reduced in place.
    pub reduced: bool,
}

#[derive(Debug, Default)]
struct LoadStats {
    by_path: HashMap<PathBuf, usize>,
    failing: HashSet<PathBuf>,
}

/// Thread-safe in-memory implementation of [`FetchExecutor`] and [`ResidentItems`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    items: RwLock<HashMap<String, MemoryItem>>,
    stats: Mutex<LoadStats>,
    load_delay: Option<Duration>,
}

impl MemoryBackend {
    /// An empty backend with no load delay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` inside every load, widening race windows in tests.
    #[must_use]
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Makes every later load of `path` report failure.
    pub fn fail_path(&self, path: &Path) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.failing.insert(path.to_path_buf());
        }
    }

    /// Number of loads attempted from `path`.
    #[must_use]
    pub fn load_count(&self, path: &Path) -> usize {
        self.stats
            .lock()
            .map(|s| s.by_path.get(path).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Loads attempted across all paths.
    #[must_use]
    pub fn total_loads(&self) -> usize {
        self.stats.lock().map(|s| s.by_path.values().sum()).unwrap_or(0)
    }

    /// Drops `name`, as an external cleanup would. Returns whether it was resident.
    pub fn remove(&self, name: &str) -> bool {
        self.items
            .write()
            .map(|mut items| items.remove(name).is_some())
            .unwrap_or(false)
    }

    /// The item resident under `name`.
    #[must_use]
    pub fn item(&self, name: &str) -> Option<MemoryItem> {
        self.items.read().ok()?.get(name).cloned()
    }

    /// True if `name` is resident and was reduced.
    #[must_use]
    pub fn is_reduced(&self, name: &str) -> bool {
        self.item(name).is_some_and(|item| item.reduced)
    }

    /// Every resident name, sorted.
    #[must_use]
    pub fn resident_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .items
            .read()
            .map(|items| items.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl FetchExecutor for MemoryBackend {
    fn fetch(&self, request: &FetchRequest<'_>) -> FetchOutcome {
        let failed = FetchOutcome {
            success: false,
            loader_used: String::new(),
            resident_name: request.target.to_string(),
        };

        let should_fail = match self.stats.lock() {
            Ok(mut stats) => {
                *stats.by_path.entry(request.path.to_path_buf()).or_insert(0) += 1;
                stats.failing.contains(request.path)
            }
            Err(_) => return failed,
        };
        if let Some(delay) = self.load_delay {
            thread::sleep(delay);
        }
        if should_fail || !request.path.is_file() {
            return failed;
        }

        let Ok(mut items) = self.items.write() else {
            return failed;
        };
        items.insert(
            request.target.to_string(),
            MemoryItem {
                source: request.path.to_path_buf(),
                reduced: false,
            },
        );
        debug!(path = %request.path.display(), target = request.target, "memory backend loaded item");

        FetchOutcome {
            success: true,
            loader_used: format!("memory:{}", request.loader_hint),
            resident_name: request.target.to_string(),
        }
    }
}

impl ResidentItems for MemoryBackend {
    fn is_resident(&self, name: &str) -> bool {
        self.items.read().is_ok_and(|items| items.contains_key(name))
    }

    fn clone_item(&self, source: &str, target: &str) -> Result<(), CacheError> {
        let mut items = self.items.write().map_err(|_| lock_err("memory items"))?;
        let item = items
            .get(source)
            .cloned()
            .ok_or_else(|| CacheError::backend("clone", format!("'{source}' is not resident")))?;
        items.insert(target.to_string(), item);
        Ok(())
    }

    fn reduce_resolution(&self, name: &str) -> Result<(), CacheError> {
        let mut items = self.items.write().map_err(|_| lock_err("memory items"))?;
        let item = items
            .get_mut(name)
            .ok_or_else(|| CacheError::backend("reduce", format!("'{name}' is not resident")))?;
        item.reduced = true;
        Ok(())
    }
}
