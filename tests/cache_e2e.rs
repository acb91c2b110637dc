//! End-to-end tests for the load cache.
//!
//! These tests verify that the cache:
//! - Falls back from reduced to full resolution without reloading full data
//! - Loads each identity at most once under concurrent callers
//! - Notices items removed behind its back
//! - Reports exhausted fallbacks with the run and path

use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use calib_store::cache::CACHED_LOADER;
use calib_store::{
    CacheError, DirectoryLayout, FetchExecutor, FetchOutcome, FetchRequest, LoadCache,
    MemoryBackend, ResidentItems, Resolution, SourceLocator,
};
use tempfile::{tempdir, TempDir};

struct Fixture {
    _dir: TempDir,
    layout: DirectoryLayout,
    backend: Arc<MemoryBackend>,
    cache: Arc<LoadCache>,
}

fn fixture(backend: MemoryBackend) -> Fixture {
    let dir = tempdir().unwrap();
    let layout = DirectoryLayout::new(dir.path());
    for root in [&layout.full_root, &layout.reduced_root, &layout.grouping_root] {
        fs::create_dir_all(root).unwrap();
    }
    let backend = Arc::new(backend);
    let cache = Arc::new(LoadCache::new(
        backend.clone(),
        backend.clone(),
        Arc::new(layout.clone()),
    ));
    Fixture {
        _dir: dir,
        layout,
        backend,
        cache,
    }
}

fn touch(path: &Path) {
    fs::write(path, b"neutron events").unwrap();
}

#[test]
fn test_reduced_derived_from_resident_full_without_reload() {
    let f = fixture(MemoryBackend::new());
    let full = f.layout.neutron_data_path("46680", Resolution::Full);
    let reduced = f.layout.neutron_data_path("46680", Resolution::Reduced);
    touch(&full);

    let native = f.cache.fetch_neutron_data("46680", Resolution::Full).unwrap();
    assert!(!f.backend.is_reduced(&native.name));

    let lite = f.cache.fetch_neutron_data("46680", Resolution::Reduced).unwrap();
    assert_eq!(lite.loader_used, calib_store::cache::DERIVED_LOADER);
    assert!(f.backend.is_reduced(&lite.name));
    assert_eq!(f.backend.load_count(&full), 1);
    assert_eq!(f.backend.load_count(&reduced), 0);

    let again = f.cache.fetch_neutron_data("46680", Resolution::Reduced).unwrap();
    assert_eq!(again.loader_used, CACHED_LOADER);
    assert_eq!(f.backend.total_loads(), 1);
}

#[test]
fn test_reduced_file_preferred_over_derivation() {
    let f = fixture(MemoryBackend::new());
    let full = f.layout.neutron_data_path("46680", Resolution::Full);
    let reduced = f.layout.neutron_data_path("46680", Resolution::Reduced);
    touch(&full);
    touch(&reduced);

    let lite = f.cache.fetch_neutron_data("46680", Resolution::Reduced).unwrap();
    assert_eq!(f.backend.load_count(&reduced), 1);
    assert_eq!(f.backend.load_count(&full), 0);
    assert_eq!(f.backend.item(&lite.name).unwrap().source, reduced);
}

#[test]
fn test_concurrent_fetches_load_once() {
    let f = fixture(MemoryBackend::new().with_load_delay(Duration::from_millis(30)));
    let full = f.layout.neutron_data_path("46680", Resolution::Full);
    touch(&full);

    let callers = 8;
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|i| {
            let cache = Arc::clone(&f.cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let resolution = if i % 2 == 0 {
                    Resolution::Full
                } else {
                    Resolution::Reduced
                };
                cache.fetch_neutron_data("46680", resolution).unwrap()
            })
        })
        .collect();

    let mut names: Vec<String> = handles.into_iter().map(|h| h.join().unwrap().name).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), callers);

    assert_eq!(f.backend.load_count(&full), 1);
    assert_eq!(f.cache.neutron_generation("46680", Resolution::Full).unwrap(), Some(4));
    assert_eq!(f.cache.neutron_generation("46680", Resolution::Reduced).unwrap(), Some(4));
}

#[test]
fn test_distinct_runs_load_independently() {
    let f = fixture(MemoryBackend::new().with_load_delay(Duration::from_millis(10)));
    let runs = ["100", "101", "102", "103"];
    for run in runs {
        touch(&f.layout.neutron_data_path(run, Resolution::Full));
    }

    let handles: Vec<_> = runs
        .iter()
        .map(|run| {
            let cache = Arc::clone(&f.cache);
            let run = (*run).to_string();
            thread::spawn(move || cache.fetch_neutron_data(&run, Resolution::Full).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for run in runs {
        assert_eq!(f.backend.load_count(&f.layout.neutron_data_path(run, Resolution::Full)), 1);
    }
}

#[test]
fn test_external_removal_is_noticed() {
    let f = fixture(MemoryBackend::new());
    let full = f.layout.neutron_data_path("46680", Resolution::Full);
    touch(&full);

    f.cache.fetch_neutron_data("46680", Resolution::Full).unwrap();
    let raw = f.cache.resident_raw_name("46680", Resolution::Full).unwrap().unwrap();

    // Some other component clears memory.
    for name in f.backend.resident_names() {
        f.backend.remove(&name);
    }
    assert!(!f.backend.is_resident(&raw));
    assert_eq!(f.cache.resident_raw_name("46680", Resolution::Full).unwrap(), None);

    let fetched = f.cache.fetch_neutron_data("46680", Resolution::Full).unwrap();
    assert_ne!(fetched.loader_used, CACHED_LOADER);
    assert_eq!(f.backend.load_count(&full), 2);
}

#[test]
fn test_rebuild_drops_stale_entries_only() {
    let f = fixture(MemoryBackend::new());
    touch(&f.layout.neutron_data_path("1", Resolution::Full));
    touch(&f.layout.neutron_data_path("2", Resolution::Full));
    touch(&f.layout.grouping_path("Column", Resolution::Full));

    f.cache.fetch_neutron_data("1", Resolution::Full).unwrap();
    f.cache.fetch_neutron_data("2", Resolution::Full).unwrap();
    let grouping = f.cache.fetch_grouping_definition("Column", "1", Resolution::Full).unwrap();
    let donor = f.cache.fetch_instrument_donor("2", Resolution::Full).unwrap();

    let raw = f.cache.resident_raw_name("1", Resolution::Full).unwrap().unwrap();
    f.backend.remove(&raw);
    f.backend.remove(&grouping.name);

    assert_eq!(f.cache.rebuild_neutron_cache().unwrap(), 1);
    assert_eq!(f.cache.rebuild_grouping_cache().unwrap(), 1);
    assert_eq!(f.cache.rebuild_donor_cache().unwrap(), 0);
    assert_eq!(f.cache.rebuild().unwrap(), 0);

    assert_eq!(f.cache.neutron_generation("1", Resolution::Full).unwrap(), None);
    assert_eq!(f.cache.neutron_generation("2", Resolution::Full).unwrap(), Some(1));
    let cached_donor = f.cache.fetch_instrument_donor("2", Resolution::Full).unwrap();
    assert_eq!(cached_donor.name, donor.name);
    assert_eq!(cached_donor.loader_used, CACHED_LOADER);
}

#[test]
fn test_single_use_bypasses_cache() {
    let f = fixture(MemoryBackend::new());
    let full = f.layout.neutron_data_path("46680", Resolution::Full);
    touch(&full);

    let scratch = f
        .cache
        .fetch_neutron_data_single_use("46680", Resolution::Reduced, "scratch_46680")
        .unwrap();
    assert_eq!(scratch.name, "scratch_46680");
    assert!(f.backend.is_reduced("scratch_46680"));
    assert_eq!(f.cache.neutron_generation("46680", Resolution::Reduced).unwrap(), None);
    assert_eq!(f.cache.neutron_generation("46680", Resolution::Full).unwrap(), None);

    f.cache.fetch_neutron_data("46680", Resolution::Full).unwrap();
    assert_eq!(f.backend.load_count(&full), 2);
}

#[test]
fn test_load_failure_names_run_and_path() {
    let f = fixture(MemoryBackend::new());

    let err = f.cache.fetch_neutron_data("46680", Resolution::Full).unwrap_err();
    let expected = f.layout.neutron_data_path("46680", Resolution::Full);
    assert!(matches!(err, CacheError::LoadFailed { ref run, ref path } if run == "46680" && *path == expected));
    let message = err.to_string();
    assert!(message.contains("46680"));
    assert!(message.contains(&expected.display().to_string()));

    let err = f
        .cache
        .fetch_grouping_definition("Bank", "46680", Resolution::Reduced)
        .unwrap_err();
    assert!(matches!(err, CacheError::LoadFailed { .. }));
}

/// Reports success without making anything resident.
struct LyingExecutor;

impl FetchExecutor for LyingExecutor {
    fn fetch(&self, request: &FetchRequest<'_>) -> FetchOutcome {
        FetchOutcome {
            success: true,
            loader_used: "liar".to_string(),
            resident_name: request.target.to_string(),
        }
    }
}

#[test]
fn test_success_without_residency_is_a_failure() {
    let dir = tempdir().unwrap();
    let layout = DirectoryLayout::new(dir.path());
    fs::create_dir_all(&layout.full_root).unwrap();
    touch(&layout.neutron_data_path("7", Resolution::Full));

    let cache = LoadCache::new(
        Arc::new(LyingExecutor),
        Arc::new(MemoryBackend::new()),
        Arc::new(layout),
    );
    let err = cache.fetch_neutron_data("7", Resolution::Full).unwrap_err();
    assert!(matches!(err, CacheError::LoadFailed { .. }));
}
