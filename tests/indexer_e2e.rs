//! End-to-end tests for the versioned artifact store.
//!
//! These tests drive the public `Indexer` API against real directories:
//! - Version assignment for DEFAULT and NEXT
//! - Overwrite protection and round trips
//! - Run applicability across versions
//! - Ledger recovery from version directories

use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;

use calib_store::{
    AppliesTo, Calibration, CalibrationInputs, CalibrationOutputs, CalibrationParameters,
    CalibrationRecord, IndexEntry, IndexError, Indexer, OpenMode, Record, StoreConfig, Version,
};
use chrono::{Duration, TimeZone, Utc};
use tempfile::{tempdir, TempDir};

fn config(locks: &TempDir) -> StoreConfig {
    StoreConfig {
        lock_timeout: std::time::Duration::from_secs(10),
        ..StoreConfig::with_lock_root(locks.path())
    }
}

fn record(run: &str, version: Version, focus_group: &str) -> CalibrationRecord {
    let entry = IndexEntry::builder(run).version(version).build().unwrap();
    Record::new(
        run,
        false,
        entry,
        CalibrationOutputs {
            focus_group: focus_group.to_string(),
            ..CalibrationOutputs::default()
        },
    )
}

fn parameters(run: &str, version: u32) -> CalibrationParameters {
    let entry = IndexEntry::builder(run).version(version).build().unwrap();
    CalibrationParameters::new(
        run,
        false,
        entry,
        CalibrationInputs {
            instrument_state: "04bd2c53f6bf6754".to_string(),
            convergence_threshold: 0.5,
            peak_function: "Gaussian".to_string(),
            crystal_d_min: 0.4,
            crystal_d_max: 100.0,
        },
    )
}

fn applicable(run: &str, applies_to: &str, minutes: i64) -> CalibrationRecord {
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let entry = IndexEntry::builder(run)
        .applies_to(AppliesTo::parse(applies_to).unwrap())
        .timestamp(base + Duration::minutes(minutes))
        .build()
        .unwrap();
    Record::new(run, false, entry, CalibrationOutputs::default())
}

#[test]
fn test_default_then_next_versions() {
    let (locks, data) = (tempdir().unwrap(), tempdir().unwrap());
    let mut store = Indexer::<Calibration>::open(data.path(), config(&locks)).unwrap();

    let default = store.write_record(record("46680", Version::Default, "All"), false).unwrap();
    assert_eq!(default.version, Version::Number(0));
    assert!(data.path().join("v_default").join("CalibrationRecord.json").is_file());

    let mut assigned = Vec::new();
    for _ in 0..3 {
        let written = store.write_record(record("46680", Version::Next, "Column"), false).unwrap();
        assigned.push(written.version.require_concrete().unwrap());
    }
    assert_eq!(assigned, vec![1, 2, 3]);
    assert!(data.path().join("v_0003").is_dir());
    assert_eq!(store.current_version().unwrap(), Some(3));
    assert_eq!(store.next_version().unwrap(), 4);

    store.close().unwrap();

    let reopened = Indexer::<Calibration>::open(data.path(), config(&locks)).unwrap();
    assert_eq!(reopened.versions(), vec![0, 1, 2, 3]);
    for entry in reopened.index_entries() {
        assert!(!entry.version.is_sentinel());
    }
}

#[test]
fn test_overwrite_rejection_leaves_file_unchanged() {
    let (locks, data) = (tempdir().unwrap(), tempdir().unwrap());
    let mut store = Indexer::<Calibration>::open(data.path(), config(&locks)).unwrap();

    store.write_record(record("46680", Version::Number(1), "Column"), false).unwrap();
    let path = store.record_path(1);
    let before = fs::read(&path).unwrap();

    let err = store
        .write_record(record("46680", Version::Number(1), "Bank"), false)
        .unwrap_err();
    match err {
        IndexError::VersionCollision { version, path: collided } => {
            assert_eq!(version, 1);
            assert_eq!(collided, path);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fs::read(&path).unwrap(), before);

    store.write_record(record("46680", Version::Number(1), "Bank"), true).unwrap();
    let read = store.read_record(Some(Version::Number(1))).unwrap();
    assert_eq!(read.detail.focus_group, "Bank");
}

#[test]
fn test_round_trip_record_and_parameters() {
    let (locks, data) = (tempdir().unwrap(), tempdir().unwrap());
    let mut store = Indexer::<Calibration>::open(data.path(), config(&locks)).unwrap();

    let mut rec = record("46680", Version::Next, "Column");
    rec.detail.metrics.insert("sigma".to_string(), 0.0125);
    rec.detail
        .workspaces
        .insert("diffcal".to_string(), vec!["diffract_consts_046680_v0001".to_string()]);
    let written = store.write_record(rec, false).unwrap();
    let version = written.version.require_concrete().unwrap();

    let params = store.write_parameters(parameters("46680", version), false).unwrap();

    assert_eq!(store.read_record(Some(Version::Number(version))).unwrap(), written);
    assert_eq!(store.read_parameters(None).unwrap(), params);
    assert_eq!(store.index_entry(version), Some(&written.index_entry));
}

#[test]
fn test_latest_applicable_version_across_writes() {
    let (locks, data) = (tempdir().unwrap(), tempdir().unwrap());
    let mut store = Indexer::<Calibration>::open(data.path(), config(&locks)).unwrap();

    // DEFAULT covers every run; later versions cover ranges.
    store.write_record(applicable("1", ">=0", 0), false).unwrap();
    store.write_record(applicable("100", ">=100", 1), false).unwrap();
    store.write_record(applicable("10", "<50", 2), false).unwrap();
    store.write_record(applicable("75", "75", 3), false).unwrap();

    assert_eq!(store.latest_applicable_version("150").unwrap(), Some(1));
    assert_eq!(store.latest_applicable_version("20").unwrap(), Some(2));
    assert_eq!(store.latest_applicable_version("75").unwrap(), Some(3));
    assert_eq!(store.latest_applicable_version("60").unwrap(), Some(0));

    let err = store.latest_applicable_version("run-60").unwrap_err();
    assert!(matches!(err, IndexError::InvalidRunNumber { .. }));
}

#[test]
fn test_recover_index_from_directories() {
    let (locks, data) = (tempdir().unwrap(), tempdir().unwrap());
    {
        let mut store = Indexer::<Calibration>::open(data.path(), config(&locks)).unwrap();
        for _ in 0..3 {
            let written = store.write_record(record("46680", Version::Next, "Column"), false).unwrap();
            let version = written.version.require_concrete().unwrap();
            store.write_parameters(parameters("46680", version), false).unwrap();
        }
        store.close().unwrap();
    }

    // Version 2's parameters claim to belong elsewhere.
    let params_path = data.path().join("v_0002").join("CalibrationParameters.json");
    let mut json: serde_json::Value = serde_json::from_slice(&fs::read(&params_path).unwrap()).unwrap();
    json["version"] = serde_json::json!(7);
    fs::write(&params_path, serde_json::to_vec(&json).unwrap()).unwrap();

    // And the ledger itself is gone bad.
    fs::write(data.path().join("CalibrationIndex.json"), "[{ truncated").unwrap();

    let err = Indexer::<Calibration>::open(data.path(), config(&locks)).unwrap_err();
    assert!(matches!(err, IndexError::CorruptIndex { .. }));
    assert!(!err.is_user_recoverable());

    let mut store =
        Indexer::<Calibration>::open_with_mode(data.path(), config(&locks), OpenMode::Recovery).unwrap();
    assert!(store.versions().is_empty());

    let preview = store.recover_index(true).unwrap();
    assert!(preview.dryrun);
    assert_eq!(preview.recovered, vec![0, 1]);
    assert_eq!(preview.skipped.len(), 1);
    assert_eq!(preview.skipped[0].0, 2);
    assert!(preview.skipped[0].1.contains("parameters"));
    assert!(store.versions().is_empty());

    let report = store.recover_index(false).unwrap();
    assert_eq!(report.recovered, vec![0, 1]);
    store.close().unwrap();

    let reopened = Indexer::<Calibration>::open(data.path(), config(&locks)).unwrap();
    assert_eq!(reopened.versions(), vec![0, 1]);
    // The skipped directory still counts towards version assignment.
    assert_eq!(reopened.current_version().unwrap(), Some(2));
}

#[test]
fn test_concurrent_stores_never_share_a_version() {
    let (locks, data) = (tempdir().unwrap(), tempdir().unwrap());
    let writers = 4;
    let per_writer = 5;
    let barrier = Arc::new(Barrier::new(writers));

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let root = data.path().to_path_buf();
            let cfg = config(&locks);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut store = Indexer::<Calibration>::open(root, cfg).unwrap();
                barrier.wait();
                (0..per_writer)
                    .map(|_| {
                        let run = format!("{}", 1000 + w);
                        let written = store.write_record(record(&run, Version::Next, "Column"), false).unwrap();
                        written.version.require_concrete().unwrap()
                    })
                    .collect::<Vec<u32>>()
            })
        })
        .collect();

    let mut all: Vec<u32> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    let expected: Vec<u32> = (0..u32::try_from(writers * per_writer).unwrap()).collect();
    assert_eq!(all, expected);

    let store = Indexer::<Calibration>::open(data.path(), config(&locks)).unwrap();
    assert_eq!(store.versions(), expected);
}
