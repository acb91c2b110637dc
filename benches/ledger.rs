use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use calib_store::{AppliesTo, IndexEntry, OpenMode, StoreConfig, Version, VersionLedger};
use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

fn open_ledger(locks: &TempDir, data: &TempDir) -> VersionLedger {
    let config = StoreConfig {
        sync_on_write: false,
        ..StoreConfig::with_lock_root(locks.path())
    };
    VersionLedger::open(data.path(), "CalibrationIndex.json", config, OpenMode::Normal).unwrap()
}

fn bench_add_index_entry(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_commit");
    group.throughput(Throughput::Elements(1));

    group.bench_function("add_next_entry", |b| {
        b.iter_custom(|iters| {
            // Fresh directory per sample so the ledger does not grow across samples.
            let (locks, data) = (TempDir::new().unwrap(), TempDir::new().unwrap());
            let mut ledger = open_ledger(&locks, &data);

            let start = Instant::now();
            for _ in 0..iters {
                let entry = IndexEntry::builder("46680").version(Version::Next).build().unwrap();
                ledger.add_index_entry(entry).unwrap();
            }
            start.elapsed()
        });
    });
    group.finish();
}

fn bench_latest_applicable_version(c: &mut Criterion) {
    let (locks, data) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let mut ledger = open_ledger(&locks, &data);

    // 256 versions, each covering a 100-run window.
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    for i in 0..256u64 {
        let low = 40_000 + i * 100;
        let entry = IndexEntry::builder(low.to_string())
            .version(Version::Next)
            .applies_to(AppliesTo::parse(&format!(">={low}, <{}", low + 100)).unwrap())
            .timestamp(base + Duration::minutes(i64::try_from(i).unwrap()))
            .build()
            .unwrap();
        ledger.add_index_entry(entry).unwrap();
    }

    c.bench_function("ledger/latest_applicable_version", |b| {
        b.iter(|| ledger.latest_applicable_version("52345").unwrap());
    });
}

criterion_group!(ledger, bench_add_index_entry, bench_latest_applicable_version);
criterion_main!(ledger);
