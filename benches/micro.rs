//! Micro-benchmarks for StrataDB core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- write     # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use stratadb::{Db, DbConfig, PosixEnv, SafetyLevel, SeekMode, WorkFlags};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Default value payload (128 bytes).
const VALUE_128B: &[u8; 128] = &[0xAB; 128];

/// Format a zero-padded key.
fn make_key(i: u64) -> Vec<u8> {
    format!("key-{i:012}").into_bytes()
}

/// Open a fresh database; safety off so benchmarks measure the engine,
/// not the disk's fsync latency.
fn open_db(dir: &std::path::Path, write_buffer: usize) -> Db {
    Db::open_with(
        Arc::new(PosixEnv),
        dir.join("bench.db"),
        DbConfig {
            write_buffer,
            safety: SafetyLevel::Off,
            ..DbConfig::default()
        },
    )
    .expect("open")
}

/// Pre-populate with `count` sequential keys, flushed and merged into
/// settled on-disk segments.
fn prepopulate(db: &Db, count: u64) {
    for i in 0..count {
        db.write(&make_key(i), VALUE_128B).unwrap();
    }
    db.work(WorkFlags::FLUSH, 0).unwrap();
    loop {
        let n = db
            .work(WorkFlags::MERGE | WorkFlags::OPTIMIZE, 100_000)
            .unwrap();
        if n == 0 {
            break;
        }
    }
    db.work(WorkFlags::CHECKPOINT, 0).unwrap();
}

// ================================================================================================
// Write benchmarks
// ================================================================================================

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    group.throughput(Throughput::Bytes(VALUE_128B.len() as u64));

    group.bench_function("sequential_128b", |b| {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path(), 64 * 1024 * 1024);
        let mut i = 0u64;
        b.iter(|| {
            db.write(&make_key(i), black_box(VALUE_128B)).unwrap();
            i += 1;
        });
    });

    group.bench_function("sequential_128b_small_buffer", |b| {
        // 256 KiB buffer: autowork flushes and merges along the way.
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path(), 256 * 1024);
        let mut i = 0u64;
        b.iter(|| {
            db.write(&make_key(i), black_box(VALUE_128B)).unwrap();
            i += 1;
        });
    });

    group.finish();
}

// ================================================================================================
// Read benchmarks
// ================================================================================================

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");

    for &count in &[1_000u64, 10_000] {
        group.bench_with_input(BenchmarkId::new("point_get", count), &count, |b, &count| {
            let dir = TempDir::new().unwrap();
            let db = open_db(dir.path(), 64 * 1024 * 1024);
            prepopulate(&db, count);
            let mut i = 0u64;
            b.iter(|| {
                let got = db.get(&make_key(i % count)).unwrap();
                black_box(got);
                i += 1;
            });
        });
    }

    group.bench_function("seek_ge", |b| {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path(), 64 * 1024 * 1024);
        prepopulate(&db, 10_000);
        let mut cursor = db.cursor().unwrap();
        let mut i = 0u64;
        b.iter(|| {
            cursor.seek(&make_key(i % 10_000), SeekMode::Ge).unwrap();
            black_box(cursor.key());
            i += 7;
        });
    });

    group.finish();
}

// ================================================================================================
// Scan benchmarks
// ================================================================================================

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    group.sample_size(20);

    group.bench_function("full_scan_10k", |b| {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path(), 64 * 1024 * 1024);
        prepopulate(&db, 10_000);
        b.iter(|| {
            let mut cursor = db.cursor().unwrap();
            cursor.first().unwrap();
            let mut n = 0u64;
            while cursor.valid() {
                black_box(cursor.value());
                cursor.next().unwrap();
                n += 1;
            }
            assert_eq!(n, 10_000);
        });
    });

    group.finish();
}

// ================================================================================================
// Work benchmarks
// ================================================================================================

fn bench_work(c: &mut Criterion) {
    let mut group = c.benchmark_group("work");
    group.sample_size(10);

    group.bench_function("flush_10k", |b| {
        b.iter_with_setup(
            || {
                let dir = TempDir::new().unwrap();
                let db = open_db(dir.path(), 64 * 1024 * 1024);
                for i in 0..10_000u64 {
                    db.write(&make_key(i), VALUE_128B).unwrap();
                }
                (dir, db)
            },
            |(dir, db)| {
                db.work(WorkFlags::FLUSH | WorkFlags::CHECKPOINT, 0).unwrap();
                drop(db);
                drop(dir);
            },
        );
    });

    group.finish();
}

criterion_group!(benches, bench_write, bench_read, bench_scan, bench_work);
criterion_main!(benches);
