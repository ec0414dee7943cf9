//! Benchmarks for strata crash recovery
//!
//! Run with: cargo bench

use std::path::Path;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tempfile::tempdir;

use strata::recovery::{scan_file, RecoveryPerformer};
use strata::storage::*;
use strata::TimeRangeIndex;

fn bench_points(count: usize) -> Vec<Point> {
    (0..count)
        .map(|i| Point::new(i as i64 * 1000, i as f64))
        .collect()
}

fn write_sealed_file(path: &Path, groups: usize, with_companion: bool) -> Vec<GroupEntry> {
    let mut writer = DataFileWriter::create(path).unwrap();
    let points = bench_points(100);
    for i in 0..groups {
        let device = DeviceId::new(format!("bench.d{}", i % 8));
        writer
            .write_group(&device, &[("value", points.clone())])
            .unwrap();
    }
    let entries = writer.groups().to_vec();
    let index = writer.seal().unwrap();
    if with_companion {
        index.save(ranges_path(path)).unwrap();
    }
    entries
}

fn strip_footer(path: &Path, entries: &[GroupEntry]) {
    let data_end = entries.last().unwrap().end_offset();
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(data_end).unwrap();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");

    for groups in [10, 100, 1000] {
        group.throughput(Throughput::Elements(groups as u64));

        let dir = tempdir().unwrap();
        let sealed = dir.path().join("sealed.tsd");
        write_sealed_file(&sealed, groups, false);

        // Footer present: the scan is a single footer probe
        group.bench_function(format!("footer_probe_{}", groups), |b| {
            b.iter(|| scan_file(black_box(&sealed)).unwrap())
        });

        let torn = dir.path().join("torn.tsd");
        let entries = write_sealed_file(&torn, groups, false);
        strip_footer(&torn, &entries);

        // Footer gone: the scan walks every group
        group.bench_function(format!("forward_walk_{}", groups), |b| {
            b.iter(|| scan_file(black_box(&torn)).unwrap())
        });
    }

    group.finish();
}

fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery");

    group.bench_function("clean_check_100", |b| {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clean.tsd");
        write_sealed_file(&path, 100, true);

        b.iter(|| {
            let mut performer = RecoveryPerformer::new(black_box(&path));
            performer.recover().unwrap()
        });
    });

    group.bench_function("repair_truncated_100", |b| {
        let dir = tempdir().unwrap();
        let master = dir.path().join("master.tsd");
        let entries = write_sealed_file(&master, 100, false);
        let bytes = std::fs::read(&master).unwrap();
        // Cut inside the last group so repair truncates and reseals
        let cut = entries.last().unwrap().offset as usize + 5;
        let path = dir.path().join("work.tsd");

        b.iter_custom(|iters| {
            let mut total = Duration::ZERO;
            for _ in 0..iters {
                std::fs::write(&path, &bytes[..cut]).unwrap();
                let _ = std::fs::remove_file(ranges_path(&path));

                let start = Instant::now();
                let mut performer = RecoveryPerformer::new(&path);
                performer.recover().unwrap();
                total += start.elapsed();
            }
            total
        });
    });

    group.finish();
}

fn bench_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("index");

    for groups in [100, 1000, 10000] {
        let entries: Vec<GroupEntry> = (0..groups)
            .map(|i| GroupEntry {
                device: DeviceId::new(format!("bench.d{}", i % 8)),
                offset: 8 + i as u64 * 256,
                length: 256,
                min_timestamp: i as i64 * 1000,
                max_timestamp: i as i64 * 1000 + 999,
            })
            .collect();

        group.throughput(Throughput::Elements(groups as u64));

        group.bench_function(format!("rebuild_{}", groups), |b| {
            b.iter(|| TimeRangeIndex::rebuild_from(black_box(&entries)))
        });
    }

    group.bench_function("companion_round_trip_1000", |b| {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bench.ranges");
        let entries: Vec<GroupEntry> = (0..1000)
            .map(|i| GroupEntry {
                device: DeviceId::new(format!("bench.d{}", i)),
                offset: 8 + i as u64 * 256,
                length: 256,
                min_timestamp: i as i64 * 1000,
                max_timestamp: i as i64 * 1000 + 999,
            })
            .collect();
        let index = TimeRangeIndex::rebuild_from(&entries);

        b.iter(|| {
            index.save(black_box(&path)).unwrap();
            TimeRangeIndex::load(black_box(&path)).unwrap()
        });
    });

    group.finish();
}

fn bench_startup(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("startup");

    group.bench_function("recover_dir_32_clean_files", |b| {
        let dir = tempdir().unwrap();
        for i in 0..32 {
            let path = dir.path().join(format!("file_{:03}.tsd", i));
            write_sealed_file(&path, 20, true);
        }
        let config = EngineConfig::new(dir.path());

        b.iter_custom(|iters| {
            rt.block_on(async {
                let start = Instant::now();
                for _ in 0..iters {
                    let (resources, report) = recover_data_dir(&config).await.unwrap();
                    black_box((resources, report.total()));
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_scan, bench_recovery, bench_index, bench_startup);
criterion_main!(benches);
