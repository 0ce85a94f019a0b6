//! MVCC engine benchmarks
//!
//! - `mvcc_get/*`: point reads at the latest and at a historical version
//! - `mvcc_apply/*`: block application, synchronous and through the async
//!   pipeline
//! - `mvcc_iterate/*`: full namespace scan at a version
//!
//! ```bash
//! cargo bench --bench mvcc
//! cargo bench --bench mvcc -- "mvcc_get"
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use versiondb::{
    ChangeSet, FjallEngine, KvPair, MvccDb, MvccOptions, NamedChangeSet, StateStore,
    StateStoreConfig,
};

const KEYS: usize = 1_000;
const BLOCKS: i64 = 50;

fn key(i: usize) -> Vec<u8> {
    format!("key{:06}", i).into_bytes()
}

fn block(version: i64, keys: usize) -> Vec<NamedChangeSet> {
    let pairs = (0..keys)
        .map(|i| KvPair::set(key(i), version.to_le_bytes().to_vec()))
        .collect();
    vec![NamedChangeSet::new("bench", ChangeSet::new(pairs))]
}

fn bench_config() -> StateStoreConfig {
    StateStoreConfig::default()
        .with_backend("fjall")
        .with_keep_recent(0)
        .with_async_write_buffer(0)
}

fn populated() -> (TempDir, MvccDb<FjallEngine>) {
    let dir = TempDir::new().expect("tempdir");
    let db = MvccDb::open(dir.path(), MvccOptions::new(bench_config())).expect("open");
    for v in 1..=BLOCKS {
        db.apply_changeset_sync(v, &block(v, KEYS)).expect("apply");
    }
    (dir, db)
}

fn mvcc_get(c: &mut Criterion) {
    let (_dir, db) = populated();
    let mut group = c.benchmark_group("mvcc_get");
    group.throughput(Throughput::Elements(1));
    for (label, version) in [("latest", BLOCKS), ("historical", BLOCKS / 2)] {
        let mut i = 0usize;
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            b.iter(|| {
                i = (i + 7919) % KEYS;
                black_box(db.get("bench", version, &key(i)).expect("get"))
            })
        });
    }
    group.bench_function("miss", |b| {
        b.iter(|| black_box(db.get("bench", BLOCKS, b"absent").expect("get")))
    });
    group.finish();
    db.close().expect("close");
}

fn mvcc_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("mvcc_apply");
    for keys in [10usize, 100] {
        group.throughput(Throughput::Elements(keys as u64));
        for (label, depth) in [("sync", 0i64), ("async", 64)] {
            let dir = TempDir::new().expect("tempdir");
            let config = bench_config().with_async_write_buffer(depth);
            let db = MvccDb::open(dir.path(), MvccOptions::new(config)).expect("open");
            let mut version = 0i64;
            group.bench_with_input(BenchmarkId::new(label, keys), &keys, |b, &keys| {
                b.iter(|| {
                    version += 1;
                    if depth > 0 {
                        db.apply_changeset_async(version, block(version, keys))
                            .expect("apply")
                    } else {
                        db.apply_changeset_sync(version, &block(version, keys))
                            .expect("apply")
                    }
                })
            });
            db.wait_for_pending_writes().expect("drain");
            db.close().expect("close");
        }
    }
    group.finish();
}

fn mvcc_iterate(c: &mut Criterion) {
    let (_dir, db) = populated();
    let mut group = c.benchmark_group("mvcc_iterate");
    group.throughput(Throughput::Elements(KEYS as u64));
    group.bench_function("full_scan", |b| {
        b.iter(|| {
            let n = db
                .iterator("bench", BLOCKS, None, None)
                .expect("iterator")
                .count();
            black_box(n)
        })
    });
    group.finish();
    db.close().expect("close");
}

criterion_group!(benches, mvcc_get, mvcc_apply, mvcc_iterate);
criterion_main!(benches);
