//! MVCC engine scenarios
//!
//! End-to-end behaviour of the fjall-backed engine across reopen, changelog
//! recovery, pruning and the async pipeline, plus a model check of
//! versioned reads against an in-memory history.

use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;
use versiondb_core::{
    ChangeSet, ChangelogEntry, KvPair, NamedChangeSet, RecordingSupervisor, StateStore,
    StateStoreConfig,
};
use versiondb_durability::{Wal, WalConfig};
use versiondb_storage::mvcc::CHANGELOG_DIR;
use versiondb_storage::{MvccDb, MvccOptions};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn block(ns: &str, pairs: Vec<KvPair>) -> Vec<NamedChangeSet> {
    vec![NamedChangeSet::new(ns, ChangeSet::new(pairs))]
}

fn options(config: StateStoreConfig) -> MvccOptions {
    MvccOptions::new(config).with_supervisor(RecordingSupervisor::new())
}

// === Reopen ===

#[test]
fn scenario_versioned_reads_survive_reopen() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config = StateStoreConfig::for_testing().with_backend("fjall");
    {
        let db = MvccDb::open(dir.path(), options(config.clone())).unwrap();
        for v in 1..=5 {
            db.apply_changeset_sync(v, &block("bank", vec![KvPair::set("k1", format!("v{}", v))]))
                .unwrap();
        }
        db.apply_changeset_sync(6, &block("bank", vec![KvPair::delete("k1")]))
            .unwrap();
        db.close().unwrap();
    }

    let db = MvccDb::open(dir.path(), options(config)).unwrap();
    assert_eq!(db.latest_version(), 6);
    assert_eq!(db.get("bank", 3, b"k1").unwrap(), Some(b"v3".to_vec()));
    assert_eq!(db.get("bank", 5, b"k1").unwrap(), Some(b"v5".to_vec()));
    assert_eq!(db.get("bank", 6, b"k1").unwrap(), None);
    db.close().unwrap();
}

#[test]
fn scenario_prune_bounds_survive_reopen() {
    let dir = tempdir().unwrap();
    let config = StateStoreConfig::for_testing().with_backend("fjall");
    {
        let db = MvccDb::open(dir.path(), options(config.clone())).unwrap();
        for v in 1..=10 {
            db.apply_changeset_sync(v, &block("s", vec![KvPair::set("k", v.to_string())]))
                .unwrap();
        }
        db.prune(6).unwrap();
        db.close().unwrap();
    }
    let db = MvccDb::open(dir.path(), options(config)).unwrap();
    assert_eq!(db.earliest_version(), 7);
    assert_eq!(db.get("s", 6, b"k").unwrap(), None);
    assert_eq!(db.get("s", 7, b"k").unwrap(), Some(b"7".to_vec()));
    let keys: Vec<_> = db
        .iterator("s", 10, None, None)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(keys, vec![(b"k".to_vec(), b"10".to_vec())]);
    db.close().unwrap();
}

#[test]
fn scenario_background_pruner_trims_old_versions() {
    init_tracing();
    let dir = tempdir().unwrap();
    let mut config = StateStoreConfig::for_testing()
        .with_backend("fjall")
        .with_keep_recent(3);
    config.prune_interval_seconds = 1;
    {
        let db = MvccDb::open(dir.path(), options(config.clone())).unwrap();
        for v in 1..=10 {
            db.apply_changeset_sync(v, &block("s", vec![KvPair::set("k", v.to_string())]))
                .unwrap();
        }
        for _ in 0..200 {
            if db.earliest_version() == 8 {
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }
        assert_eq!(db.earliest_version(), 8);
        assert_eq!(db.get("s", 7, b"k").unwrap(), None);
        assert_eq!(db.get("s", 8, b"k").unwrap(), Some(b"8".to_vec()));
        db.close().unwrap();
    }
    let db = MvccDb::open(dir.path(), options(config.with_keep_recent(0))).unwrap();
    assert_eq!(db.earliest_version(), 8);
    assert_eq!(db.get("s", 10, b"k").unwrap(), Some(b"10".to_vec()));
    db.close().unwrap();
}

// === Changelog recovery ===

#[test]
fn scenario_logged_but_unapplied_changesets_are_replayed() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config = StateStoreConfig::for_testing().with_backend("fjall");
    {
        let db = MvccDb::open(dir.path(), options(config.clone())).unwrap();
        db.apply_changeset_sync(1, &block("s", vec![KvPair::set("a", "1")]))
            .unwrap();
        db.close().unwrap();
    }
    {
        // Entries that reached the changelog before a crash.
        let wal: Wal<ChangelogEntry> =
            Wal::open(dir.path().join(CHANGELOG_DIR), WalConfig::for_testing()).unwrap();
        for v in 2..=4 {
            wal.write(&ChangelogEntry::new(v, block("s", vec![KvPair::set("a", v.to_string())])))
                .unwrap();
        }
        wal.close().unwrap();
    }

    let db = MvccDb::open(dir.path(), options(config)).unwrap();
    assert_eq!(db.latest_version(), 4);
    assert_eq!(db.get("s", 1, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get("s", 3, b"a").unwrap(), Some(b"3".to_vec()));
    assert_eq!(db.get("s", 9, b"a").unwrap(), Some(b"4".to_vec()));
    db.close().unwrap();
}

#[test]
fn scenario_async_writes_are_durable_after_close() {
    let dir = tempdir().unwrap();
    let config = StateStoreConfig::for_testing()
        .with_backend("fjall")
        .with_async_write_buffer(8);
    {
        let db = MvccDb::open(dir.path(), options(config.clone())).unwrap();
        for v in 1..=30 {
            db.apply_changeset_async(v, block("s", vec![KvPair::set(format!("k{}", v % 4), v.to_string())]))
                .unwrap();
        }
        db.close().unwrap();
    }
    let db = MvccDb::open(dir.path(), options(config)).unwrap();
    assert_eq!(db.latest_version(), 30);
    assert_eq!(db.get("s", 30, b"k2").unwrap(), Some(b"30".to_vec()));
    assert_eq!(db.get("s", 29, b"k2").unwrap(), Some(b"26".to_vec()));
    db.close().unwrap();
}

// === Concurrency ===

#[test]
fn scenario_readers_see_committed_versions_during_async_writes() {
    let db = Arc::new(
        MvccDb::in_memory(options(
            StateStoreConfig::for_testing().with_async_write_buffer(4),
        ))
        .unwrap(),
    );
    db.apply_changeset_sync(1, &block("s", vec![KvPair::set("k", "1")]))
        .unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for _ in 0..200 {
                    let latest = db.latest_version();
                    let value = db.get("s", latest, b"k").unwrap().unwrap();
                    let seen: i64 = String::from_utf8(value).unwrap().parse().unwrap();
                    assert!(seen >= 1 && seen <= latest.max(1));
                }
            })
        })
        .collect();

    for v in 2..=100 {
        db.apply_changeset_async(v, block("s", vec![KvPair::set("k", v.to_string())]))
            .unwrap();
    }
    db.wait_for_pending_writes().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(db.get("s", 100, b"k").unwrap(), Some(b"100".to_vec()));
}

#[test]
fn scenario_concurrent_producers_keep_version_order() {
    const LAST: i64 = 200;
    let db = Arc::new(
        MvccDb::in_memory(options(
            StateStoreConfig::for_testing().with_async_write_buffer(4),
        ))
        .unwrap(),
    );
    // Producers take versions from a shared counter and submit while
    // holding it, so submissions are strictly increasing across threads.
    let next = Arc::new(Mutex::new(1i64));
    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let db = Arc::clone(&db);
            let next = Arc::clone(&next);
            thread::spawn(move || loop {
                let mut version = next.lock();
                if *version > LAST {
                    break;
                }
                let pairs = vec![
                    KvPair::set(format!("v{:03}", *version), producer.to_string()),
                    KvPair::set("latest", version.to_string()),
                ];
                db.apply_changeset_async(*version, block("s", pairs)).unwrap();
                *version += 1;
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }
    db.wait_for_pending_writes().unwrap();

    assert_eq!(db.latest_version(), LAST);
    for v in 1..=LAST {
        let key = format!("v{:03}", v);
        assert!(db.get("s", v, key.as_bytes()).unwrap().is_some(), "version {}", v);
        assert_eq!(db.get("s", v - 1, key.as_bytes()).unwrap(), None, "version {}", v);
        assert_eq!(
            db.get("s", v, b"latest").unwrap(),
            Some(v.to_string().into_bytes()),
            "version {}",
            v
        );
    }
    let written = db
        .iterator("s", LAST, Some(b"v"), Some(b"w"))
        .unwrap()
        .count();
    assert_eq!(written, LAST as usize);
}

// === Model check ===

#[derive(Debug, Clone)]
enum Op {
    Set(u8, u8),
    Delete(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6, any::<u8>()).prop_map(|(k, v)| Op::Set(k, v)),
        (0u8..6).prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reads_match_history(blocks in proptest::collection::vec(proptest::collection::vec(op(), 0..4), 1..12),
                           prune_at in 0i64..12) {
        let db = MvccDb::in_memory(options(StateStoreConfig::for_testing())).unwrap();
        // history[key] = [(version, value or None)]
        let mut history: BTreeMap<u8, Vec<(i64, Option<u8>)>> = BTreeMap::new();

        for (i, ops) in blocks.iter().enumerate() {
            let version = i as i64 + 1;
            let mut pairs = Vec::new();
            let mut last: BTreeMap<u8, Option<u8>> = BTreeMap::new();
            for op in ops {
                match *op {
                    Op::Set(k, v) => { last.insert(k, Some(v)); }
                    Op::Delete(k) => { last.insert(k, None); }
                }
            }
            for (k, v) in &last {
                pairs.push(match v {
                    Some(v) => KvPair::set(vec![*k], vec![*v]),
                    None => KvPair::delete(vec![*k]),
                });
                history.entry(*k).or_default().push((version, *v));
            }
            db.apply_changeset_sync(version, &block("m", pairs)).unwrap();
        }

        if prune_at > 0 {
            db.prune(prune_at).unwrap();
        }
        let earliest = db.earliest_version();
        let latest = blocks.len() as i64;

        for version in 0..=latest + 1 {
            let mut expected_live = Vec::new();
            for k in 0u8..6 {
                let expected = if version < earliest {
                    None
                } else {
                    history
                        .get(&k)
                        .and_then(|h| h.iter().rev().find(|(v, _)| *v <= version))
                        .and_then(|(_, value)| *value)
                };
                prop_assert_eq!(db.get("m", version, &[k]).unwrap(), expected.map(|v| vec![v]));
                if let Some(v) = expected {
                    expected_live.push((vec![k], vec![v]));
                }
            }
            let got: Vec<_> = db.iterator("m", version, None, None).unwrap().map(|r| r.unwrap()).collect();
            prop_assert_eq!(&got, &expected_live);
            let mut rev: Vec<_> = db.reverse_iterator("m", version, None, None).unwrap().map(|r| r.unwrap()).collect();
            rev.reverse();
            prop_assert_eq!(&rev, &expected_live);
        }
    }
}
