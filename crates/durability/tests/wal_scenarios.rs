//! WAL scenarios
//!
//! Behaviour of `Wal<E>` that spans threads or reopen: corrupted-tail
//! repair, sticky async failures, close racing with writers, and replay
//! convergence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use versiondb_core::Error;
use versiondb_durability::{recover_from_wal, Wal, WalConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    version: i64,
    key: String,
    body: Vec<u8>,
}

fn entry(version: i64) -> Entry {
    Entry {
        version,
        key: format!("k{}", version % 3),
        body: vec![version as u8; 16],
    }
}

// === Corrupted tail ===

#[test]
fn scenario_torn_tail_is_repaired_on_open() {
    let dir = tempdir().unwrap();
    {
        let wal: Wal<Entry> = Wal::open(dir.path(), WalConfig::for_testing()).unwrap();
        for v in 1..=5 {
            wal.write(&entry(v)).unwrap();
        }
        wal.close().unwrap();
    }

    let mut segments: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "seg"))
        .collect();
    segments.sort();
    let tail = segments.last().unwrap();
    let mut f = OpenOptions::new().append(true).open(tail).unwrap();
    f.write_all(&[0x40, 0x00, 0x00, 0x00, 0x01, 0xAA, 0xBB]).unwrap();
    drop(f);

    let wal: Wal<Entry> = Wal::open(dir.path(), WalConfig::for_testing()).unwrap();
    assert_eq!(wal.last_offset(), 5);
    assert_eq!(wal.read_at(5).unwrap(), entry(5));
    wal.write(&entry(6)).unwrap();
    assert_eq!(wal.last_offset(), 6);
    assert_eq!(wal.read_at(6).unwrap(), entry(6));
    wal.close().unwrap();
}

// === Async writer ===

#[test]
fn scenario_async_write_failure_is_sticky() {
    let dir = tempdir().unwrap();
    let wal_dir = dir.path().join("wal");
    let config = WalConfig::for_testing()
        .with_segment_size(1024)
        .with_write_buffer_size(4)
        .with_write_batch_size(1);
    let wal: Wal<Entry> = Wal::open(&wal_dir, config).unwrap();

    // The next segment rotation cannot create its file.
    fs::remove_dir_all(&wal_dir).unwrap();

    let big = |v: i64| Entry {
        version: v,
        key: "big".into(),
        body: vec![0u8; 700],
    };
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut v = 0;
    while wal.check_error().is_ok() {
        assert!(Instant::now() < deadline, "writer never failed");
        v += 1;
        if wal.write(&big(v)).is_err() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    for _ in 0..3 {
        assert!(matches!(wal.write(&big(v + 1)), Err(Error::WalWrite(_))));
    }
    assert!(matches!(wal.check_error(), Err(Error::WalWrite(_))));
    assert!(matches!(wal.close(), Err(Error::WalWrite(_))));
}

#[test]
fn scenario_close_races_with_async_writers() {
    let dir = tempdir().unwrap();
    let config = WalConfig::for_testing()
        .with_write_buffer_size(16)
        .with_write_batch_size(4);
    let wal: Arc<Wal<Entry>> = Arc::new(Wal::open(dir.path(), config).unwrap());

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let wal = Arc::clone(&wal);
            thread::spawn(move || {
                let mut accepted = 0u64;
                for i in 0..200 {
                    match wal.write(&entry(t * 1000 + i)) {
                        Ok(()) => accepted += 1,
                        Err(Error::Closed(_)) => break,
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
                accepted
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(5));
    wal.close().unwrap();
    let accepted: u64 = writers.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(matches!(wal.write(&entry(0)), Err(Error::Closed(_))));
    drop(wal);

    // Every accepted write was drained before the log closed.
    let wal: Wal<Entry> = Wal::open(dir.path(), WalConfig::for_testing()).unwrap();
    let stored = if wal.last_offset() == 0 {
        0
    } else {
        wal.last_offset() - wal.first_offset() + 1
    };
    assert_eq!(stored, accepted);
    wal.close().unwrap();
}

// === Replay ===

#[test]
fn scenario_replaying_twice_converges() {
    let dir = tempdir().unwrap();
    let wal: Wal<Entry> = Wal::open(dir.path(), WalConfig::for_testing()).unwrap();
    for v in 1..=9 {
        wal.write(&entry(v)).unwrap();
    }

    let apply = |state: &mut BTreeMap<String, (i64, Vec<u8>)>, e: Entry| -> versiondb_core::Result<()> {
        state.insert(e.key, (e.version, e.body));
        Ok(())
    };

    // Store persisted up to version 4 before the crash.
    let mut state = BTreeMap::new();
    for v in 1..=4 {
        let e = entry(v);
        state.insert(e.key, (e.version, e.body));
    }
    let stats = recover_from_wal(&wal, 4, |e| e.version, |e| apply(&mut state, e)).unwrap();
    assert_eq!(stats.replayed, 5);
    assert_eq!(stats.last_version, 9);
    let once = state.clone();

    // A second pass from an older watermark lands on the same state.
    let stats = recover_from_wal(&wal, 2, |e| e.version, |e| apply(&mut state, e)).unwrap();
    assert_eq!(stats.replayed, 7);
    assert_eq!(state, once);

    let stats = recover_from_wal(&wal, 9, |e| e.version, |e| apply(&mut state, e)).unwrap();
    assert_eq!(stats.replayed, 0);
    wal.close().unwrap();
}

#[test]
fn scenario_replay_range_after_front_truncation() {
    let dir = tempdir().unwrap();
    let wal: Wal<Entry> = Wal::open(dir.path(), WalConfig::for_testing()).unwrap();
    for v in 1..=40 {
        wal.write(&entry(v)).unwrap();
    }
    wal.truncate_before(31).unwrap();
    assert_eq!(wal.first_offset(), 31);

    let mut seen = Vec::new();
    wal.replay(1, 100, |offset, e| {
        assert_eq!(offset as i64, e.version);
        seen.push(e.version);
        Ok(())
    })
    .unwrap();
    assert_eq!(seen, (31..=40).collect::<Vec<_>>());
    wal.close().unwrap();
}
