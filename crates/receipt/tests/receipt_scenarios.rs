//! Receipt store scenarios through the factory and the cache.

use smallvec::smallvec;
use std::sync::Arc;
use tempfile::tempdir;
use versiondb_core::{Error, ReceiptBackend, ReceiptStoreConfig, RecordingSupervisor};
use versiondb_receipt::{
    open_receipt_store, BlockContext, CachedReceiptStore, ColumnarReceiptStore, FailOnce,
    FaultPoint, FilterCriteria, Hash, Receipt, ReceiptLog, ReceiptRecord, ReceiptStore,
};

fn tx_hash(block: u64, i: u8) -> Hash {
    let mut h = [0u8; 32];
    h[..8].copy_from_slice(&block.to_be_bytes());
    h[8] = i;
    h
}

fn receipt(block: u64, i: u8) -> Receipt {
    Receipt {
        tx_hash: tx_hash(block, i),
        block_number: block,
        tx_index: i as u32,
        logs: vec![ReceiptLog {
            address: [i; 20],
            topics: smallvec![[0xAB; 32], [block as u8; 32]],
            data: vec![],
            index: i as u32,
        }],
        ..Receipt::default()
    }
}

fn write_blocks(store: &dyn ReceiptStore, blocks: std::ops::RangeInclusive<u64>) {
    for block in blocks {
        let records = (0..2).map(|i| ReceiptRecord::new(receipt(block, i))).collect();
        store
            .set_receipts(&BlockContext::new(block), records)
            .unwrap();
    }
}

fn config(backend: ReceiptBackend) -> ReceiptStoreConfig {
    ReceiptStoreConfig::default()
        .with_backend(backend)
        .with_keep_recent(0)
        .with_max_blocks_per_file(4)
        .with_cache_rotate_interval(4)
}

// === Both backends ===

fn close_and_reopen(backend: ReceiptBackend) {
    let dir = tempdir().unwrap();
    {
        let store =
            open_receipt_store(dir.path(), &config(backend), RecordingSupervisor::new()).unwrap();
        write_blocks(store.as_ref(), 1..=9);
        assert_eq!(
            store.get_receipt_from_store(&tx_hash(9, 1)).unwrap(),
            Some(receipt(9, 1))
        );
        store.close().unwrap();
    }

    let store =
        open_receipt_store(dir.path(), &config(backend), RecordingSupervisor::new()).unwrap();
    assert_eq!(store.latest_version(), 9);
    for block in 1..=9 {
        assert_eq!(
            store.get_receipt_from_store(&tx_hash(block, 0)).unwrap(),
            Some(receipt(block, 0)),
            "{:?} block {}",
            backend,
            block
        );
    }

    let ctx = BlockContext::new(9);
    let hashes: Vec<Hash> = (1..=9).flat_map(|b| [tx_hash(b, 0), tx_hash(b, 1)]).collect();
    let criteria = FilterCriteria {
        addresses: vec![[1u8; 20]],
        topics: vec![vec![[0xAB; 32]], vec![[3u8; 32], [5u8; 32]]],
    };
    let logs = store.filter_logs(&ctx, 2, 8, &hashes, &criteria).unwrap();
    let got: Vec<_> = logs.iter().map(|l| (l.block_number, l.tx_index)).collect();
    assert_eq!(got, vec![(3, 1), (5, 1)]);
    store.close().unwrap();
}

#[test]
fn scenario_mvcc_backend_survives_reopen() {
    close_and_reopen(ReceiptBackend::Mvcc);
}

#[test]
fn scenario_columnar_backend_survives_reopen() {
    close_and_reopen(ReceiptBackend::Columnar);
}

#[test]
fn scenario_legacy_fallback_only_on_miss() {
    let dir = tempdir().unwrap();
    let store = open_receipt_store(
        dir.path(),
        &config(ReceiptBackend::Columnar),
        RecordingSupervisor::new(),
    )
    .unwrap();
    write_blocks(store.as_ref(), 1..=1);

    let mut legacy = receipt(1, 0);
    legacy.status = 7;
    let ctx = BlockContext::new(1)
        .with_legacy_receipt(legacy)
        .with_legacy_receipt(receipt(0, 9));

    assert_eq!(store.get_receipt(&ctx, &tx_hash(1, 0)).unwrap(), Some(receipt(1, 0)));
    assert_eq!(store.get_receipt(&ctx, &tx_hash(0, 9)).unwrap(), Some(receipt(0, 9)));
    assert_eq!(store.get_receipt_from_store(&tx_hash(0, 9)).unwrap(), None);
    store.close().unwrap();
}

// === Cache ===

#[test]
fn scenario_cache_warms_from_replayed_blocks() {
    let dir = tempdir().unwrap();
    let config = config(ReceiptBackend::Columnar);
    {
        let store = ColumnarReceiptStore::open(dir.path(), &config).unwrap();
        write_blocks(&store, 1..=6);
        store.simulate_crash();
    }
    let backend = Arc::new(ColumnarReceiptStore::open(dir.path(), &config).unwrap());
    let cached = CachedReceiptStore::new(backend);
    // Blocks 5 and 6 were only in the WAL.
    assert_eq!(cached.cache().len(), 4);
    assert_eq!(cached.cache().get(&tx_hash(6, 1)), Some(receipt(6, 1)));
    assert_eq!(cached.cache_rotate_interval(), 4);
    cached.close().unwrap();
}

#[test]
fn scenario_cache_rotates_on_block_interval() {
    let dir = tempdir().unwrap();
    let backend =
        Arc::new(ColumnarReceiptStore::open(dir.path(), &config(ReceiptBackend::Columnar)).unwrap());
    let cached = CachedReceiptStore::new(backend);

    write_blocks(&cached, 1..=3);
    assert_eq!(cached.cache().len(), 6);
    // Rotations at blocks 4 and 8; block 1-3 receipts fall out at block 12.
    write_blocks(&cached, 4..=11);
    assert!(cached.cache().get(&tx_hash(1, 0)).is_some());
    write_blocks(&cached, 12..=12);
    assert!(cached.cache().get(&tx_hash(1, 0)).is_none());
    assert!(cached.cache().get(&tx_hash(12, 0)).is_some());

    // Evicted receipts are still served by the backend.
    assert_eq!(
        cached.get_receipt_from_store(&tx_hash(1, 0)).unwrap(),
        Some(receipt(1, 0))
    );
    let logs = cached
        .filter_logs(&BlockContext::new(12), 1, 12, &[], &FilterCriteria::default())
        .unwrap();
    assert_eq!(logs.len(), 24);
    cached.close().unwrap();
}

#[test]
fn scenario_filter_logs_same_answer_before_and_after_reopen() {
    let dir = tempdir().unwrap();
    let config = config(ReceiptBackend::Mvcc);
    let ctx = BlockContext::new(3);
    let hashes = [tx_hash(2, 0), tx_hash(3, 1)];
    let criteria = FilterCriteria::default();

    let (none_before, some_before) = {
        let store = open_receipt_store(dir.path(), &config, RecordingSupervisor::new()).unwrap();
        assert!(store.filters_by_tx_hash());
        write_blocks(store.as_ref(), 1..=3);
        let none = store.filter_logs(&ctx, 1, 3, &[], &criteria).unwrap();
        let some = store.filter_logs(&ctx, 1, 3, &hashes, &criteria).unwrap();
        store.close().unwrap();
        (none, some)
    };

    let store = open_receipt_store(dir.path(), &config, RecordingSupervisor::new()).unwrap();
    // An empty candidate list matches nothing, cached or not.
    assert!(none_before.is_empty());
    assert_eq!(store.filter_logs(&ctx, 1, 3, &[], &criteria).unwrap(), none_before);
    let some_after = store.filter_logs(&ctx, 1, 3, &hashes, &criteria).unwrap();
    assert_eq!(some_after, some_before);
    let got: Vec<_> = some_after.iter().map(|l| (l.block_number, l.tx_index)).collect();
    assert_eq!(got, vec![(2, 0), (3, 1)]);
    store.close().unwrap();
}

#[test]
fn scenario_failed_write_is_not_cached() {
    let dir = tempdir().unwrap();
    let hook = Arc::new(FailOnce::from_block(FaultPoint::AfterCloseWriters, 5));
    let backend = Arc::new(
        ColumnarReceiptStore::open_with_hooks(
            dir.path(),
            &config(ReceiptBackend::Columnar),
            hook.clone(),
        )
        .unwrap(),
    );
    let cached = CachedReceiptStore::new(backend);
    write_blocks(&cached, 1..=4);

    let records = (0..2).map(|i| ReceiptRecord::new(receipt(5, i))).collect();
    let err = cached
        .set_receipts(&BlockContext::new(5), records)
        .unwrap_err();
    assert!(matches!(err, Error::FaultInjected("after_close_writers")));
    assert_eq!(hook.fired_at(), Some(5));

    assert!(cached.cache().get(&tx_hash(5, 0)).is_none());
    assert_eq!(cached.get_receipt_from_store(&tx_hash(5, 0)).unwrap(), None);
    assert_eq!(cached.cache().get(&tx_hash(4, 1)), Some(receipt(4, 1)));
    assert_eq!(cached.cache().len(), 8);
}
