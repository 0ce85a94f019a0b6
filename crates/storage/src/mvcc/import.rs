//! Parallel snapshot import.

use super::db::Inner;
use super::IMPORT_COMMIT_BATCH_SIZE;
use crate::encoding::{encode_key, encode_value};
use crate::kv::{KvEngine, WriteBatch};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use versiondb_core::{Error, Result, SnapshotNode, SnapshotStream, Version};

/// Drain `nodes` with `num_workers` threads, writing every node at `version`.
/// Returns the number of imported nodes.
pub(crate) fn import_nodes<K: KvEngine>(
    inner: &Inner<K>,
    version: Version,
    nodes: SnapshotStream<'_>,
    num_workers: usize,
) -> Result<u64> {
    let source = Mutex::new(nodes);
    let abort = AtomicBool::new(false);
    let (source, abort) = (&source, &abort);

    thread::scope(|scope| {
        let workers: Vec<_> = (0..num_workers.max(1))
            .map(|_| scope.spawn(move || import_worker(inner, version, source, abort)))
            .collect();

        let mut imported = 0;
        let mut first_error = None;
        for worker in workers {
            match worker.join() {
                Ok(Ok(n)) => imported += n,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(Error::Engine("import worker panicked".into()));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(imported),
        }
    })
}

fn import_worker<K: KvEngine>(
    inner: &Inner<K>,
    version: Version,
    source: &Mutex<SnapshotStream<'_>>,
    abort: &AtomicBool,
) -> Result<u64> {
    let result = drain(inner, version, source, abort);
    match &result {
        Ok(n) => inner.metrics.record_import(*n),
        Err(_) => abort.store(true, Ordering::Relaxed),
    }
    result
}

fn drain<K: KvEngine>(
    inner: &Inner<K>,
    version: Version,
    source: &Mutex<SnapshotStream<'_>>,
    abort: &AtomicBool,
) -> Result<u64> {
    let mut batch = WriteBatch::new();
    let mut imported = 0u64;

    while !abort.load(Ordering::Relaxed) {
        let node: Option<SnapshotNode> = source.lock().next();
        let Some(node) = node else { break };

        inner.mark_dirty(&node.store_key, version);
        batch.put(
            encode_key(&node.store_key, &node.key, version),
            encode_value(&node.value, None),
        );
        if batch.len() >= IMPORT_COMMIT_BATCH_SIZE {
            imported += batch.len() as u64;
            inner.kv.write(std::mem::take(&mut batch))?;
        }
    }
    if !batch.is_empty() {
        imported += batch.len() as u64;
        inner.kv.write(batch)?;
    }
    Ok(imported)
}
