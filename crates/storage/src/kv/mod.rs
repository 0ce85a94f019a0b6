//! Ordered byte-key storage underneath the MVCC engine.
//!
//! The MVCC layer needs four things from an LSM: point reads, atomic batches,
//! bounded iteration in both directions, and a durable flush. [`KvEngine`]
//! is exactly that surface. [`FjallEngine`] backs production stores;
//! [`MemoryEngine`] backs tests and throwaway secondaries.

pub mod fjall_engine;
pub mod memory;

pub use fjall_engine::FjallEngine;
pub use memory::MemoryEngine;

use std::ops::Bound;
use versiondb_core::Result;

/// Iterator over raw `(key, value)` pairs in key order.
pub type KvIter<'a> = Box<dyn DoubleEndedIterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>;

/// One mutation in a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite
    Put(Vec<u8>, Vec<u8>),
    /// Remove
    Delete(Vec<u8>),
}

/// Mutations applied atomically by [`KvEngine::write`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an insert.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    /// Queue a removal.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    /// Number of queued mutations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume the batch.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Ordered key-value store with atomic batches.
///
/// Keys compare bytewise. Implementations must allow one writer and many
/// concurrent readers.
pub trait KvEngine: Send + Sync + 'static {
    /// Point read.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply every mutation of `batch` atomically.
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Pairs with keys inside `(lower, upper)`, ascending; reverse with
    /// `.rev()`.
    fn range(&self, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>) -> KvIter<'_>;

    /// Make every applied batch durable.
    fn flush(&self) -> Result<()>;

    /// Backend name, as registered.
    fn name(&self) -> &'static str;
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when no such key exists (prefix is all `0xFF`).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Upper bound covering every key that starts with `prefix`.
pub fn prefix_upper_bound(prefix: &[u8]) -> Bound<Vec<u8>> {
    match prefix_end(prefix) {
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    }
}
