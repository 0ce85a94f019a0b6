//! In-memory `KvEngine` over an ordered map.

use super::{BatchOp, KvEngine, KvIter, WriteBatch};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use versiondb_core::{Error, Result};

/// Volatile engine: a `BTreeMap` behind a read-write lock.
///
/// Range reads copy the matching pairs out under the read lock, so iterators
/// never hold the lock.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryEngine {
    /// Empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent batch fail with an engine error (or stop
    /// failing). Lets tests exercise write-failure paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored pairs.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KvEngine for MemoryEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Engine("memory engine: injected write failure".into()));
        }
        let mut map = self.map.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn range(&self, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>) -> KvIter<'_> {
        if let (Bound::Included(l) | Bound::Excluded(l), Bound::Included(u) | Bound::Excluded(u)) =
            (&lower, &upper)
        {
            // BTreeMap::range panics on inverted or doubly-excluded bounds.
            let both_included =
                matches!(lower, Bound::Included(_)) && matches!(upper, Bound::Included(_));
            if l > u || (l == u && !both_included) {
                return Box::new(std::iter::empty());
            }
        }
        let pairs: Vec<_> = self
            .map
            .read()
            .range((lower, upper))
            .map(|(k, v)| Ok((k.clone(), v.clone())))
            .collect();
        Box::new(pairs.into_iter())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_both_directions() {
        let engine = MemoryEngine::new();
        let mut batch = WriteBatch::new();
        for i in 0u8..5 {
            batch.put(vec![i], vec![i * 10]);
        }
        engine.write(batch).unwrap();

        let fwd: Vec<_> = engine
            .range(Bound::Included(vec![1]), Bound::Excluded(vec![4]))
            .map(|r| r.unwrap().0[0])
            .collect();
        assert_eq!(fwd, vec![1, 2, 3]);

        let rev: Vec<_> = engine
            .range(Bound::Unbounded, Bound::Included(vec![2]))
            .rev()
            .map(|r| r.unwrap().0[0])
            .collect();
        assert_eq!(rev, vec![2, 1, 0]);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let engine = MemoryEngine::new();
        assert_eq!(
            engine
                .range(Bound::Included(vec![9]), Bound::Excluded(vec![1]))
                .count(),
            0
        );
    }

    #[test]
    fn test_injected_write_failure() {
        let engine = MemoryEngine::new();
        engine.set_fail_writes(true);
        let mut batch = WriteBatch::new();
        batch.put(vec![1], vec![1]);
        assert!(matches!(engine.write(batch), Err(Error::Engine(_))));
        assert!(engine.is_empty());
    }
}
