//! `KvEngine` over a fjall keyspace.

use super::{BatchOp, KvEngine, KvIter, WriteBatch};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use std::ops::Bound;
use std::path::Path;
use tracing::debug;
use versiondb_core::{Error, Result};

/// Partition holding every MVCC key and the metadata keys.
const STATE_PARTITION: &str = "state";

/// Block cache size handed to fjall.
const DEFAULT_CACHE_SIZE: u64 = 64 * 1024 * 1024;

fn engine_err(e: impl std::fmt::Display) -> Error {
    Error::Engine(e.to_string())
}

/// fjall-backed engine: one keyspace, one partition.
pub struct FjallEngine {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl FjallEngine {
    /// Open (or create) the keyspace in `path`.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let keyspace = Config::new(path)
            .cache_size(DEFAULT_CACHE_SIZE)
            .open()
            .map_err(engine_err)?;

        let partition = keyspace
            .open_partition(
                STATE_PARTITION,
                PartitionCreateOptions::default()
                    .block_size(16 * 1024)
                    .compression(fjall::CompressionType::Lz4),
            )
            .map_err(engine_err)?;

        debug!(path = %path.display(), "opened fjall keyspace");
        Ok(FjallEngine {
            keyspace,
            partition,
        })
    }
}

impl KvEngine for FjallEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .partition
            .get(key)
            .map_err(engine_err)?
            .map(|v| v.to_vec()))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut inner = self.keyspace.batch();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(k, v) => inner.insert(&self.partition, k, v),
                BatchOp::Delete(k) => inner.remove(&self.partition, k),
            }
        }
        inner.commit().map_err(engine_err)
    }

    fn range(&self, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>) -> KvIter<'_> {
        Box::new(
            self.partition
                .range((lower, upper))
                .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(engine_err)),
        )
    }

    fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(engine_err)
    }

    fn name(&self) -> &'static str {
        "fjall"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_batch_range_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let engine = FjallEngine::open(dir.path()).unwrap();
            let mut batch = WriteBatch::new();
            for i in 0u8..10 {
                batch.put(vec![b'k', i], vec![i]);
            }
            batch.delete(vec![b'k', 3]);
            engine.write(batch).unwrap();
            engine.flush().unwrap();

            assert_eq!(engine.get(&[b'k', 4]).unwrap(), Some(vec![4]));
            assert_eq!(engine.get(&[b'k', 3]).unwrap(), None);

            let keys: Vec<_> = engine
                .range(Bound::Included(vec![b'k', 2]), Bound::Excluded(vec![b'k', 6]))
                .map(|r| r.unwrap().0[1])
                .collect();
            assert_eq!(keys, vec![2, 4, 5]);

            let last = engine
                .range(Bound::Unbounded, Bound::Unbounded)
                .next_back()
                .unwrap()
                .unwrap();
            assert_eq!(last.0, vec![b'k', 9]);
        }
        let engine = FjallEngine::open(dir.path()).unwrap();
        assert_eq!(engine.get(&[b'k', 9]).unwrap(), Some(vec![9]));
    }
}
