//! Three-generation rotating receipt cache.
//!
//! Writes land in the current generation; lookups scan the current, the
//! previous and the oldest generation in that order. `rotate()` advances the
//! write slot onto the oldest generation and clears it, so a receipt stays
//! cached for two to three rotation intervals.

use crate::store::{ReceiptContext, ReceiptStore};
use crate::types::{log_order, FilterCriteria, Hash, Log, Receipt, ReceiptRecord};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use versiondb_core::{Result, Version};

/// Number of cache generations.
pub const CACHE_GENERATIONS: usize = 3;

#[derive(Default)]
struct Generation {
    receipts: FxHashMap<(u64, Hash), Receipt>,
    blocks_by_tx: FxHashMap<Hash, u64>,
}

impl Generation {
    fn get(&self, tx_hash: &Hash) -> Option<&Receipt> {
        let block = self.blocks_by_tx.get(tx_hash)?;
        self.receipts.get(&(*block, *tx_hash))
    }

    fn clear(&mut self) {
        self.receipts.clear();
        self.blocks_by_tx.clear();
    }
}

/// Fixed ring of three generations.
pub struct ReceiptCache {
    generations: [RwLock<Generation>; CACHE_GENERATIONS],
    write_index: AtomicUsize,
}

impl Default for ReceiptCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiptCache {
    /// Empty cache.
    pub fn new() -> Self {
        ReceiptCache {
            generations: Default::default(),
            write_index: AtomicUsize::new(0),
        }
    }

    fn newest_first(&self) -> impl Iterator<Item = usize> {
        let current = self.write_index.load(Ordering::Acquire);
        (0..CACHE_GENERATIONS).map(move |age| (current + CACHE_GENERATIONS - age) % CACHE_GENERATIONS)
    }

    /// Cache one receipt in the current generation.
    pub fn insert(&self, record: &ReceiptRecord) {
        let slot = self.write_index.load(Ordering::Acquire);
        let block = record.block_number();
        let mut generation = self.generations[slot].write();
        generation
            .receipts
            .insert((block, record.tx_hash), record.receipt.clone());
        generation.blocks_by_tx.insert(record.tx_hash, block);
    }

    /// Newest cached receipt for `tx_hash`.
    pub fn get(&self, tx_hash: &Hash) -> Option<Receipt> {
        self.newest_first()
            .find_map(|slot| self.generations[slot].read().get(tx_hash).cloned())
    }

    /// Advance the write slot, dropping the oldest generation.
    pub fn rotate(&self) {
        let next = (self.write_index.load(Ordering::Acquire) + 1) % CACHE_GENERATIONS;
        self.generations[next].write().clear();
        self.write_index.store(next, Ordering::Release);
    }

    /// Number of cached receipts across generations.
    pub fn len(&self) -> usize {
        self.generations.iter().map(|g| g.read().receipts.len()).sum()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logs of cached receipts in blocks `from..=to` matching `criteria`.
    pub fn filter_logs(
        &self,
        from: u64,
        to: u64,
        tx_hashes: &[Hash],
        criteria: &FilterCriteria,
        out: &mut Vec<Log>,
    ) {
        for slot in self.newest_first() {
            let generation = self.generations[slot].read();
            for ((block, tx_hash), receipt) in &generation.receipts {
                if *block < from || *block > to {
                    continue;
                }
                if !tx_hashes.is_empty() && !tx_hashes.contains(tx_hash) {
                    continue;
                }
                out.extend(
                    receipt
                        .to_logs()
                        .filter(|log| criteria.matches(&log.address, &log.topics)),
                );
            }
        }
    }
}

/// A [`ReceiptStore`] fronted by a [`ReceiptCache`].
pub struct CachedReceiptStore {
    backend: Arc<dyn ReceiptStore>,
    cache: ReceiptCache,
    rotate_interval: u64,
    last_rotation: AtomicU64,
}

impl CachedReceiptStore {
    /// Wrap `backend`, warming the cache with its recovered receipts.
    pub fn new(backend: Arc<dyn ReceiptStore>) -> Self {
        let cache = ReceiptCache::new();
        let warmup = backend.take_warmup_records();
        for record in &warmup {
            cache.insert(record);
        }
        if !warmup.is_empty() {
            debug!(receipts = warmup.len(), "warmed receipt cache");
        }
        CachedReceiptStore {
            rotate_interval: backend.cache_rotate_interval().max(1),
            last_rotation: AtomicU64::new(backend.latest_version().max(0) as u64),
            backend,
            cache,
        }
    }

    /// The wrapped store.
    pub fn backend(&self) -> &Arc<dyn ReceiptStore> {
        &self.backend
    }

    /// The cache.
    pub fn cache(&self) -> &ReceiptCache {
        &self.cache
    }

    fn maybe_rotate(&self, height: u64) {
        let last = self.last_rotation.load(Ordering::Acquire);
        if height >= last + self.rotate_interval
            && self
                .last_rotation
                .compare_exchange(last, height, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.cache.rotate();
            debug!(height, "rotated receipt cache");
        }
    }
}

impl ReceiptStore for CachedReceiptStore {
    fn latest_version(&self) -> Version {
        self.backend.latest_version()
    }

    fn set_latest_version(&self, version: Version) -> Result<()> {
        self.backend.set_latest_version(version)
    }

    fn set_earliest_version(&self, version: Version) -> Result<()> {
        self.backend.set_earliest_version(version)
    }

    fn get_receipt_from_store(&self, tx_hash: &Hash) -> Result<Option<Receipt>> {
        if let Some(receipt) = self.cache.get(tx_hash) {
            return Ok(Some(receipt));
        }
        self.backend.get_receipt_from_store(tx_hash)
    }

    fn set_receipts(&self, ctx: &dyn ReceiptContext, records: Vec<ReceiptRecord>) -> Result<()> {
        let height = ctx.block_height();
        self.maybe_rotate(height);
        // Only cache what the backend accepted.
        self.backend.set_receipts(ctx, records.clone())?;
        for record in &records {
            self.cache.insert(record);
        }
        Ok(())
    }

    fn filter_logs(
        &self,
        ctx: &dyn ReceiptContext,
        from: u64,
        to: u64,
        tx_hashes: &[Hash],
        criteria: &FilterCriteria,
    ) -> Result<Vec<Log>> {
        let mut logs = self
            .backend
            .filter_logs(ctx, from, to, tx_hashes, criteria)?;
        if tx_hashes.is_empty() && self.backend.filters_by_tx_hash() {
            return Ok(logs);
        }
        self.cache
            .filter_logs(from, to, tx_hashes, criteria, &mut logs);
        logs.sort_by_key(|l| (log_order(l), l.tx_hash));
        logs.dedup_by_key(|l| (log_order(l), l.tx_hash));
        Ok(logs)
    }

    fn filters_by_tx_hash(&self) -> bool {
        self.backend.filters_by_tx_hash()
    }

    fn cache_rotate_interval(&self) -> u64 {
        self.rotate_interval
    }

    fn close(&self) -> Result<()> {
        self.backend.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(block: u64, tx: u8) -> ReceiptRecord {
        ReceiptRecord::new(Receipt {
            tx_hash: [tx; 32],
            block_number: block,
            ..Receipt::default()
        })
    }

    #[test]
    fn test_generation_lifetime() {
        let cache = ReceiptCache::new();
        cache.insert(&record(1, 1));
        cache.rotate();
        cache.insert(&record(2, 2));
        cache.rotate();
        assert!(cache.get(&[1u8; 32]).is_some());
        assert!(cache.get(&[2u8; 32]).is_some());

        // Third rotation reuses the slot of the first generation.
        cache.rotate();
        assert!(cache.get(&[1u8; 32]).is_none());
        assert!(cache.get(&[2u8; 32]).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_newest_generation_wins() {
        let cache = ReceiptCache::new();
        cache.insert(&record(1, 7));
        cache.rotate();
        cache.insert(&record(5, 7));
        assert_eq!(cache.get(&[7u8; 32]).map(|r| r.block_number), Some(5));
    }
}
