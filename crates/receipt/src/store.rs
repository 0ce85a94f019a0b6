//! The `ReceiptStore` contract and the store factory.

use crate::cache::CachedReceiptStore;
use crate::columnar::ColumnarReceiptStore;
use crate::mvcc_store::MvccReceiptStore;
use crate::types::{FilterCriteria, Hash, Log, Receipt, ReceiptRecord};
use rustc_hash::FxHashMap;
use std::path::Path;
use std::sync::Arc;
use versiondb_core::{ReceiptBackend, ReceiptStoreConfig, Result, Supervisor, Version};

/// Block context handed to receipt operations by the execution layer.
pub trait ReceiptContext {
    /// Height of the block being processed or queried.
    fn block_height(&self) -> u64;

    /// Receipt from the pre-migration source, consulted on store misses.
    fn legacy_receipt(&self, _tx_hash: &Hash) -> Result<Option<Receipt>> {
        Ok(None)
    }
}

/// Plain [`ReceiptContext`] with an optional in-memory legacy source.
#[derive(Debug, Clone, Default)]
pub struct BlockContext {
    height: u64,
    legacy: FxHashMap<Hash, Receipt>,
}

impl BlockContext {
    /// Context at `height` with no legacy receipts.
    pub fn new(height: u64) -> Self {
        BlockContext {
            height,
            legacy: FxHashMap::default(),
        }
    }

    /// Add a receipt to the legacy source.
    pub fn with_legacy_receipt(mut self, receipt: Receipt) -> Self {
        self.legacy.insert(receipt.tx_hash, receipt);
        self
    }
}

impl ReceiptContext for BlockContext {
    fn block_height(&self) -> u64 {
        self.height
    }

    fn legacy_receipt(&self, tx_hash: &Hash) -> Result<Option<Receipt>> {
        Ok(self.legacy.get(tx_hash).cloned())
    }
}

/// Durable store of transaction receipts.
///
/// Receipts are immutable once written. Lookups that find nothing return
/// `Ok(None)`.
pub trait ReceiptStore: Send + Sync {
    /// Highest block whose receipts were accepted.
    fn latest_version(&self) -> Version;

    /// Overwrite the latest block marker.
    fn set_latest_version(&self, version: Version) -> Result<()>;

    /// Overwrite the earliest retained block marker.
    fn set_earliest_version(&self, version: Version) -> Result<()>;

    /// Receipt for `tx_hash`, falling back to the context's legacy source.
    fn get_receipt(&self, ctx: &dyn ReceiptContext, tx_hash: &Hash) -> Result<Option<Receipt>> {
        match self.get_receipt_from_store(tx_hash)? {
            Some(receipt) => Ok(Some(receipt)),
            None => ctx.legacy_receipt(tx_hash),
        }
    }

    /// Receipt for `tx_hash` from this store only.
    fn get_receipt_from_store(&self, tx_hash: &Hash) -> Result<Option<Receipt>>;

    /// Store the receipts of one or more blocks.
    ///
    /// An empty batch advances the latest block to the context height.
    fn set_receipts(&self, ctx: &dyn ReceiptContext, records: Vec<ReceiptRecord>) -> Result<()>;

    /// Logs in blocks `from..=to` matching `criteria`, ordered by
    /// `(block_number, tx_index, log_index)`.
    ///
    /// `tx_hashes` names the candidate transactions; backends that index by
    /// block treat an empty list as "every transaction in range".
    fn filter_logs(
        &self,
        ctx: &dyn ReceiptContext,
        from: u64,
        to: u64,
        tx_hashes: &[Hash],
        criteria: &FilterCriteria,
    ) -> Result<Vec<Log>>;

    /// Whether `filter_logs` only considers the listed `tx_hashes`, so an
    /// empty list matches nothing.
    fn filters_by_tx_hash(&self) -> bool {
        false
    }

    /// Blocks per cache generation when wrapped by the rotating cache.
    fn cache_rotate_interval(&self) -> u64;

    /// Receipts recovered on open that should warm a cache. Drained once.
    fn take_warmup_records(&self) -> Vec<ReceiptRecord> {
        Vec::new()
    }

    /// Flush and release resources. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Open the configured backend in `dir`, wrapped by the rotating cache.
pub fn open_receipt_store(
    dir: impl AsRef<Path>,
    config: &ReceiptStoreConfig,
    supervisor: Arc<dyn Supervisor>,
) -> Result<Arc<dyn ReceiptStore>> {
    config.validate()?;
    let backend: Arc<dyn ReceiptStore> = match config.backend {
        ReceiptBackend::Mvcc => Arc::new(MvccReceiptStore::open(dir.as_ref(), config, supervisor)?),
        ReceiptBackend::Columnar => Arc::new(ColumnarReceiptStore::open(dir.as_ref(), config)?),
    };
    Ok(Arc::new(CachedReceiptStore::new(backend)))
}
