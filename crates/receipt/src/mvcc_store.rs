//! Receipts as versioned pairs in an MVCC engine.
//!
//! Each receipt is one pair in namespace [`RECEIPT_NAMESPACE`], keyed by
//! transaction hash and written at the block height. The stored value is
//! `bloom(256) ‖ msgpack(receipt)` so log queries can reject a receipt from
//! its bloom without decoding it.

use crate::bloom::{Bloom, BLOOM_BYTES};
use crate::store::{ReceiptContext, ReceiptStore};
use crate::types::{log_order, FilterCriteria, Hash, Log, Receipt, ReceiptRecord};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use versiondb_core::{
    ChangeSet, Error, KvPair, NamedChangeSet, ReceiptStoreConfig, Result, StateStore,
    StateStoreConfig, Supervisor, Version,
};
use versiondb_storage::{MvccDb, MvccOptions, PruningManager};

/// Namespace holding receipts.
pub const RECEIPT_NAMESPACE: &str = "receipt";

/// Encode a receipt as `bloom ‖ msgpack(receipt)`.
pub fn encode_receipt_value(receipt: &Receipt) -> Result<Vec<u8>> {
    let bloom = Bloom::from_logs(&receipt.logs);
    let body = rmp_serde::to_vec(receipt).map_err(|e| Error::Serialization(e.to_string()))?;
    let mut value = Vec::with_capacity(BLOOM_BYTES + body.len());
    value.extend_from_slice(bloom.as_bytes());
    value.extend_from_slice(&body);
    Ok(value)
}

fn split_value(value: &[u8]) -> Result<(Bloom, &[u8])> {
    if value.len() < BLOOM_BYTES {
        return Err(Error::Corruption(format!(
            "receipt value of {} bytes is shorter than its bloom",
            value.len()
        )));
    }
    let (bloom, body) = value.split_at(BLOOM_BYTES);
    let bloom = Bloom::from_slice(bloom)
        .ok_or_else(|| Error::Corruption("receipt bloom has wrong length".into()))?;
    Ok((bloom, body))
}

fn decode_body(body: &[u8]) -> Result<Receipt> {
    rmp_serde::from_slice(body).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a stored receipt value.
pub fn decode_receipt_value(value: &[u8]) -> Result<Receipt> {
    let (_, body) = split_value(value)?;
    decode_body(body)
}

/// Receipt store backed by a [`StateStore`].
pub struct MvccReceiptStore {
    db: Arc<dyn StateStore>,
    pruner: Mutex<Option<PruningManager>>,
    cache_rotate_interval: u64,
}

impl MvccReceiptStore {
    /// Open a fjall-backed engine in `dir`.
    pub fn open(
        dir: &Path,
        config: &ReceiptStoreConfig,
        supervisor: Arc<dyn Supervisor>,
    ) -> Result<Self> {
        config.validate()?;
        let state_config = StateStoreConfig {
            backend: "fjall".to_string(),
            async_write_buffer: config.async_write_buffer,
            // The receipt store runs its own pruner over the engine.
            keep_recent: 0,
            prune_interval_seconds: config.prune_interval_seconds,
            ..StateStoreConfig::default()
        };
        let options = MvccOptions::new(state_config)
            .with_supervisor(supervisor)
            .with_name("receipt");
        let db: Arc<dyn StateStore> = Arc::new(MvccDb::open(dir, options)?);
        Self::with_state_store(db, config)
    }

    /// Store receipts in an existing engine.
    pub fn with_state_store(db: Arc<dyn StateStore>, config: &ReceiptStoreConfig) -> Result<Self> {
        config.validate()?;
        let pruner = if config.keep_recent > 0 {
            Some(PruningManager::for_state_store(
                "receipt",
                Arc::clone(&db),
                config.keep_recent,
                config.prune_interval(),
            )?)
        } else {
            None
        };
        info!(latest = db.latest_version(), "opened MVCC receipt store");
        Ok(MvccReceiptStore {
            db,
            pruner: Mutex::new(pruner),
            cache_rotate_interval: config.cache_rotate_interval,
        })
    }

    /// Underlying engine.
    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.db
    }

    fn read_value(&self, tx_hash: &Hash) -> Result<Option<Vec<u8>>> {
        let version = self.db.latest_version();
        self.db.get(RECEIPT_NAMESPACE, version, tx_hash)
    }
}

impl ReceiptStore for MvccReceiptStore {
    fn latest_version(&self) -> Version {
        self.db.latest_version()
    }

    fn set_latest_version(&self, version: Version) -> Result<()> {
        self.db.set_latest_version(version)
    }

    fn set_earliest_version(&self, version: Version) -> Result<()> {
        self.db.set_earliest_version(version, true)
    }

    fn get_receipt_from_store(&self, tx_hash: &Hash) -> Result<Option<Receipt>> {
        self.read_value(tx_hash)?
            .map(|value| decode_receipt_value(&value))
            .transpose()
    }

    fn set_receipts(&self, ctx: &dyn ReceiptContext, records: Vec<ReceiptRecord>) -> Result<()> {
        let version = ctx.block_height() as Version;
        let mut pairs = Vec::with_capacity(records.len());
        for record in &records {
            pairs.push(KvPair::set(
                record.tx_hash.to_vec(),
                encode_receipt_value(&record.receipt)?,
            ));
        }
        let changesets = if pairs.is_empty() {
            Vec::new()
        } else {
            vec![NamedChangeSet::new(RECEIPT_NAMESPACE, ChangeSet::new(pairs))]
        };
        debug!(version, receipts = records.len(), "writing receipts");
        self.db.apply_changeset_async(version, changesets)
    }

    fn filter_logs(
        &self,
        _ctx: &dyn ReceiptContext,
        from: u64,
        to: u64,
        tx_hashes: &[Hash],
        criteria: &FilterCriteria,
    ) -> Result<Vec<Log>> {
        if from > to {
            return Err(Error::InvalidBlockRange { from, to });
        }
        let mut logs = Vec::new();
        for tx_hash in tx_hashes {
            let Some(value) = self.read_value(tx_hash)? else {
                continue;
            };
            let (bloom, body) = split_value(&value)?;
            if !bloom.may_match(criteria) {
                continue;
            }
            let receipt = decode_body(body)?;
            if receipt.block_number < from || receipt.block_number > to {
                continue;
            }
            logs.extend(
                receipt
                    .to_logs()
                    .filter(|log| criteria.matches(&log.address, &log.topics)),
            );
        }
        logs.sort_by_key(log_order);
        Ok(logs)
    }

    fn filters_by_tx_hash(&self) -> bool {
        true
    }

    fn cache_rotate_interval(&self) -> u64 {
        self.cache_rotate_interval
    }

    fn close(&self) -> Result<()> {
        if let Some(mut pruner) = self.pruner.lock().take() {
            pruner.stop();
        }
        self.db.close()
    }
}
