//! Rotating columnar-file receipt store.
//!
//! Receipts are buffered in memory and written as compressed chunks to the
//! active file pair every `block_flush_interval` completed blocks. Every
//! `max_blocks_per_file` blocks the pair is sealed and a new one started.
//! A WAL with one entry per block covers everything not yet in a sealed
//! pair:
//!
//! ```text
//! set_receipts(block b):
//!   rotate if the active pair is full   (seal, index, clear WAL)
//!   WAL append b
//!   buffer b
//!   flush if enough blocks completed    (chunk append + fsync)
//! ```
//!
//! On open, unsealed pairs are deleted and the WAL is replayed into a fresh
//! active pair; WAL entries already covered by a sealed pair are dropped.

pub mod columns;
pub mod file;
pub mod hooks;
pub mod index;

pub use hooks::{FailOnce, FaultHooks, FaultPoint, NoFaults};

use crate::store::{ReceiptContext, ReceiptStore};
use crate::types::{log_order, FilterCriteria, Hash, Log, Receipt, ReceiptRecord};
use columns::{decode_receipt, encode_receipt, PendingChunk};
use file::{ColumnFile, ColumnWriter, FileKind};
use index::{collect_from_file, find_in_file, FileIndex};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use versiondb_core::{Error, ReceiptStoreConfig, Result, Version};
use versiondb_durability::{Wal, WalConfig};
use versiondb_storage::pruning::prune_target;
use versiondb_storage::PruningManager;

/// WAL directory under the store directory.
pub const WAL_DIR: &str = "columnar-wal";

/// One WAL entry: every receipt of one block in one `set_receipts` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    /// Block the receipts belong to
    pub block_number: u64,
    /// msgpack-encoded receipts
    pub receipts: Vec<Vec<u8>>,
}

struct Writers {
    receipts: ColumnWriter,
    logs: ColumnWriter,
}

#[derive(Default)]
struct WriteState {
    writers: Option<Writers>,
    pending: PendingChunk,
    file_start_block: u64,
    /// Distinct blocks in the active pair
    blocks_in_file: u64,
    blocks_since_flush: u64,
    last_block: Option<u64>,
    closed: bool,
}

struct Shared {
    dir: PathBuf,
    config: ReceiptStoreConfig,
    wal: Wal<BlockEntry>,
    state: Mutex<WriteState>,
    index: RwLock<FileIndex>,
    latest: AtomicI64,
    earliest: AtomicI64,
    hooks: Arc<dyn FaultHooks>,
}

/// Receipt store over rotating column files.
pub struct ColumnarReceiptStore {
    shared: Arc<Shared>,
    warmup: Mutex<Vec<ReceiptRecord>>,
    pruner: Mutex<Option<PruningManager>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ColumnarReceiptStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnarReceiptStore").finish_non_exhaustive()
    }
}

impl ColumnarReceiptStore {
    /// Open (or create) the store in `dir`, recovering from its WAL.
    pub fn open(dir: &Path, config: &ReceiptStoreConfig) -> Result<Self> {
        Self::open_with_hooks(dir, config, Arc::new(NoFaults))
    }

    /// Open with fault hooks installed on the write path.
    pub fn open_with_hooks(
        dir: &Path,
        config: &ReceiptStoreConfig,
        hooks: Arc<dyn FaultHooks>,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(dir)?;

        let index = FileIndex::load(dir)?;
        let wal: Wal<BlockEntry> = Wal::open(dir.join(WAL_DIR), WalConfig::new())?;
        let sealed_max = index.max_block();
        let earliest = index.min_block().unwrap_or(0);

        let shared = Arc::new(Shared {
            dir: dir.to_path_buf(),
            config: config.clone(),
            wal,
            state: Mutex::new(WriteState::default()),
            index: RwLock::new(index),
            latest: AtomicI64::new(sealed_max.unwrap_or(0) as Version),
            earliest: AtomicI64::new(earliest as Version),
            hooks,
        });

        let warmup = shared.replay_wal(sealed_max.map_or(0, |m| m + 1))?;

        let pruner = if config.keep_recent > 0 {
            let prune_shared = Arc::clone(&shared);
            Some(PruningManager::spawn(
                "receipt-columnar",
                config.prune_interval(),
                move || prune_shared.prune_files().map(|_| ()),
            )?)
        } else {
            None
        };

        info!(
            dir = %dir.display(),
            latest = shared.latest.load(Ordering::Acquire),
            sealed_files = shared.index.read().len(),
            replayed = warmup.len(),
            "opened columnar receipt store"
        );

        Ok(ColumnarReceiptStore {
            shared,
            warmup: Mutex::new(warmup),
            pruner: Mutex::new(pruner),
            closed: AtomicBool::new(false),
        })
    }

    /// First block of the active file pair.
    pub fn file_start_block(&self) -> u64 {
        self.shared.state.lock().file_start_block
    }

    /// Number of sealed file pairs.
    pub fn sealed_file_count(&self) -> usize {
        self.shared.index.read().len()
    }

    /// Delete sealed pairs older than the retention window. Returns the
    /// number of pairs removed.
    pub fn prune_files(&self) -> Result<usize> {
        self.shared.prune_files()
    }

    /// Abandon the store without flushing or sealing, as a crash would.
    pub fn simulate_crash(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut pruner) = self.pruner.lock().take() {
            pruner.stop();
        }
        let mut state = self.shared.state.lock();
        state.writers = None;
        state.closed = true;
        if let Err(e) = self.shared.wal.close() {
            warn!(error = %e, "closing WAL after simulated crash");
        }
    }
}

impl Shared {
    fn hook(&self, point: FaultPoint, block: u64) -> Result<()> {
        self.hooks.on_fault_point(point, block)
    }

    /// Replay WAL entries at or above `file_start` into a fresh active pair.
    fn replay_wal(&self, file_start: u64) -> Result<Vec<ReceiptRecord>> {
        let mut entries = Vec::new();
        let mut first_kept = None;
        let mut dropped_prefix_end = None;
        self.wal.replay(self.wal.first_offset(), self.wal.last_offset(), |offset, entry| {
            if entry.block_number < file_start {
                if first_kept.is_none() {
                    dropped_prefix_end = Some(offset);
                }
            } else {
                first_kept.get_or_insert(offset);
                entries.push((offset, entry));
            }
            Ok(())
        })?;

        if let Some(offset) = dropped_prefix_end {
            debug!(upto = offset, "dropping WAL entries covered by sealed files");
            self.wal.truncate_before(offset + 1)?;
        }

        let mut warmup = Vec::new();
        let mut state = self.state.lock();
        for (offset, entry) in entries {
            let records = decode_entry(&entry)?;
            // Entries from this one on are not sealed yet and stay logged.
            self.rotate_if_full(&mut state, entry.block_number, Some(offset))?;
            self.ingest(&mut state, &records)?;
            self.flush_if_due(&mut state)?;
            self.latest
                .fetch_max(entry.block_number as Version, Ordering::AcqRel);
            warmup.extend(records);
        }
        Ok(warmup)
    }

    /// Seal the active pair if it holds `max_blocks_per_file` blocks and
    /// `next_block` starts a new one, then drop the WAL entries before
    /// `keep_from` (the whole WAL when `None`).
    fn rotate_if_full(
        &self,
        state: &mut WriteState,
        next_block: u64,
        keep_from: Option<u64>,
    ) -> Result<bool> {
        if state.writers.is_none()
            || state.last_block == Some(next_block)
            || state.blocks_in_file < self.config.max_blocks_per_file
        {
            return Ok(false);
        }
        self.flush(state)?;
        let start = state.file_start_block;
        if let Some(writers) = state.writers.take() {
            writers.receipts.seal()?;
            writers.logs.seal()?;
        }
        self.hook(FaultPoint::AfterCloseWriters, next_block)?;

        if !self.index.write().add_sealed(&self.dir, start)? {
            warn!(start, "sealed an empty file pair");
        }
        let last = self.wal.last_offset();
        if last > 0 {
            self.wal.truncate_before(keep_from.unwrap_or(last + 1))?;
        }
        self.hook(FaultPoint::AfterWalClear, next_block)?;

        state.blocks_in_file = 0;
        state.blocks_since_flush = 0;
        state.last_block = None;
        info!(sealed = start, next = next_block, "rotated receipt files");
        Ok(true)
    }

    fn open_writers(&self, state: &mut WriteState, start_block: u64) -> Result<()> {
        state.writers = Some(Writers {
            receipts: ColumnWriter::create(&self.dir, FileKind::Receipts, start_block)?,
            logs: ColumnWriter::create(&self.dir, FileKind::Logs, start_block)?,
        });
        state.file_start_block = start_block;
        Ok(())
    }

    /// Buffer one block's receipts, counting the block on first sight.
    fn ingest(&self, state: &mut WriteState, records: &[ReceiptRecord]) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let block = first.block_number();
        if state.writers.is_none() {
            self.open_writers(state, block)?;
        }
        if state.last_block != Some(block) {
            state.blocks_in_file += 1;
            state.blocks_since_flush += 1;
            state.last_block = Some(block);
        }
        for record in records {
            let mut receipt = record.receipt.clone();
            receipt.tx_hash = record.tx_hash;
            let body = encode_receipt(&receipt)?;
            state.pending.push(&receipt, body);
        }
        Ok(())
    }

    /// Flush once `block_flush_interval` blocks were buffered.
    fn flush_if_due(&self, state: &mut WriteState) -> Result<()> {
        if state.blocks_since_flush >= self.config.block_flush_interval.max(1) {
            self.flush(state)?;
            state.blocks_since_flush = 0;
        }
        Ok(())
    }

    /// Write buffered rows to the active pair as one chunk per file.
    fn flush(&self, state: &mut WriteState) -> Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        let block = state.pending.max_block;
        self.hook(FaultPoint::BeforeFlush, block)?;
        let Some(writers) = state.writers.as_mut() else {
            return Err(Error::Closed("columnar receipt writer"));
        };
        let pending = &state.pending;
        writers.receipts.write_chunk(
            &pending.receipts,
            pending.receipts.len() as u32,
            pending.min_block,
            pending.max_block,
            &pending.tx_bloom,
        )?;
        if !pending.logs.is_empty() {
            writers.logs.write_chunk(
                &pending.logs,
                pending.logs.len() as u32,
                pending.min_block,
                pending.max_block,
                &pending.log_bloom,
            )?;
        }
        self.hook(FaultPoint::AfterFlush, block)?;
        state.pending = PendingChunk::default();
        debug!(block, "flushed receipt chunk");
        Ok(())
    }

    fn write_blocks(&self, batches: Vec<(BlockEntry, Vec<ReceiptRecord>)>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed("columnar receipt store"));
        }
        for (entry, records) in &batches {
            let block = entry.block_number;
            self.rotate_if_full(&mut state, block, None)?;
            self.wal.write(entry)?;
            self.hook(FaultPoint::AfterWalWrite, block)?;
            self.ingest(&mut state, records)?;
        }
        self.flush_if_due(&mut state)?;
        if let Some(max) = batches.iter().map(|(e, _)| e.block_number).max() {
            self.latest.fetch_max(max as Version, Ordering::AcqRel);
        }
        Ok(())
    }

    fn prune_files(&self) -> Result<usize> {
        if self.config.keep_recent <= 0 {
            return Ok(0);
        }
        let latest = self.latest.load(Ordering::Acquire);
        let Some(target) = prune_target(latest, self.config.keep_recent) else {
            return Ok(0);
        };
        let removed = self.index.write().remove_before(target as u64);
        for pair in &removed {
            for path in pair.paths() {
                if let Err(e) = fs::remove_file(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(file = %path.display(), error = %e, "failed to prune receipt file");
                    }
                }
            }
        }
        if let Some(min) = self.index.read().min_block() {
            self.earliest.fetch_max(min as Version, Ordering::AcqRel);
        }
        if !removed.is_empty() {
            info!(files = removed.len(), before = target, "pruned receipt files");
        }
        Ok(removed.len())
    }

    fn active_file(&self, state: &WriteState, kind: FileKind) -> Result<Option<ColumnFile>> {
        let Some(writers) = state.writers.as_ref() else {
            return Ok(None);
        };
        let writer = match kind {
            FileKind::Receipts => &writers.receipts,
            FileKind::Logs => &writers.logs,
        };
        ColumnFile::open(writer.path()).map(Some)
    }

    fn find_receipt(&self, tx_hash: &Hash) -> Result<Option<Receipt>> {
        {
            let state = self.state.lock();
            if let Some(receipt) = state.pending.receipts.find(tx_hash)? {
                return Ok(Some(receipt));
            }
            if let Some(file) = self.active_file(&state, FileKind::Receipts)? {
                if let Some(receipt) = find_in_file(&file, tx_hash)? {
                    return Ok(Some(receipt));
                }
            }
        }
        let index = self.index.read();
        for pair in index.newest_first() {
            if let Some(receipt) = find_in_file(&pair.receipts, tx_hash)? {
                return Ok(Some(receipt));
            }
        }
        Ok(None)
    }

    fn filter_logs(
        &self,
        from: u64,
        to: u64,
        tx_hashes: &[Hash],
        criteria: &FilterCriteria,
    ) -> Result<Vec<Log>> {
        let mut logs = Vec::new();
        {
            let index = self.index.read();
            for pair in index.overlapping(from, to) {
                collect_from_file(&pair.logs, from, to, tx_hashes, criteria, &mut logs)?;
            }
        }
        {
            let state = self.state.lock();
            if let Some(file) = self.active_file(&state, FileKind::Logs)? {
                collect_from_file(&file, from, to, tx_hashes, criteria, &mut logs)?;
            }
            let pending = &state.pending;
            if !pending.is_empty() && pending.log_bloom.may_match(criteria) {
                pending
                    .logs
                    .collect_matching(from, to, tx_hashes, criteria, &mut logs);
            }
        }
        logs.sort_by_key(log_order);
        Ok(logs)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        self.flush(&mut state)?;
        let start = state.file_start_block;
        if let Some(writers) = state.writers.take() {
            writers.receipts.seal()?;
            writers.logs.seal()?;
            self.index.write().add_sealed(&self.dir, start)?;
            let last = self.wal.last_offset();
            if last > 0 {
                self.wal.truncate_before(last + 1)?;
            }
        }
        self.wal.close()
    }
}

fn decode_entry(entry: &BlockEntry) -> Result<Vec<ReceiptRecord>> {
    entry
        .receipts
        .iter()
        .map(|bytes| decode_receipt(bytes).map(ReceiptRecord::new))
        .collect()
}

/// Group records into one WAL entry per block, in first-seen order.
fn group_by_block(records: Vec<ReceiptRecord>) -> Result<Vec<(BlockEntry, Vec<ReceiptRecord>)>> {
    let mut batches: Vec<(BlockEntry, Vec<ReceiptRecord>)> = Vec::new();
    for mut record in records {
        record.receipt.tx_hash = record.tx_hash;
        let block = record.block_number();
        let body = encode_receipt(&record.receipt)?;
        match batches.iter_mut().find(|(e, _)| e.block_number == block) {
            Some((entry, group)) => {
                entry.receipts.push(body);
                group.push(record);
            }
            None => batches.push((
                BlockEntry {
                    block_number: block,
                    receipts: vec![body],
                },
                vec![record],
            )),
        }
    }
    Ok(batches)
}

impl ReceiptStore for ColumnarReceiptStore {
    fn latest_version(&self) -> Version {
        self.shared.latest.load(Ordering::Acquire)
    }

    fn set_latest_version(&self, version: Version) -> Result<()> {
        self.shared.latest.store(version, Ordering::Release);
        Ok(())
    }

    fn set_earliest_version(&self, version: Version) -> Result<()> {
        self.shared.earliest.store(version, Ordering::Release);
        Ok(())
    }

    fn get_receipt_from_store(&self, tx_hash: &Hash) -> Result<Option<Receipt>> {
        self.shared.find_receipt(tx_hash)
    }

    fn set_receipts(&self, ctx: &dyn ReceiptContext, records: Vec<ReceiptRecord>) -> Result<()> {
        if records.is_empty() {
            self.shared
                .latest
                .fetch_max(ctx.block_height() as Version, Ordering::AcqRel);
            return Ok(());
        }
        let batches = group_by_block(records)?;
        self.shared.write_blocks(batches)
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
        self.shared.filter_logs(from, to, tx_hashes, criteria)
    }

    fn cache_rotate_interval(&self) -> u64 {
        self.shared.config.max_blocks_per_file
    }

    fn take_warmup_records(&self) -> Vec<ReceiptRecord> {
        std::mem::take(&mut *self.warmup.lock())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut pruner) = self.pruner.lock().take() {
            pruner.stop();
        }
        self.shared.close()
    }
}

impl Drop for ColumnarReceiptStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "closing columnar receipt store");
        }
    }
}
