//! Sealed file pairs and the reads that go through them.

use super::columns::{LogColumns, ReceiptColumns};
use super::file::{file_name, parse_file_name, ColumnFile, FileKind};
use crate::types::{FilterCriteria, Hash, Log, Receipt};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};
use versiondb_core::{Error, Result};

/// A sealed `receipts_<start>.col` / `logs_<start>.col` pair.
#[derive(Debug, Clone)]
pub struct SealedPair {
    /// Start block in the file names
    pub start_block: u64,
    /// Lowest block stored
    pub min_block: u64,
    /// Highest block stored
    pub max_block: u64,
    /// Receipt file
    pub receipts: ColumnFile,
    /// Log file
    pub logs: ColumnFile,
}

impl SealedPair {
    /// Paths of both files.
    pub fn paths(&self) -> [&Path; 2] {
        [&self.receipts.path, &self.logs.path]
    }
}

/// Look up `tx_hash` in the chunks of one receipt file, newest chunk first.
pub fn find_in_file(file: &ColumnFile, tx_hash: &Hash) -> Result<Option<Receipt>> {
    for meta in file.chunks.iter().rev() {
        if !meta.bloom.may_contain(tx_hash) {
            continue;
        }
        let columns: ReceiptColumns = file.read_chunk(meta)?;
        if let Some(receipt) = columns.find(tx_hash)? {
            return Ok(Some(receipt));
        }
    }
    Ok(None)
}

/// Append matching logs of one log file to `out`, skipping chunks whose
/// block range or bloom rules them out.
pub fn collect_from_file(
    file: &ColumnFile,
    from: u64,
    to: u64,
    tx_hashes: &[Hash],
    criteria: &FilterCriteria,
    out: &mut Vec<Log>,
) -> Result<usize> {
    let mut chunks_read = 0;
    for meta in &file.chunks {
        if !meta.overlaps(from, to) || !meta.bloom.may_match(criteria) {
            continue;
        }
        let columns: LogColumns = file.read_chunk(meta)?;
        columns.collect_matching(from, to, tx_hashes, criteria, out);
        chunks_read += 1;
    }
    Ok(chunks_read)
}

/// Sealed file pairs by start block.
#[derive(Debug, Default)]
pub struct FileIndex {
    pairs: BTreeMap<u64, SealedPair>,
}

impl FileIndex {
    /// Index the sealed pairs in `dir`.
    ///
    /// Pairs left unsealed by an interrupted rotation and sealed pairs with
    /// no rows are deleted; their blocks are still in the WAL. A file that
    /// cannot be read fails the load and is left in place.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut found: BTreeMap<u64, FxHashMap<FileKind, PathBuf>> = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some((kind, start)) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            found.entry(start).or_default().insert(kind, entry.path());
        }

        let mut index = FileIndex::default();
        for (start, mut files) in found {
            let receipts = files.remove(&FileKind::Receipts);
            let logs = files.remove(&FileKind::Logs);
            match Self::open_pair(receipts.as_deref(), logs.as_deref()) {
                Ok(Some(pair)) => index.add(pair),
                Ok(None) => {
                    warn!(start, "discarding unsealed column files");
                    for path in [receipts, logs].into_iter().flatten() {
                        fs::remove_file(&path)?;
                    }
                }
                Err(e) => {
                    error!(start, error = %e, "unreadable column file pair");
                    return Err(e);
                }
            }
        }
        Ok(index)
    }

    fn open_pair(receipts: Option<&Path>, logs: Option<&Path>) -> Result<Option<SealedPair>> {
        let (receipts, logs) = match (receipts, logs) {
            (Some(r), Some(l)) => (ColumnFile::open(r)?, ColumnFile::open(l)?),
            (Some(only), None) | (None, Some(only)) => {
                // Both files are created together; a lone sealed one lost
                // its partner after rotation.
                if ColumnFile::open(only)?.is_sealed() {
                    return Err(Error::Corruption(format!(
                        "{}: sealed column file without its pair",
                        only.display()
                    )));
                }
                return Ok(None);
            }
            (None, None) => return Ok(None),
        };
        let Some(footer) = receipts.footer.filter(|_| logs.is_sealed()) else {
            return Ok(None);
        };
        if footer.rows == 0 {
            return Ok(None);
        }
        Ok(Some(SealedPair {
            start_block: receipts.start_block,
            min_block: footer.min_block,
            max_block: footer.max_block,
            receipts,
            logs,
        }))
    }

    /// Reopen a just-sealed pair and add it.
    pub fn add_sealed(&mut self, dir: &Path, start_block: u64) -> Result<bool> {
        let receipts = dir.join(file_name(FileKind::Receipts, start_block));
        let logs = dir.join(file_name(FileKind::Logs, start_block));
        match Self::open_pair(Some(&receipts), Some(&logs))? {
            Some(pair) => {
                self.add(pair);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Add a pair.
    pub fn add(&mut self, pair: SealedPair) {
        self.pairs.insert(pair.start_block, pair);
    }

    /// Remove and return every pair whose blocks are all below `block`.
    pub fn remove_before(&mut self, block: u64) -> Vec<SealedPair> {
        let starts: Vec<u64> = self
            .pairs
            .values()
            .filter(|p| p.max_block < block)
            .map(|p| p.start_block)
            .collect();
        starts
            .into_iter()
            .filter_map(|s| self.pairs.remove(&s))
            .collect()
    }

    /// Pairs that may hold blocks `from..=to`, oldest first.
    pub fn overlapping(&self, from: u64, to: u64) -> impl Iterator<Item = &SealedPair> {
        self.pairs
            .values()
            .filter(move |p| p.min_block <= to && p.max_block >= from)
    }

    /// Pairs, newest first.
    pub fn newest_first(&self) -> impl Iterator<Item = &SealedPair> {
        self.pairs.values().rev()
    }

    /// Highest sealed block.
    pub fn max_block(&self) -> Option<u64> {
        self.pairs.values().map(|p| p.max_block).max()
    }

    /// Lowest sealed block.
    pub fn min_block(&self) -> Option<u64> {
        self.pairs.values().map(|p| p.min_block).min()
    }

    /// Number of sealed pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no pair is sealed.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
