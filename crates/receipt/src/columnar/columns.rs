//! Row buffers and their columnar chunk encodings.

use crate::bloom::Bloom;
use crate::types::{Address, FilterCriteria, Hash, Log, Receipt, Topics};
use serde::{Deserialize, Serialize};
use versiondb_core::{Error, Result};

/// Receipt rows of one chunk, one vector per column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiptColumns {
    /// Block of each receipt
    pub block_number: Vec<u64>,
    /// Transaction hash of each receipt
    pub tx_hash: Vec<Hash>,
    /// msgpack-encoded receipt
    pub body: Vec<Vec<u8>>,
}

impl ReceiptColumns {
    /// Append one encoded receipt.
    pub fn push(&mut self, block_number: u64, tx_hash: Hash, body: Vec<u8>) {
        self.block_number.push(block_number);
        self.tx_hash.push(tx_hash);
        self.body.push(body);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.tx_hash.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.tx_hash.is_empty()
    }

    /// Decode the newest receipt stored under `tx_hash`.
    pub fn find(&self, tx_hash: &Hash) -> Result<Option<Receipt>> {
        match self.tx_hash.iter().rposition(|h| h == tx_hash) {
            Some(row) => decode_receipt(&self.body[row]).map(Some),
            None => Ok(None),
        }
    }

    /// Every receipt, in row order.
    pub fn decode_all(&self) -> Result<Vec<Receipt>> {
        self.body.iter().map(|b| decode_receipt(b)).collect()
    }
}

/// Log rows of one chunk, one vector per column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogColumns {
    /// Block of each log
    pub block_number: Vec<u64>,
    /// Emitting transaction
    pub tx_hash: Vec<Hash>,
    /// Transaction index within the block
    pub tx_index: Vec<u32>,
    /// Log index within the block
    pub log_index: Vec<u32>,
    /// Emitting contract
    pub address: Vec<Address>,
    /// Indexed topics
    pub topics: Vec<Topics>,
    /// Unindexed payload
    pub data: Vec<Vec<u8>>,
}

impl LogColumns {
    /// Append every log of `receipt`.
    pub fn push_receipt(&mut self, receipt: &Receipt) {
        for log in &receipt.logs {
            self.block_number.push(receipt.block_number);
            self.tx_hash.push(receipt.tx_hash);
            self.tx_index.push(receipt.tx_index);
            self.log_index.push(log.index);
            self.address.push(log.address);
            self.topics.push(log.topics.clone());
            self.data.push(log.data.clone());
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.block_number.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.block_number.is_empty()
    }

    /// Append rows in blocks `from..=to` matching `criteria` to `out`,
    /// restricted to `tx_hashes` when it is non-empty.
    pub fn collect_matching(
        &self,
        from: u64,
        to: u64,
        tx_hashes: &[Hash],
        criteria: &FilterCriteria,
        out: &mut Vec<Log>,
    ) {
        for row in 0..self.len() {
            let block = self.block_number[row];
            if block < from || block > to {
                continue;
            }
            if !tx_hashes.is_empty() && !tx_hashes.contains(&self.tx_hash[row]) {
                continue;
            }
            if !criteria.matches(&self.address[row], &self.topics[row]) {
                continue;
            }
            out.push(Log {
                address: self.address[row],
                topics: self.topics[row].clone(),
                data: self.data[row].clone(),
                block_number: block,
                tx_hash: self.tx_hash[row],
                tx_index: self.tx_index[row],
                log_index: self.log_index[row],
                block_hash: [0u8; 32],
                removed: false,
            });
        }
    }
}

/// Encode a receipt for a row or a WAL entry.
pub fn encode_receipt(receipt: &Receipt) -> Result<Vec<u8>> {
    rmp_serde::to_vec(receipt).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a receipt row.
pub fn decode_receipt(bytes: &[u8]) -> Result<Receipt> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

/// Rows accepted since the last flush.
#[derive(Debug, Default)]
pub struct PendingChunk {
    /// Buffered receipts
    pub receipts: ReceiptColumns,
    /// Buffered logs
    pub logs: LogColumns,
    /// Bloom over buffered transaction hashes
    pub tx_bloom: Bloom,
    /// Bloom over buffered log addresses and topics
    pub log_bloom: Bloom,
    /// Lowest buffered block
    pub min_block: u64,
    /// Highest buffered block
    pub max_block: u64,
}

impl PendingChunk {
    /// Buffer one receipt and its logs.
    pub fn push(&mut self, receipt: &Receipt, body: Vec<u8>) {
        let block = receipt.block_number;
        if self.receipts.is_empty() {
            self.min_block = block;
            self.max_block = block;
        } else {
            self.min_block = self.min_block.min(block);
            self.max_block = self.max_block.max(block);
        }
        self.tx_bloom.accrue(&receipt.tx_hash);
        for log in &receipt.logs {
            self.log_bloom.accrue_log(&log.address, &log.topics);
        }
        self.receipts.push(block, receipt.tx_hash, body);
        self.logs.push_receipt(receipt);
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReceiptLog;
    use smallvec::smallvec;

    fn receipt(block: u64, tx: u8) -> Receipt {
        Receipt {
            tx_hash: [tx; 32],
            block_number: block,
            tx_index: tx as u32,
            logs: vec![
                ReceiptLog {
                    address: [1; 20],
                    topics: smallvec![[2; 32]],
                    data: vec![],
                    index: 0,
                },
                ReceiptLog {
                    address: [3; 20],
                    topics: smallvec![],
                    data: vec![],
                    index: 1,
                },
            ],
            ..Receipt::default()
        }
    }

    #[test]
    fn test_pending_chunk_tracks_range_and_blooms() {
        let mut pending = PendingChunk::default();
        for (block, tx) in [(5, 1), (4, 2), (6, 3)] {
            let r = receipt(block, tx);
            let body = encode_receipt(&r).unwrap();
            pending.push(&r, body);
        }
        assert_eq!((pending.min_block, pending.max_block), (4, 6));
        assert_eq!(pending.receipts.len(), 3);
        assert_eq!(pending.logs.len(), 6);
        assert!(pending.tx_bloom.may_contain(&[2u8; 32]));
        assert!(pending.log_bloom.may_contain(&[3u8; 20]));
        assert_eq!(pending.receipts.find(&[2u8; 32]).unwrap(), Some(receipt(4, 2)));
        assert_eq!(pending.receipts.find(&[9u8; 32]).unwrap(), None);
    }

    #[test]
    fn test_collect_matching_filters_range_hashes_and_criteria() {
        let mut logs = LogColumns::default();
        logs.push_receipt(&receipt(1, 1));
        logs.push_receipt(&receipt(2, 2));

        let mut out = Vec::new();
        let by_address = FilterCriteria {
            addresses: vec![[3; 20]],
            topics: vec![],
        };
        logs.collect_matching(0, 10, &[], &by_address, &mut out);
        assert_eq!(out.len(), 2);

        out.clear();
        logs.collect_matching(2, 2, &[], &FilterCriteria::default(), &mut out);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|l| l.block_number == 2));

        out.clear();
        logs.collect_matching(0, 10, &[[1u8; 32]], &FilterCriteria::default(), &mut out);
        assert!(out.iter().all(|l| l.tx_hash == [1u8; 32]));
        assert_eq!(out.len(), 2);
    }
}
