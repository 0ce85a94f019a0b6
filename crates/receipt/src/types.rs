//! Receipt, log and filter types.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// 32-byte hash (transaction hash, topic, block hash).
pub type Hash = [u8; 32];

/// 20-byte account address.
pub type Address = [u8; 20];

/// Topics of one log; at most four in practice.
pub type Topics = SmallVec<[Hash; 4]>;

/// A log as emitted inside a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLog {
    /// Emitting contract
    pub address: Address,
    /// Indexed topics
    pub topics: Topics,
    /// Unindexed payload
    pub data: Vec<u8>,
    /// Position of the log within its block
    pub index: u32,
}

/// Execution receipt of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Transaction hash
    pub tx_hash: Hash,
    /// Transaction type
    pub tx_type: u8,
    /// Block the transaction was included in
    pub block_number: u64,
    /// Position of the transaction within its block
    pub tx_index: u32,
    /// Sender
    pub from: Address,
    /// Recipient; `None` for contract creation
    pub to: Option<Address>,
    /// Created contract, if any
    pub contract_address: Option<Address>,
    /// Gas used by this transaction
    pub gas_used: u64,
    /// Gas used by the block up to and including this transaction
    pub cumulative_gas_used: u64,
    /// Price paid per unit of gas
    pub effective_gas_price: u64,
    /// 1 on success, 0 on failure
    pub status: u8,
    /// Revert reason or VM error
    pub vm_error: String,
    /// Emitted logs
    pub logs: Vec<ReceiptLog>,
}

impl Receipt {
    /// Logs of this receipt in query form.
    pub fn to_logs(&self) -> impl Iterator<Item = Log> + '_ {
        self.logs.iter().map(move |l| Log {
            address: l.address,
            topics: l.topics.clone(),
            data: l.data.clone(),
            block_number: self.block_number,
            tx_hash: self.tx_hash,
            tx_index: self.tx_index,
            log_index: l.index,
            block_hash: [0u8; 32],
            removed: false,
        })
    }
}

/// A receipt paired with the hash it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    /// Lookup key
    pub tx_hash: Hash,
    /// The receipt
    pub receipt: Receipt,
}

impl ReceiptRecord {
    /// Record keyed by the receipt's own hash.
    pub fn new(receipt: Receipt) -> Self {
        ReceiptRecord {
            tx_hash: receipt.tx_hash,
            receipt,
        }
    }

    /// Block the receipt belongs to.
    pub fn block_number(&self) -> u64 {
        self.receipt.block_number
    }
}

/// A log as returned by `filter_logs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Emitting contract
    pub address: Address,
    /// Indexed topics
    pub topics: Topics,
    /// Unindexed payload
    pub data: Vec<u8>,
    /// Block number
    pub block_number: u64,
    /// Transaction hash
    pub tx_hash: Hash,
    /// Transaction index within the block
    pub tx_index: u32,
    /// Log index within the block
    pub log_index: u32,
    /// Block hash; zero when unknown
    pub block_hash: Hash,
    /// Whether the log was removed by a reorg
    pub removed: bool,
}

/// Log query criteria.
///
/// `addresses` matches any of the listed addresses (empty = any).
/// `topics[i]` matches topic position `i` against any of its hashes (empty =
/// wildcard); positions beyond `topics.len()` are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterCriteria {
    /// Accepted emitters
    pub addresses: Vec<Address>,
    /// Positional topic alternatives
    pub topics: Vec<Vec<Hash>>,
}

impl FilterCriteria {
    /// Exact match of one log against the criteria.
    pub fn matches(&self, address: &Address, topics: &[Hash]) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(address) {
            return false;
        }
        if self.topics.len() > topics.len()
            && self.topics[topics.len()..].iter().any(|alts| !alts.is_empty())
        {
            return false;
        }
        self.topics
            .iter()
            .zip(topics)
            .all(|(alts, topic)| alts.is_empty() || alts.contains(topic))
    }
}

/// Sort key of a log in query results.
pub fn log_order(log: &Log) -> (u64, u32, u32) {
    (log.block_number, log.tx_index, log.log_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_criteria_positional_topics() {
        let addr = [1u8; 20];
        let (t0, t1) = ([7u8; 32], [8u8; 32]);
        let topics = [t0, t1];

        assert!(FilterCriteria::default().matches(&addr, &topics));
        let by_addr = FilterCriteria {
            addresses: vec![[2u8; 20], addr],
            topics: vec![],
        };
        assert!(by_addr.matches(&addr, &topics));
        assert!(!by_addr.matches(&[3u8; 20], &topics));

        let wildcard_first = FilterCriteria {
            addresses: vec![],
            topics: vec![vec![], vec![t1]],
        };
        assert!(wildcard_first.matches(&addr, &topics));
        let swapped = FilterCriteria {
            addresses: vec![],
            topics: vec![vec![t1], vec![t0]],
        };
        assert!(!swapped.matches(&addr, &topics));
        let too_long = FilterCriteria {
            addresses: vec![],
            topics: vec![vec![], vec![], vec![t0]],
        };
        assert!(!too_long.matches(&addr, &topics));
    }

    #[test]
    fn test_receipt_logs() {
        let receipt = Receipt {
            tx_hash: [9u8; 32],
            block_number: 12,
            tx_index: 3,
            logs: vec![ReceiptLog {
                address: [1u8; 20],
                topics: smallvec![[2u8; 32]],
                data: vec![1, 2],
                index: 5,
            }],
            ..Receipt::default()
        };
        let logs: Vec<_> = receipt.to_logs().collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(log_order(&logs[0]), (12, 3, 5));
        assert_eq!(logs[0].tx_hash, [9u8; 32]);
    }
}
