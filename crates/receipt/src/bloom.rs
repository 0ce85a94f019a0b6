//! 2048-bit log bloom.
//!
//! Each item sets three bits: the low 11 bits of byte pairs (0,1), (2,3)
//! and (4,5) of `keccak256(item)`. A filter can only exclude: a clear bit
//! for every alternative of some constraint proves no match.

use crate::types::{Address, FilterCriteria, Hash, ReceiptLog};
use sha3::{Digest, Keccak256};

/// Bloom size in bytes.
pub const BLOOM_BYTES: usize = 256;

/// A 2048-bit bloom filter.
#[derive(Clone, PartialEq, Eq)]
pub struct Bloom([u8; BLOOM_BYTES]);

impl std::fmt::Debug for Bloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: u32 = self.0.iter().map(|b| b.count_ones()).sum();
        write!(f, "Bloom({} bits set)", set)
    }
}

impl Default for Bloom {
    fn default() -> Self {
        Bloom([0u8; BLOOM_BYTES])
    }
}

fn bit_positions(item: &[u8]) -> [(usize, u8); 3] {
    let digest = Keccak256::digest(item);
    let mut out = [(0usize, 0u8); 3];
    for (i, slot) in out.iter_mut().enumerate() {
        let bit = ((digest[2 * i] as usize) << 8 | digest[2 * i + 1] as usize) & 0x7FF;
        *slot = (BLOOM_BYTES - 1 - bit / 8, 1u8 << (bit % 8));
    }
    out
}

impl Bloom {
    /// Empty bloom.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bloom over the addresses and topics of `logs`.
    pub fn from_logs<'a>(logs: impl IntoIterator<Item = &'a ReceiptLog>) -> Self {
        let mut bloom = Self::new();
        for log in logs {
            bloom.accrue_log(&log.address, &log.topics);
        }
        bloom
    }

    /// Rebuild from stored bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; BLOOM_BYTES] = bytes.try_into().ok()?;
        Some(Bloom(array))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; BLOOM_BYTES] {
        &self.0
    }

    /// Add one item.
    pub fn accrue(&mut self, item: &[u8]) {
        for (byte, mask) in bit_positions(item) {
            self.0[byte] |= mask;
        }
    }

    /// Add a log's address and topics.
    pub fn accrue_log(&mut self, address: &Address, topics: &[Hash]) {
        self.accrue(address);
        for topic in topics {
            self.accrue(topic);
        }
    }

    /// Merge another bloom into this one.
    pub fn accrue_bloom(&mut self, other: &Bloom) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a |= b;
        }
    }

    /// Whether `item` may have been added.
    pub fn may_contain(&self, item: &[u8]) -> bool {
        bit_positions(item)
            .iter()
            .all(|(byte, mask)| self.0[*byte] & mask != 0)
    }

    /// Whether a log matching `criteria` may have been added.
    pub fn may_match(&self, criteria: &FilterCriteria) -> bool {
        if !criteria.addresses.is_empty()
            && !criteria.addresses.iter().any(|a| self.may_contain(a))
        {
            return false;
        }
        criteria
            .topics
            .iter()
            .all(|alts| alts.is_empty() || alts.iter().any(|t| self.may_contain(t)))
    }
}
