//! Transaction receipt storage for versiondb
//!
//! Two interchangeable backends implement [`ReceiptStore`]:
//! - [`MvccReceiptStore`]: receipts as versioned pairs in an MVCC engine,
//!   each value prefixed with its log bloom
//! - [`ColumnarReceiptStore`]: rotating, compressed column files protected
//!   by a per-block WAL, with crash recovery at every step of the write path
//!
//! [`open_receipt_store`] picks a backend from configuration and fronts it
//! with a three-generation [`ReceiptCache`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bloom; // 2048-bit keccak log bloom
pub mod cache; // ReceiptCache, CachedReceiptStore
pub mod columnar; // ColumnarReceiptStore and its file format
pub mod mvcc_store; // MvccReceiptStore
pub mod store; // ReceiptStore, ReceiptContext, factory
pub mod types; // Receipt, Log, FilterCriteria

pub use bloom::Bloom;
pub use cache::{CachedReceiptStore, ReceiptCache};
pub use columnar::{ColumnarReceiptStore, FailOnce, FaultHooks, FaultPoint, NoFaults};
pub use mvcc_store::{MvccReceiptStore, RECEIPT_NAMESPACE};
pub use store::{open_receipt_store, BlockContext, ReceiptContext, ReceiptStore};
pub use types::{Address, FilterCriteria, Hash, Log, Receipt, ReceiptLog, ReceiptRecord};
