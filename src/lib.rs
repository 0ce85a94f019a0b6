//! versiondb - versioned key-value storage for a Cosmos-SDK chain
//!
//! Block state goes into an MVCC engine over an LSM; every read names the
//! version (block height) it observes. Transaction receipts go into a
//! receipt store with either an MVCC or a rotating columnar backend.
//!
//! # Quick Start
//!
//! ```ignore
//! use versiondb::{ChangeSet, KvPair, MvccDb, MvccOptions, NamedChangeSet, StateStore,
//!                 StateStoreConfig};
//!
//! let db = MvccDb::open(dir, MvccOptions::new(StateStoreConfig::default()))?;
//! db.apply_changeset_sync(1, &[NamedChangeSet::new("bank", ChangeSet::new(vec![
//!     KvPair::set("balance/alice", "100"),
//! ]))])?;
//! assert_eq!(db.get("bank", 1, b"balance/alice")?, Some(b"100".to_vec()));
//! ```
//!
//! # Crates
//!
//! - `versiondb-core`: types, errors, configuration, the `StateStore` trait
//! - `versiondb-durability`: the generic WAL and replay helper
//! - `versiondb-storage`: MVCC engine, pruning, registry, composite router
//! - `versiondb-receipt`: receipt stores and their cache

pub use versiondb_core::*;
pub use versiondb_durability::{recover_from_wal, Wal, WalConfig};
pub use versiondb_receipt::{
    open_receipt_store, BlockContext, CachedReceiptStore, ColumnarReceiptStore, FilterCriteria,
    Log, MvccReceiptStore, Receipt, ReceiptContext, ReceiptRecord, ReceiptStore,
};
pub use versiondb_storage::{
    BackendRegistry, CompositeStateStore, FjallEngine, KeyFamily, KvEngine, MemoryEngine, MvccDb,
    MvccOptions, PruningManager,
};
