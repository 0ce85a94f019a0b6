//! Core types and traits for versiondb
//!
//! This crate defines the vocabulary shared by every other crate:
//! - ChangeSet / NamedChangeSet / ChangelogEntry: what a block writes
//! - StateStore: the versioned key-value contract
//! - Error: one error type for the whole workspace
//! - Config: the `versiondb.toml` surface
//! - Supervisor: where fatal background failures are delivered

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config; // versiondb.toml sections
pub mod error; // Error, Result
pub mod fatal; // FatalError, Supervisor
pub mod traits; // StateStore, DbIterator
pub mod types; // ChangeSet, ChangelogEntry, SnapshotNode

pub use config::{
    ReadMode, ReceiptBackend, ReceiptStoreConfig, RouterConfig, StateStoreConfig, StorageConfig,
    WriteMode,
};
pub use error::{Error, Result};
pub use fatal::{AbortSupervisor, FatalError, RecordingSupervisor, Supervisor};
pub use traits::{DbIterator, Lookup, SnapshotStream, StateStore};
pub use types::{ChangeSet, ChangelogEntry, KvPair, NamedChangeSet, SnapshotNode, Version};
