//! Durability layer for versiondb
//!
//! This crate handles everything the storage engine writes ahead of itself:
//!
//! - Binary on-disk format of WAL segments and records
//! - `Wal<E>`: typed, segmented write-ahead log with sync or async appends,
//!   replay, random reads, truncation at both ends and a retention pruner
//! - WAL-replay recovery shared by every store that logs before applying

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format; // WAL segment and record layout
pub mod replay; // Catch a store up with its WAL
pub mod wal; // SegmentLog, Wal<E>, WalConfig

pub use replay::{find_replay_start, recover_from_wal, ReplayStats};
pub use wal::{Wal, WalConfig, WalConfigError};
