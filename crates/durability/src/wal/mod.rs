//! WAL (Write-Ahead Log) module
//!
//! - `config`: WAL configuration (WalConfig, WalConfigError)
//! - `segment_log`: untyped segmented log addressed by index
//! - `log`: typed `Wal<E>` with async writer and retention pruner

pub mod config;
pub mod log;
pub mod segment_log;

pub use config::{WalConfig, WalConfigError};
pub use log::Wal;
pub use segment_log::SegmentLog;
