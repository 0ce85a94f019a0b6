//! Versioned state storage for versiondb
//!
//! This crate implements the state store on top of an LSM:
//! - KvEngine: ordered byte storage (fjall, or in-memory for tests)
//! - MvccDb: one entry per (namespace, key, version), with an async apply
//!   pipeline backed by a changelog WAL
//! - PruningManager: periodic removal of versions older than `keep_recent`
//! - BackendRegistry: state store backends by name
//! - CompositeStateStore: routes a key family between two stores
//!
//! # Reads
//!
//! `get(ns, v, key)` returns the newest value written at or below `v`,
//! unless that entry is a deletion. Reads below the earliest retained
//! version return nothing.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod composite; // key family routing between two stores
pub mod encoding; // MVCC key/value layout
pub mod kv; // KvEngine, FjallEngine, MemoryEngine
pub mod metrics; // counters + periodic collector
pub mod mvcc; // MvccDb
pub mod pruning; // background prune loop
pub mod registry; // backends by name

pub use composite::{CompositeStateStore, KeyFamily};
pub use kv::{FjallEngine, KvEngine, MemoryEngine, WriteBatch};
pub use metrics::{EngineMetrics, MetricsCollector, MetricsSnapshot};
pub use mvcc::{MvccDb, MvccOptions};
pub use pruning::PruningManager;
pub use registry::{BackendRegistry, FJALL_BACKEND, MEMORY_BACKEND};
