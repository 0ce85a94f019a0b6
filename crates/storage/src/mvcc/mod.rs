//! Multi-version state storage.

mod db;
mod import;
mod iterator;
mod prune;

pub use db::{MvccDb, MvccOptions, CHANGELOG_DIR, DATA_DIR};
pub use iterator::MvccIterator;

/// Pairs per committed batch during import.
pub const IMPORT_COMMIT_BATCH_SIZE: usize = 10_000;

/// Deletions per committed batch while pruning.
pub const PRUNE_COMMIT_BATCH_SIZE: usize = 50;
