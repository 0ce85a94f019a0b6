//! The versioned state-store contract.
//!
//! Higher-level module stores talk to storage only through [`StateStore`].
//! Both the MVCC engine and the composite router implement it, so a router
//! can stand anywhere a single engine can.

use crate::error::Result;
use crate::types::{NamedChangeSet, SnapshotNode, Version};

/// Iterator over `(user_key, value)` pairs visible at some version.
pub type DbIterator<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>;

/// Source of records for a bulk import.
pub type SnapshotStream<'a> = &'a mut (dyn Iterator<Item = SnapshotNode> + Send);

/// Outcome of a point read that tells a deletion apart from a key that
/// was never written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Value visible at the read version
    Value(Vec<u8>),
    /// Tombstoned at or below the read version
    Deleted,
    /// No entry at or below the read version
    Absent,
}

impl Lookup {
    /// The visible value, if any.
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Lookup::Value(v) => Some(v),
            Lookup::Deleted | Lookup::Absent => None,
        }
    }
}

/// Versioned key-value store.
///
/// # Visibility
///
/// A read at `version` sees, for each key, the value written at the highest
/// version `<= version`, unless that value carries a tombstone at or below
/// `version`. Reads below [`StateStore::earliest_version`] see nothing.
pub trait StateStore: Send + Sync {
    /// Point read visible at `version`.
    fn get(&self, namespace: &str, version: Version, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Point read that reports tombstones as [`Lookup::Deleted`].
    ///
    /// Stores that cannot tell a deletion from absence report both as
    /// [`Lookup::Absent`].
    fn lookup(&self, namespace: &str, version: Version, key: &[u8]) -> Result<Lookup> {
        Ok(match self.get(namespace, version, key)? {
            Some(v) => Lookup::Value(v),
            None => Lookup::Absent,
        })
    }

    /// Existence check with the same visibility rule as [`StateStore::get`].
    fn has(&self, namespace: &str, version: Version, key: &[u8]) -> Result<bool> {
        Ok(self.get(namespace, version, key)?.is_some())
    }

    /// Ascending iteration over `[start, end)` at `version`.
    ///
    /// `None` bounds are open. An empty bound is [`crate::Error::KeyEmpty`];
    /// `start > end` is [`crate::Error::StartAfterEnd`].
    fn iterator<'a>(
        &'a self,
        namespace: &str,
        version: Version,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<DbIterator<'a>>;

    /// Descending iteration over `[start, end)` at `version`.
    fn reverse_iterator<'a>(
        &'a self,
        namespace: &str,
        version: Version,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<DbIterator<'a>>;

    /// Visit every stored, non-deleted `(key, value, version)` of a namespace
    /// in key order. The callback returns `true` to stop early.
    ///
    /// Returns whether iteration was stopped by the callback.
    fn raw_iterate(
        &self,
        namespace: &str,
        f: &mut dyn FnMut(&[u8], &[u8], Version) -> bool,
    ) -> Result<bool>;

    /// Highest version applied so far.
    fn latest_version(&self) -> Version;

    /// Persist a new latest version.
    fn set_latest_version(&self, version: Version) -> Result<()>;

    /// Lowest readable version.
    fn earliest_version(&self) -> Version;

    /// Persist a new earliest version. Only moves forward unless
    /// `ignore_version` is set.
    fn set_earliest_version(&self, version: Version, ignore_version: bool) -> Result<()>;

    /// Apply changesets atomically at `version` and return once durable.
    fn apply_changeset_sync(&self, version: Version, changesets: &[NamedChangeSet]) -> Result<()>;

    /// Log changesets to the WAL and enqueue them for background
    /// application. Returns once enqueued, not once applied.
    fn apply_changeset_async(&self, version: Version, changesets: Vec<NamedChangeSet>)
        -> Result<()>;

    /// Block until every previously enqueued async changeset is applied.
    fn wait_for_pending_writes(&self) -> Result<()>;

    /// Drop versions at or below `version` that no read at or above
    /// `version + 1` can observe, then advance the earliest version.
    fn prune(&self, version: Version) -> Result<()>;

    /// Bulk-load records at `version` with `num_workers` parallel batches.
    fn import(&self, version: Version, nodes: SnapshotStream<'_>, num_workers: usize)
        -> Result<()>;

    /// Physically delete every entry of `namespace` written at exactly
    /// `version`.
    fn delete_keys_at_version(&self, namespace: &str, version: Version) -> Result<()>;

    /// Stop background work and release the store. Idempotent.
    fn close(&self) -> Result<()>;
}
