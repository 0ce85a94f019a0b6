//! Changeset and changelog types shared by the engine, the WAL and the stores.

use serde::{Deserialize, Serialize};

/// Block height at which a changeset is applied.
///
/// Signed so that retention arithmetic (`latest - keep_recent`) can go below
/// zero without wrapping.
pub type Version = i64;

/// One key write or delete inside a [`ChangeSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    /// User key
    pub key: Vec<u8>,
    /// New value, `None` for a delete
    pub value: Option<Vec<u8>>,
}

impl KvPair {
    /// A write of `value` under `key`.
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        KvPair {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// A delete of `key`.
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        KvPair {
            key: key.into(),
            value: None,
        }
    }

    /// Whether this pair deletes its key.
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// Ordered list of pairs applied atomically at one version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Pairs in application order
    pub pairs: Vec<KvPair>,
}

impl ChangeSet {
    /// Build a changeset from pairs.
    pub fn new(pairs: Vec<KvPair>) -> Self {
        ChangeSet { pairs }
    }

    /// Append a write.
    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.pairs.push(KvPair::set(key, value));
    }

    /// Append a delete.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.pairs.push(KvPair::delete(key));
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the changeset has no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// A changeset bound to the namespace (store name) it targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedChangeSet {
    /// Namespace the pairs belong to
    pub name: String,
    /// The pairs
    pub changeset: ChangeSet,
}

impl NamedChangeSet {
    /// Bind `changeset` to namespace `name`.
    pub fn new(name: impl Into<String>, changeset: ChangeSet) -> Self {
        NamedChangeSet {
            name: name.into(),
            changeset,
        }
    }
}

/// The WAL's durable unit: every namespace's changes for one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    /// Version the changes are applied at
    pub version: Version,
    /// Per-namespace changes
    pub changesets: Vec<NamedChangeSet>,
}

impl ChangelogEntry {
    /// Build an entry.
    pub fn new(version: Version, changesets: Vec<NamedChangeSet>) -> Self {
        ChangelogEntry {
            version,
            changesets,
        }
    }
}

/// One record of a bulk import stream (genesis or state-sync snapshot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    /// Namespace
    pub store_key: String,
    /// User key
    pub key: Vec<u8>,
    /// Value
    pub value: Vec<u8>,
}

impl SnapshotNode {
    /// Build a snapshot record.
    pub fn new(
        store_key: impl Into<String>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        SnapshotNode {
            store_key: store_key.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}
