//! Version pruning and per-version deletion.
//!
//! Pruning at `upto` removes an entry `p` with `p.version <= upto` when:
//!
//! - a newer entry of the same key also has version `<= upto` (`p` can no
//!   longer be the answer to any retained read), or
//! - `p` is the newest entry `<= upto` and is a tombstone, or
//! - `p` is the newest entry `<= upto` and keep-last is off.
//!
//! Entries above `upto` are never touched. A namespace whose last write
//! predates the current earliest version is skipped.

use super::db::Inner;
use super::PRUNE_COMMIT_BATCH_SIZE;
use crate::encoding::{
    decode_user_key, decode_value, is_deleted_at, namespace_prefix, unescape, DATA_PREFIX,
};
use crate::kv::{prefix_end, prefix_upper_bound, KvEngine, WriteBatch};
use std::ops::Bound;
use tracing::debug;
use versiondb_core::{Result, Version};

struct Candidate {
    raw_key: Vec<u8>,
    key: Vec<u8>,
    tombstoned: bool,
}

/// Batches deletions and commits every `PRUNE_COMMIT_BATCH_SIZE`.
struct Deleter<'a, K> {
    kv: &'a K,
    batch: WriteBatch,
    deleted: u64,
}

impl<'a, K: KvEngine> Deleter<'a, K> {
    fn new(kv: &'a K) -> Self {
        Deleter {
            kv,
            batch: WriteBatch::new(),
            deleted: 0,
        }
    }

    fn delete(&mut self, raw_key: Vec<u8>) -> Result<()> {
        self.batch.delete(raw_key);
        self.deleted += 1;
        if self.batch.len() >= PRUNE_COMMIT_BATCH_SIZE {
            self.kv.write(std::mem::take(&mut self.batch))?;
        }
        Ok(())
    }

    fn finish(self) -> Result<u64> {
        if !self.batch.is_empty() {
            self.kv.write(self.batch)?;
        }
        Ok(self.deleted)
    }
}

/// Remove versions made unreachable by retiring every version `<= upto`.
/// Returns the number of deleted entries.
pub(crate) fn prune_versions<K: KvEngine>(
    inner: &Inner<K>,
    upto: Version,
    keep_last: bool,
) -> Result<u64> {
    let earliest = inner.earliest();
    let end = prefix_upper_bound(DATA_PREFIX);
    let mut cursor = DATA_PREFIX.to_vec();
    let mut deleter = Deleter::new(&inner.kv);

    loop {
        // Seek to the first key of the next namespace.
        let first = inner
            .kv
            .range(Bound::Included(cursor.clone()), end.clone())
            .next();
        let raw = match first {
            Some(item) => item?.0,
            None => break,
        };
        let (namespace, used) = unescape(&raw[DATA_PREFIX.len()..])?;
        let ns_prefix = raw[..DATA_PREFIX.len() + used].to_vec();
        let ns_end = prefix_end(&ns_prefix);
        let namespace = String::from_utf8_lossy(&namespace).into_owned();

        let skip = match inner.dirty.get(&namespace) {
            Some(last_written) => *last_written < earliest,
            None => true,
        };
        if skip {
            debug!(namespace = %namespace, "namespace clean since last prune, skipping");
        } else {
            prune_namespace(inner, &ns_prefix, upto, keep_last, &mut deleter)?;
        }

        match ns_end {
            Some(next) => cursor = next,
            None => break,
        }
    }

    deleter.finish()
}

fn prune_namespace<K: KvEngine>(
    inner: &Inner<K>,
    ns_prefix: &[u8],
    upto: Version,
    keep_last: bool,
    deleter: &mut Deleter<'_, K>,
) -> Result<()> {
    // Deletes `p` when nothing at or below `upto` supersedes it.
    let retire_last = |p: Candidate, deleter: &mut Deleter<'_, K>| -> Result<()> {
        if p.tombstoned || !keep_last {
            deleter.delete(p.raw_key)?;
        }
        Ok(())
    };

    let mut prev: Option<Candidate> = None;
    let upper = prefix_upper_bound(ns_prefix);
    for item in inner
        .kv
        .range(Bound::Included(ns_prefix.to_vec()), upper)
    {
        let (raw_key, raw_value) = item?;
        let (key, version) = decode_user_key(&raw_key[ns_prefix.len()..])?;

        if version > upto {
            if let Some(p) = prev.take() {
                retire_last(p, deleter)?;
            }
            continue;
        }

        let (_, tombstone) = decode_value(&raw_value)?;
        let current = Candidate {
            raw_key,
            key,
            tombstoned: is_deleted_at(tombstone, upto),
        };
        if let Some(p) = prev.take() {
            if p.key == current.key {
                deleter.delete(p.raw_key)?;
            } else {
                retire_last(p, deleter)?;
            }
        }
        prev = Some(current);
    }
    if let Some(p) = prev {
        retire_last(p, deleter)?;
    }
    Ok(())
}

/// Delete every entry of `namespace` written at exactly `version`.
pub(crate) fn delete_at_version<K: KvEngine>(
    inner: &Inner<K>,
    namespace: &str,
    version: Version,
) -> Result<u64> {
    let ns_prefix = namespace_prefix(namespace);
    let upper = prefix_upper_bound(&ns_prefix);
    let mut deleter = Deleter::new(&inner.kv);
    for item in inner
        .kv
        .range(Bound::Included(ns_prefix.clone()), upper)
    {
        let (raw_key, _) = item?;
        let (_, v) = decode_user_key(&raw_key[ns_prefix.len()..])?;
        if v == version {
            deleter.delete(raw_key)?;
        }
    }
    deleter.finish()
}
