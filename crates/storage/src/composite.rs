//! Composite state store: routes a key family between two stores.
//!
//! The family is one namespace plus an optional set of key prefixes (no
//! prefixes means the whole namespace). Keys outside the family always go
//! to the primary. For family keys:
//!
//! | write mode    | primary gets        | secondary gets |
//! |---------------|---------------------|----------------|
//! | `primary_only`| everything          | nothing        |
//! | `dual_write`  | everything          | family keys    |
//! | `split_write` | non-family keys     | family keys    |
//!
//! | read mode        | family keys are read from                        |
//! |------------------|--------------------------------------------------|
//! | `primary_only`   | primary                                          |
//! | `secondary_first`| secondary, then primary if never written there   |
//! | `split_read`     | secondary only                                   |
//!
//! Writes go to the primary first; if it fails the secondary is not
//! touched. Without a secondary every mode behaves as `primary_only`.

use std::cmp::Ordering;
use std::iter::Peekable;
use std::sync::Arc;
use tracing::{debug, info};
use versiondb_core::{
    ChangeSet, DbIterator, Lookup, NamedChangeSet, ReadMode, Result, RouterConfig, SnapshotNode,
    SnapshotStream, StateStore, Version, WriteMode,
};

/// The routed key family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFamily {
    namespace: String,
    prefixes: Vec<Vec<u8>>,
}

impl KeyFamily {
    /// Family of `namespace` keys starting with any of `prefixes`.
    pub fn new(namespace: impl Into<String>, prefixes: Vec<Vec<u8>>) -> Self {
        KeyFamily {
            namespace: namespace.into(),
            prefixes,
        }
    }

    /// Family described by a router config.
    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        Ok(Self::new(
            config.family_namespace.clone(),
            config.family_prefix_bytes()?,
        ))
    }

    /// Namespace of the family.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether `key` of the family namespace belongs to the family.
    pub fn matches_key(&self, key: &[u8]) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| key.starts_with(p))
    }

    /// Whether `(namespace, key)` belongs to the family.
    pub fn contains(&self, namespace: &str, key: &[u8]) -> bool {
        namespace == self.namespace && self.matches_key(key)
    }
}

/// A [`StateStore`] over a primary and an optional secondary store.
pub struct CompositeStateStore {
    primary: Arc<dyn StateStore>,
    secondary: Option<Arc<dyn StateStore>>,
    write_mode: WriteMode,
    read_mode: ReadMode,
    family: KeyFamily,
}

impl CompositeStateStore {
    /// Route between `primary` and `secondary` as `config` says.
    pub fn new(
        primary: Arc<dyn StateStore>,
        secondary: Option<Arc<dyn StateStore>>,
        config: &RouterConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (write_mode, read_mode) = match secondary {
            Some(_) => (config.write_mode, config.read_mode),
            None => (WriteMode::PrimaryOnly, ReadMode::PrimaryOnly),
        };
        info!(
            ?write_mode,
            ?read_mode,
            family = %config.family_namespace,
            prefixes = config.family_prefixes.len(),
            "composite state store"
        );
        Ok(CompositeStateStore {
            primary,
            secondary,
            write_mode,
            read_mode,
            family: KeyFamily::from_config(config)?,
        })
    }

    /// Effective write mode.
    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    /// Effective read mode.
    pub fn read_mode(&self) -> ReadMode {
        self.read_mode
    }

    /// The primary store.
    pub fn primary(&self) -> &Arc<dyn StateStore> {
        &self.primary
    }

    /// The secondary store, if any.
    pub fn secondary(&self) -> Option<&Arc<dyn StateStore>> {
        self.secondary.as_ref()
    }

    /// Secondary, when writes reach it.
    fn write_secondary(&self) -> Option<&Arc<dyn StateStore>> {
        match self.write_mode {
            WriteMode::PrimaryOnly => None,
            WriteMode::DualWrite | WriteMode::SplitWrite => self.secondary.as_ref(),
        }
    }

    /// Secondary, when reads of family keys reach it.
    fn read_secondary(&self) -> Option<&Arc<dyn StateStore>> {
        match self.read_mode {
            ReadMode::PrimaryOnly => None,
            ReadMode::SecondaryFirst | ReadMode::SplitRead => self.secondary.as_ref(),
        }
    }

    /// Split changesets into (primary, secondary) by write mode.
    fn route(&self, changesets: &[NamedChangeSet]) -> (Vec<NamedChangeSet>, Vec<NamedChangeSet>) {
        if self.write_secondary().is_none() {
            return (changesets.to_vec(), Vec::new());
        }
        let mut primary = Vec::with_capacity(changesets.len());
        let mut secondary = Vec::new();
        for cs in changesets {
            if cs.name != self.family.namespace {
                primary.push(cs.clone());
                continue;
            }
            let (family, rest): (Vec<_>, Vec<_>) = cs
                .changeset
                .pairs
                .iter()
                .cloned()
                .partition(|p| self.family.matches_key(&p.key));
            if !family.is_empty() {
                secondary.push(NamedChangeSet::new(cs.name.clone(), ChangeSet::new(family)));
            }
            match self.write_mode {
                WriteMode::SplitWrite => {
                    if !rest.is_empty() {
                        primary.push(NamedChangeSet::new(cs.name.clone(), ChangeSet::new(rest)));
                    }
                }
                _ => primary.push(cs.clone()),
            }
        }
        (primary, secondary)
    }

    fn merged<'a>(
        &'a self,
        secondary: &'a Arc<dyn StateStore>,
        version: Version,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Result<DbIterator<'a>> {
        let ns = self.family.namespace.as_str();
        let (from_secondary, from_primary) = if reverse {
            (
                secondary.reverse_iterator(ns, version, start, end)?,
                self.primary.reverse_iterator(ns, version, start, end)?,
            )
        } else {
            (
                secondary.iterator(ns, version, start, end)?,
                self.primary.iterator(ns, version, start, end)?,
            )
        };
        let family = &self.family;
        let (preferred, fallback): (DbIterator<'a>, DbIterator<'a>) = match self.read_mode {
            ReadMode::SplitRead => (
                Box::new(from_secondary.filter(move |item| keep(item, |k| family.matches_key(k)))),
                Box::new(from_primary.filter(move |item| keep(item, |k| !family.matches_key(k)))),
            ),
            // Secondary wins on keys present in both; a family key it has
            // deleted hides the primary's older value.
            _ => (
                Box::new(from_secondary.filter(move |item| keep(item, |k| family.matches_key(k)))),
                Box::new(from_primary.filter_map(move |item| match item {
                    Ok((k, v)) if family.matches_key(&k) => {
                        match secondary.lookup(ns, version, &k) {
                            Ok(Lookup::Deleted) => None,
                            Ok(_) => Some(Ok((k, v))),
                            Err(e) => Some(Err(e)),
                        }
                    }
                    other => Some(other),
                })),
            ),
        };
        Ok(Box::new(MergeIterator {
            preferred: preferred.peekable(),
            fallback: fallback.peekable(),
            reverse,
        }))
    }

    fn iter_impl<'a>(
        &'a self,
        namespace: &str,
        version: Version,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Result<DbIterator<'a>> {
        match self.read_secondary() {
            Some(secondary) if namespace == self.family.namespace => {
                self.merged(secondary, version, start, end, reverse)
            }
            _ if reverse => self.primary.reverse_iterator(namespace, version, start, end),
            _ => self.primary.iterator(namespace, version, start, end),
        }
    }
}

fn keep(item: &Result<(Vec<u8>, Vec<u8>)>, pred: impl Fn(&[u8]) -> bool) -> bool {
    match item {
        Ok((k, _)) => pred(k),
        Err(_) => true,
    }
}

/// Merges two key-ordered iterators; on equal keys `preferred` wins.
struct MergeIterator<'a> {
    preferred: Peekable<DbIterator<'a>>,
    fallback: Peekable<DbIterator<'a>>,
    reverse: bool,
}

impl<'a> Iterator for MergeIterator<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let order = match (self.preferred.peek(), self.fallback.peek()) {
            (None, None) => return None,
            (Some(_), None) | (Some(Err(_)), _) => Ordering::Less,
            (None, Some(_)) | (_, Some(Err(_))) => Ordering::Greater,
            (Some(Ok((a, _))), Some(Ok((b, _)))) => {
                let o = a.cmp(b);
                if self.reverse {
                    o.reverse()
                } else {
                    o
                }
            }
        };
        match order {
            Ordering::Less => self.preferred.next(),
            Ordering::Greater => self.fallback.next(),
            Ordering::Equal => {
                self.fallback.next();
                self.preferred.next()
            }
        }
    }
}

/// Diverts family nodes to a buffer while streaming to the primary.
struct SnapshotSplitter<'s, 'f> {
    source: SnapshotStream<'s>,
    family: &'f KeyFamily,
    split: bool,
    diverted: Vec<SnapshotNode>,
}

impl<'s, 'f> Iterator for SnapshotSplitter<'s, 'f> {
    type Item = SnapshotNode;

    fn next(&mut self) -> Option<SnapshotNode> {
        loop {
            let node = self.source.next()?;
            if !self.family.contains(&node.store_key, &node.key) {
                return Some(node);
            }
            if self.split {
                self.diverted.push(node);
            } else {
                self.diverted.push(node.clone());
                return Some(node);
            }
        }
    }
}

impl StateStore for CompositeStateStore {
    fn get(&self, namespace: &str, version: Version, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.lookup(namespace, version, key)?.into_value())
    }

    fn lookup(&self, namespace: &str, version: Version, key: &[u8]) -> Result<Lookup> {
        let secondary = match self.read_secondary() {
            Some(s) if self.family.contains(namespace, key) => s,
            _ => return self.primary.lookup(namespace, version, key),
        };
        match self.read_mode {
            ReadMode::SplitRead => secondary.lookup(namespace, version, key),
            _ => match secondary.lookup(namespace, version, key)? {
                Lookup::Absent => self.primary.lookup(namespace, version, key),
                found => Ok(found),
            },
        }
    }

    fn iterator<'a>(
        &'a self,
        namespace: &str,
        version: Version,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<DbIterator<'a>> {
        self.iter_impl(namespace, version, start, end, false)
    }

    fn reverse_iterator<'a>(
        &'a self,
        namespace: &str,
        version: Version,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<DbIterator<'a>> {
        self.iter_impl(namespace, version, start, end, true)
    }

    fn raw_iterate(
        &self,
        namespace: &str,
        f: &mut dyn FnMut(&[u8], &[u8], Version) -> bool,
    ) -> Result<bool> {
        let Some(secondary) = self.read_secondary() else {
            return self.primary.raw_iterate(namespace, f);
        };
        if namespace != self.family.namespace || self.read_mode != ReadMode::SplitRead {
            return self.primary.raw_iterate(namespace, f);
        }
        let family = &self.family;
        let stopped = secondary.raw_iterate(namespace, &mut |k, v, ver| {
            family.matches_key(k) && f(k, v, ver)
        })?;
        if stopped {
            return Ok(true);
        }
        self.primary.raw_iterate(namespace, &mut |k, v, ver| {
            !family.matches_key(k) && f(k, v, ver)
        })
    }

    fn latest_version(&self) -> Version {
        self.primary.latest_version()
    }

    fn set_latest_version(&self, version: Version) -> Result<()> {
        self.primary.set_latest_version(version)?;
        if let Some(s) = self.write_secondary() {
            s.set_latest_version(version)?;
        }
        Ok(())
    }

    fn earliest_version(&self) -> Version {
        self.primary.earliest_version()
    }

    fn set_earliest_version(&self, version: Version, ignore_version: bool) -> Result<()> {
        self.primary.set_earliest_version(version, ignore_version)?;
        if let Some(s) = self.write_secondary() {
            s.set_earliest_version(version, ignore_version)?;
        }
        Ok(())
    }

    fn apply_changeset_sync(&self, version: Version, changesets: &[NamedChangeSet]) -> Result<()> {
        let (to_primary, to_secondary) = self.route(changesets);
        self.primary.apply_changeset_sync(version, &to_primary)?;
        if let Some(s) = self.write_secondary() {
            s.apply_changeset_sync(version, &to_secondary)?;
        }
        Ok(())
    }

    fn apply_changeset_async(
        &self,
        version: Version,
        changesets: Vec<NamedChangeSet>,
    ) -> Result<()> {
        let (to_primary, to_secondary) = self.route(&changesets);
        self.primary.apply_changeset_async(version, to_primary)?;
        if let Some(s) = self.write_secondary() {
            s.apply_changeset_async(version, to_secondary)?;
        }
        Ok(())
    }

    fn wait_for_pending_writes(&self) -> Result<()> {
        self.primary.wait_for_pending_writes()?;
        if let Some(s) = self.write_secondary() {
            s.wait_for_pending_writes()?;
        }
        Ok(())
    }

    fn prune(&self, version: Version) -> Result<()> {
        self.primary.prune(version)?;
        if let Some(s) = &self.secondary {
            s.prune(version)?;
        }
        Ok(())
    }

    fn import(
        &self,
        version: Version,
        nodes: SnapshotStream<'_>,
        num_workers: usize,
    ) -> Result<()> {
        let Some(secondary) = self.write_secondary() else {
            return self.primary.import(version, nodes, num_workers);
        };
        let mut splitter = SnapshotSplitter {
            source: nodes,
            family: &self.family,
            split: self.write_mode == WriteMode::SplitWrite,
            diverted: Vec::new(),
        };
        self.primary.import(version, &mut splitter, num_workers)?;
        let diverted = std::mem::take(&mut splitter.diverted);
        debug!(nodes = diverted.len(), "importing key family into secondary");
        secondary.import(version, &mut diverted.into_iter(), num_workers)
    }

    fn delete_keys_at_version(&self, namespace: &str, version: Version) -> Result<()> {
        self.primary.delete_keys_at_version(namespace, version)?;
        if let Some(s) = self.write_secondary() {
            if namespace == self.family.namespace {
                s.delete_keys_at_version(namespace, version)?;
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let primary = self.primary.close();
        let secondary = match &self.secondary {
            Some(s) => s.close(),
            None => Ok(()),
        };
        primary.and(secondary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::{MvccDb, MvccOptions};
    use versiondb_core::{KvPair, StateStoreConfig};

    fn store() -> Arc<dyn StateStore> {
        Arc::new(MvccDb::in_memory(MvccOptions::new(StateStoreConfig::for_testing())).unwrap())
    }

    fn router(write_mode: WriteMode, read_mode: ReadMode) -> RouterConfig {
        RouterConfig {
            write_mode,
            read_mode,
            family_namespace: "evm".into(),
            family_prefixes: vec!["03".into()],
        }
    }

    fn block(pairs: Vec<KvPair>) -> Vec<NamedChangeSet> {
        vec![
            NamedChangeSet::new("evm", ChangeSet::new(pairs)),
            NamedChangeSet::new("bank", ChangeSet::new(vec![KvPair::set("b", "1")])),
        ]
    }

    #[test]
    fn test_family_matching() {
        let family = KeyFamily::new("evm", vec![vec![0x03]]);
        assert!(family.contains("evm", &[0x03, 1]));
        assert!(!family.contains("evm", &[0x04]));
        assert!(!family.contains("bank", &[0x03]));
        assert!(KeyFamily::new("evm", Vec::new()).contains("evm", b"anything"));
    }

    #[test]
    fn test_split_write_split_read() {
        let (p, s) = (store(), store());
        let c = CompositeStateStore::new(
            p.clone(),
            Some(s.clone()),
            &router(WriteMode::SplitWrite, ReadMode::SplitRead),
        )
        .unwrap();
        c.apply_changeset_sync(
            1,
            &block(vec![KvPair::set(vec![0x03, 1], "fam"), KvPair::set(vec![0x05], "other")]),
        )
        .unwrap();

        assert_eq!(p.get("evm", 1, &[0x03, 1]).unwrap(), None);
        assert_eq!(s.get("evm", 1, &[0x03, 1]).unwrap(), Some(b"fam".to_vec()));
        assert_eq!(s.get("bank", 1, b"b").unwrap(), None);
        assert_eq!(c.get("evm", 1, &[0x03, 1]).unwrap(), Some(b"fam".to_vec()));
        assert_eq!(c.get("evm", 1, &[0x05]).unwrap(), Some(b"other".to_vec()));

        let keys: Vec<_> = c
            .iterator("evm", 1, None, None)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![vec![0x03, 1], vec![0x05]]);
        let keys: Vec<_> = c
            .reverse_iterator("evm", 1, None, None)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![vec![0x05], vec![0x03, 1]]);
    }

    #[test]
    fn test_dual_write_secondary_first() {
        let (p, s) = (store(), store());
        let c = CompositeStateStore::new(
            p.clone(),
            Some(s.clone()),
            &router(WriteMode::DualWrite, ReadMode::SecondaryFirst),
        )
        .unwrap();
        c.apply_changeset_sync(1, &block(vec![KvPair::set(vec![0x03], "v")]))
            .unwrap();
        assert_eq!(p.get("evm", 1, &[0x03]).unwrap(), Some(b"v".to_vec()));
        assert_eq!(s.get("evm", 1, &[0x03]).unwrap(), Some(b"v".to_vec()));

        // Written only to the primary before migration started.
        p.apply_changeset_sync(2, &[NamedChangeSet::new(
            "evm",
            ChangeSet::new(vec![KvPair::set(vec![0x03, 9], "old")]),
        )])
        .unwrap();
        assert_eq!(c.get("evm", 2, &[0x03, 9]).unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn test_split_write_delete_hides_primary_value() {
        let (p, s) = (store(), store());
        // Written before the migration started.
        p.apply_changeset_sync(1, &[NamedChangeSet::new(
            "evm",
            ChangeSet::new(vec![KvPair::set(vec![0x03], "old"), KvPair::set(vec![0x03, 2], "kept")]),
        )])
        .unwrap();
        let c = CompositeStateStore::new(
            p.clone(),
            Some(s.clone()),
            &router(WriteMode::SplitWrite, ReadMode::SecondaryFirst),
        )
        .unwrap();
        c.apply_changeset_sync(2, &block(vec![KvPair::delete(vec![0x03])]))
            .unwrap();

        assert_eq!(p.get("evm", 2, &[0x03]).unwrap(), Some(b"old".to_vec()));
        assert_eq!(c.get("evm", 2, &[0x03]).unwrap(), None);
        assert_eq!(c.lookup("evm", 2, &[0x03]).unwrap(), Lookup::Deleted);
        assert!(!c.has("evm", 2, &[0x03]).unwrap());
        // Before the delete the primary's value still shows through.
        assert_eq!(c.get("evm", 1, &[0x03]).unwrap(), Some(b"old".to_vec()));
        assert_eq!(c.get("evm", 2, &[0x03, 2]).unwrap(), Some(b"kept".to_vec()));

        let keys: Vec<_> = c
            .iterator("evm", 2, None, None)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![vec![0x03, 2]]);
        let keys: Vec<_> = c
            .reverse_iterator("evm", 2, None, None)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![vec![0x03, 2]]);
        let keys: Vec<_> = c
            .iterator("evm", 1, None, None)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![vec![0x03], vec![0x03, 2]]);
    }

    #[test]
    fn test_without_secondary_degrades() {
        let p = store();
        let c = CompositeStateStore::new(
            p.clone(),
            None,
            &router(WriteMode::SplitWrite, ReadMode::SplitRead),
        )
        .unwrap();
        assert_eq!(c.write_mode(), WriteMode::PrimaryOnly);
        assert_eq!(c.read_mode(), ReadMode::PrimaryOnly);
        c.apply_changeset_sync(1, &block(vec![KvPair::set(vec![0x03], "v")]))
            .unwrap();
        assert_eq!(p.get("evm", 1, &[0x03]).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_primary_failure_leaves_secondary_untouched() {
        let primary = Arc::new(
            MvccDb::in_memory(MvccOptions::new(StateStoreConfig::for_testing())).unwrap(),
        );
        let s = store();
        let c = CompositeStateStore::new(
            primary.clone(),
            Some(s.clone()),
            &router(WriteMode::DualWrite, ReadMode::PrimaryOnly),
        )
        .unwrap();
        primary.engine().set_fail_writes(true);
        assert!(c
            .apply_changeset_sync(1, &block(vec![KvPair::set(vec![0x03], "v")]))
            .is_err());
        assert_eq!(s.latest_version(), 0);
        assert_eq!(s.get("evm", 1, &[0x03]).unwrap(), None);
    }

    #[test]
    fn test_split_import() {
        let (p, s) = (store(), store());
        let c = CompositeStateStore::new(
            p.clone(),
            Some(s.clone()),
            &router(WriteMode::SplitWrite, ReadMode::SplitRead),
        )
        .unwrap();
        let nodes = vec![
            SnapshotNode::new("evm", vec![0x03, 1], "fam"),
            SnapshotNode::new("evm", vec![0x07], "rest"),
            SnapshotNode::new("bank", b"b".to_vec(), "1"),
        ];
        c.import(5, &mut nodes.into_iter(), 2).unwrap();
        assert_eq!(p.get("evm", 5, &[0x03, 1]).unwrap(), None);
        assert_eq!(s.get("evm", 5, &[0x03, 1]).unwrap(), Some(b"fam".to_vec()));
        assert_eq!(p.get("evm", 5, &[0x07]).unwrap(), Some(b"rest".to_vec()));
        assert_eq!(p.get("bank", 5, b"b").unwrap(), Some(b"1".to_vec()));
    }
}
