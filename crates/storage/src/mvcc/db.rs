//! The MVCC engine.
//!
//! `MvccDb` stores every `(namespace, key, version)` as its own LSM entry
//! (see [`crate::encoding`]) and answers reads at any retained version.
//!
//! # Write paths
//!
//! - `apply_changeset_sync`: one atomic batch holding every pair plus the new
//!   latest version.
//! - `apply_changeset_async`: append a [`ChangelogEntry`] to the changelog
//!   WAL, then enqueue it for the single applier thread. The queue is bounded;
//!   a full queue blocks the producer. `wait_for_pending_writes` enqueues a
//!   barrier and blocks until the applier reaches it.
//!
//! If the applier fails to apply a changeset, the engine is poisoned: the
//! failure goes to the [`Supervisor`] and every later write returns
//! [`Error::Fatal`].
//!
//! # Recovery
//!
//! On open the changelog is replayed from the first entry newer than the
//! persisted latest version, so changesets that were logged but never
//! applied before a crash are applied before the engine is handed out.

use super::import::import_nodes;
use super::iterator::MvccIterator;
use super::prune::{delete_at_version, prune_versions};
use crate::encoding::{
    decode_meta_version, decode_user_key, decode_value, encode_key, encode_meta_version,
    encode_value, is_deleted_at, key_prefix, namespace_prefix, with_version,
    EARLIEST_VERSION_KEY, LATEST_VERSION_KEY,
};
use crate::kv::{prefix_upper_bound, FjallEngine, KvEngine, MemoryEngine, WriteBatch};
use crate::metrics::{EngineMetrics, MetricsCollector, MetricsSnapshot};
use crate::pruning::{prune_target, PruningManager};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use versiondb_core::{
    AbortSupervisor, ChangelogEntry, DbIterator, Error, FatalError, Lookup, NamedChangeSet, Result,
    SnapshotStream, StateStore, StateStoreConfig, Supervisor, Version,
};
use versiondb_durability::{recover_from_wal, Wal, WalConfig};

/// Directory of the LSM data under an engine's root.
pub const DATA_DIR: &str = "data";

/// Directory of the changelog WAL under an engine's root.
pub const CHANGELOG_DIR: &str = "changelog";

/// Options for opening an [`MvccDb`].
#[derive(Clone)]
pub struct MvccOptions {
    /// Store settings
    pub config: StateStoreConfig,
    /// Receiver of fatal background failures
    pub supervisor: Arc<dyn Supervisor>,
    /// Label used in logs and metrics
    pub name: String,
}

impl MvccOptions {
    /// Options with the aborting supervisor.
    pub fn new(config: StateStoreConfig) -> Self {
        MvccOptions {
            config,
            supervisor: Arc::new(AbortSupervisor),
            name: "state".to_string(),
        }
    }

    /// Builder: supervisor.
    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Builder: label.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

enum ApplyMsg {
    Changeset(ChangelogEntry),
    Barrier(SyncSender<()>),
}

#[derive(Default)]
struct Pipeline {
    queue: Option<SyncSender<ApplyMsg>>,
    applier: Option<JoinHandle<()>>,
}

/// State shared between the handle and the applier thread.
pub(crate) struct Inner<K> {
    pub(crate) kv: K,
    latest: AtomicI64,
    earliest: AtomicI64,
    /// Last version written per namespace; a pruning hint only
    pub(crate) dirty: DashMap<String, Version>,
    pub(crate) metrics: Arc<EngineMetrics>,
    supervisor: Arc<dyn Supervisor>,
    fatal: Mutex<Option<FatalError>>,
    /// Serializes batches that persist a version bound
    write_lock: Mutex<()>,
}

impl<K: KvEngine> Inner<K> {
    pub(crate) fn latest(&self) -> Version {
        self.latest.load(Ordering::Acquire)
    }

    pub(crate) fn earliest(&self) -> Version {
        self.earliest.load(Ordering::Acquire)
    }

    fn check_healthy(&self) -> Result<()> {
        match self.fatal.lock().as_ref() {
            Some(f) => Err(f.clone().into()),
            None => Ok(()),
        }
    }

    fn poison(&self, err: FatalError) {
        self.fatal.lock().get_or_insert_with(|| err.clone());
        self.supervisor.on_fatal(err);
    }

    pub(crate) fn mark_dirty(&self, namespace: &str, version: Version) {
        self.dirty
            .entry(namespace.to_string())
            .and_modify(|v| *v = (*v).max(version))
            .or_insert(version);
    }

    fn apply(&self, version: Version, changesets: &[NamedChangeSet]) -> Result<()> {
        if version < 0 {
            return Err(Error::InvalidVersion(version));
        }
        // Version 0 is reserved by the key encoding.
        let version = version.max(1);
        let started = Instant::now();

        let mut batch = WriteBatch::new();
        let mut pairs = 0;
        for cs in changesets {
            for pair in &cs.changeset.pairs {
                let key = encode_key(&cs.name, &pair.key, version);
                let value = match &pair.value {
                    Some(v) => encode_value(v, None),
                    None => encode_value(&[], Some(version)),
                };
                batch.put(key, value);
                pairs += 1;
            }
        }

        let _guard = self.write_lock.lock();
        let latest = self.latest().max(version);
        batch.put(LATEST_VERSION_KEY.to_vec(), encode_meta_version(latest));
        self.kv.write(batch)?;
        self.latest.fetch_max(version, Ordering::AcqRel);
        drop(_guard);

        for cs in changesets {
            self.mark_dirty(&cs.name, version);
        }
        self.metrics.record_apply(started, pairs);
        Ok(())
    }

    fn set_latest(&self, version: Version) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::new();
        batch.put(LATEST_VERSION_KEY.to_vec(), encode_meta_version(version));
        self.kv.write(batch)?;
        self.latest.store(version, Ordering::Release);
        Ok(())
    }

    pub(crate) fn set_earliest(&self, version: Version, ignore_version: bool) -> Result<()> {
        let _guard = self.write_lock.lock();
        if !ignore_version && version <= self.earliest() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        batch.put(EARLIEST_VERSION_KEY.to_vec(), encode_meta_version(version));
        self.kv.write(batch)?;
        self.earliest.store(version, Ordering::Release);
        Ok(())
    }

    fn lookup(&self, namespace: &str, version: Version, key: &[u8]) -> Result<Lookup> {
        if version < self.earliest() {
            return Ok(Lookup::Absent);
        }
        let started = Instant::now();
        let prefix = key_prefix(namespace, key);
        let lower = with_version(prefix.clone(), 0);
        let upper = with_version(prefix, version);

        let found = self
            .kv
            .range(Bound::Included(lower), Bound::Included(upper))
            .next_back();
        let result = match found {
            None => Lookup::Absent,
            Some(item) => {
                let (_, raw) = item?;
                let (value, tombstone) = decode_value(&raw)?;
                if is_deleted_at(tombstone, version) {
                    Lookup::Deleted
                } else {
                    Lookup::Value(value.to_vec())
                }
            }
        };
        self.metrics.record_get(started);
        Ok(result)
    }

    fn get(&self, namespace: &str, version: Version, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.lookup(namespace, version, key)?.into_value())
    }

    /// Drop versions at or below `version` and move `earliest` past it.
    fn prune(&self, version: Version, keep_last_version: bool) -> Result<u64> {
        let deleted = prune_versions(self, version, keep_last_version)?;
        self.set_earliest(version + 1, false)?;
        self.metrics.record_prune(deleted);
        Ok(deleted)
    }
}

/// Versioned key-value engine over a [`KvEngine`].
pub struct MvccDb<K: KvEngine> {
    inner: Arc<Inner<K>>,
    wal: Option<Wal<ChangelogEntry>>,
    pipeline: Mutex<Pipeline>,
    /// Keeps WAL order identical to queue order
    submit_lock: Mutex<()>,
    collector: Mutex<Option<MetricsCollector>>,
    pruner: Mutex<Option<PruningManager>>,
    config: StateStoreConfig,
    name: String,
    closed: AtomicBool,
}

impl MvccDb<FjallEngine> {
    /// Open (or create) a fjall-backed engine rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, options: MvccOptions) -> Result<Self> {
        let dir = dir.as_ref();
        options.config.validate()?;
        let kv = FjallEngine::open(&dir.join(DATA_DIR))?;
        Self::with_engine(kv, Some(&dir.join(CHANGELOG_DIR)), options)
    }
}

impl MvccDb<MemoryEngine> {
    /// Volatile engine without a changelog.
    pub fn in_memory(options: MvccOptions) -> Result<Self> {
        Self::with_engine(MemoryEngine::new(), None, options)
    }
}

impl<K: KvEngine> MvccDb<K> {
    /// Build an engine over `kv`, with a changelog WAL in `changelog_dir`
    /// when given.
    pub fn with_engine(kv: K, changelog_dir: Option<&Path>, options: MvccOptions) -> Result<Self> {
        let MvccOptions {
            config,
            supervisor,
            name,
        } = options;
        config.validate()?;

        let latest = match kv.get(LATEST_VERSION_KEY)? {
            Some(raw) => decode_meta_version(&raw)?,
            None => 0,
        };
        let earliest = match kv.get(EARLIEST_VERSION_KEY)? {
            Some(raw) => decode_meta_version(&raw)?,
            None => 0,
        };

        let inner = Arc::new(Inner {
            kv,
            latest: AtomicI64::new(latest),
            earliest: AtomicI64::new(earliest),
            dirty: DashMap::new(),
            metrics: Arc::new(EngineMetrics::default()),
            supervisor,
            fatal: Mutex::new(None),
            write_lock: Mutex::new(()),
        });

        let wal = match changelog_dir {
            Some(dir) => {
                let wal_config = WalConfig::new()
                    .with_keep_recent(config.wal_keep_recent(), config.prune_interval());
                let wal: Wal<ChangelogEntry> = Wal::open(dir, wal_config)?;
                recover_from_wal(&wal, latest, |e| e.version, |e| {
                    inner.apply(e.version, &e.changesets)
                })?;
                Some(wal)
            }
            None => None,
        };

        let mut pipeline = Pipeline::default();
        if config.async_write_buffer > 0 {
            let (tx, rx) = mpsc::sync_channel(config.async_write_buffer as usize);
            let applier_inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("{}-applier", name))
                .spawn(move || applier_loop(applier_inner, rx))?;
            pipeline.queue = Some(tx);
            pipeline.applier = Some(handle);
        }

        let collector = if config.metrics_interval_seconds > 0 {
            Some(MetricsCollector::spawn(
                name.clone(),
                Arc::clone(&inner.metrics),
                Duration::from_secs(config.metrics_interval_seconds),
            )?)
        } else {
            None
        };

        let pruner = if config.keep_recent > 0 {
            let prune_inner = Arc::clone(&inner);
            let keep_recent = config.keep_recent;
            let keep_last_version = config.keep_last_version;
            let label = name.clone();
            Some(PruningManager::spawn(name.clone(), config.prune_interval(), move || {
                prune_inner.check_healthy()?;
                if let Some(target) = prune_target(prune_inner.latest(), keep_recent) {
                    let deleted = prune_inner.prune(target, keep_last_version)?;
                    info!(store = %label, target, deleted, "pruned MVCC engine");
                }
                Ok(())
            })?)
        } else {
            None
        };

        info!(
            store = %name,
            backend = inner.kv.name(),
            latest = inner.latest(),
            earliest = inner.earliest(),
            "opened MVCC engine"
        );

        Ok(MvccDb {
            inner,
            wal,
            pipeline: Mutex::new(pipeline),
            submit_lock: Mutex::new(()),
            collector: Mutex::new(collector),
            pruner: Mutex::new(pruner),
            config,
            name,
            closed: AtomicBool::new(false),
        })
    }

    /// Store settings.
    pub fn config(&self) -> &StateStoreConfig {
        &self.config
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Last written version of `namespace`, if it was written since open.
    pub fn dirty_version(&self, namespace: &str) -> Option<Version> {
        self.inner.dirty.get(namespace).map(|v| *v)
    }

    /// The changelog WAL, when the engine has one.
    pub fn changelog(&self) -> Option<&Wal<ChangelogEntry>> {
        self.wal.as_ref()
    }

    /// Underlying engine.
    pub fn engine(&self) -> &K {
        &self.inner.kv
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("MVCC engine"));
        }
        self.inner.check_healthy()
    }

    fn build_iterator(
        &self,
        namespace: &str,
        version: Version,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Result<DbIterator<'_>> {
        if start.map_or(false, |s| s.is_empty()) || end.map_or(false, |e| e.is_empty()) {
            return Err(Error::KeyEmpty);
        }
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(Error::StartAfterEnd);
            }
        }
        if version < self.inner.earliest() {
            return Ok(Box::new(std::iter::empty()));
        }

        let ns_prefix = namespace_prefix(namespace);
        let lower = match start {
            Some(s) => Bound::Included(with_version(key_prefix(namespace, s), 0)),
            None => Bound::Included(ns_prefix.clone()),
        };
        let upper = match end {
            Some(e) => Bound::Excluded(with_version(key_prefix(namespace, e), 0)),
            None => prefix_upper_bound(&ns_prefix),
        };

        let raw = self.inner.kv.range(lower, upper);
        Ok(Box::new(MvccIterator::new(raw, ns_prefix.len(), version, reverse)))
    }
}

fn applier_loop<K: KvEngine>(inner: Arc<Inner<K>>, rx: Receiver<ApplyMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            ApplyMsg::Barrier(done) => {
                let _ = done.send(());
            }
            ApplyMsg::Changeset(entry) => {
                inner.metrics.add_pending(-1);
                if inner.fatal.lock().is_some() {
                    continue;
                }
                if let Err(e) = inner.apply(entry.version, &entry.changesets) {
                    inner.poison(FatalError::new(
                        "mvcc-applier",
                        format!("applying version {}: {}", entry.version, e),
                    ));
                }
            }
        }
    }
    debug!("MVCC applier stopped");
}

impl<K: KvEngine> StateStore for MvccDb<K> {
    fn get(&self, namespace: &str, version: Version, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(namespace, version, key)
    }

    fn lookup(&self, namespace: &str, version: Version, key: &[u8]) -> Result<Lookup> {
        self.inner.lookup(namespace, version, key)
    }

    fn iterator<'a>(
        &'a self,
        namespace: &str,
        version: Version,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<DbIterator<'a>> {
        self.build_iterator(namespace, version, start, end, false)
    }

    fn reverse_iterator<'a>(
        &'a self,
        namespace: &str,
        version: Version,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<DbIterator<'a>> {
        self.build_iterator(namespace, version, start, end, true)
    }

    fn raw_iterate(
        &self,
        namespace: &str,
        f: &mut dyn FnMut(&[u8], &[u8], Version) -> bool,
    ) -> Result<bool> {
        let ns_prefix = namespace_prefix(namespace);
        let upper = prefix_upper_bound(&ns_prefix);
        for item in self
            .inner
            .kv
            .range(Bound::Included(ns_prefix.clone()), upper)
        {
            let (raw_key, raw_value) = item?;
            let (key, version) = decode_user_key(&raw_key[ns_prefix.len()..])?;
            let (value, tombstone) = decode_value(&raw_value)?;
            if tombstone > 0 {
                continue;
            }
            if f(&key, value, version) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn latest_version(&self) -> Version {
        self.inner.latest()
    }

    fn set_latest_version(&self, version: Version) -> Result<()> {
        self.check_open()?;
        self.inner.set_latest(version)
    }

    fn earliest_version(&self) -> Version {
        self.inner.earliest()
    }

    fn set_earliest_version(&self, version: Version, ignore_version: bool) -> Result<()> {
        self.check_open()?;
        self.inner.set_earliest(version, ignore_version)
    }

    fn apply_changeset_sync(&self, version: Version, changesets: &[NamedChangeSet]) -> Result<()> {
        self.check_open()?;
        self.inner.apply(version, changesets)
    }

    fn apply_changeset_async(
        &self,
        version: Version,
        changesets: Vec<NamedChangeSet>,
    ) -> Result<()> {
        self.check_open()?;
        if version < 0 {
            return Err(Error::InvalidVersion(version));
        }
        let entry = ChangelogEntry::new(version, changesets);

        let _submit = self.submit_lock.lock();
        if let Some(wal) = &self.wal {
            wal.write(&entry)?;
        }
        let queue = self.pipeline.lock().queue.clone();
        match queue {
            Some(tx) => {
                self.inner.metrics.add_pending(1);
                tx.send(ApplyMsg::Changeset(entry)).map_err(|_| {
                    self.inner.metrics.add_pending(-1);
                    Error::Closed("MVCC applier")
                })
            }
            None => self.inner.apply(entry.version, &entry.changesets),
        }
    }

    fn wait_for_pending_writes(&self) -> Result<()> {
        let queue = self.pipeline.lock().queue.clone();
        if let Some(tx) = queue {
            let (done_tx, done_rx) = mpsc::sync_channel(1);
            tx.send(ApplyMsg::Barrier(done_tx))
                .map_err(|_| Error::Closed("MVCC applier"))?;
            done_rx
                .recv()
                .map_err(|_| Error::Closed("MVCC applier"))?;
        }
        self.inner.check_healthy()
    }

    fn prune(&self, version: Version) -> Result<()> {
        self.check_open()?;
        let started = Instant::now();
        let deleted = self.inner.prune(version, self.config.keep_last_version)?;
        info!(
            store = %self.name,
            version,
            deleted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pruned MVCC engine"
        );
        Ok(())
    }

    fn import(
        &self,
        version: Version,
        nodes: SnapshotStream<'_>,
        num_workers: usize,
    ) -> Result<()> {
        self.check_open()?;
        if version < 0 {
            return Err(Error::InvalidVersion(version));
        }
        let version = version.max(1);
        match import_nodes(&self.inner, version, nodes, num_workers) {
            Ok(imported) => {
                if version > self.inner.latest() {
                    self.inner.set_latest(version)?;
                }
                info!(store = %self.name, version, imported, "imported snapshot");
                Ok(())
            }
            Err(e) => {
                // A partial import cannot be resumed.
                let fatal = FatalError::new("mvcc-import", &e);
                self.inner.poison(fatal.clone());
                Err(fatal.into())
            }
        }
    }

    fn delete_keys_at_version(&self, namespace: &str, version: Version) -> Result<()> {
        self.check_open()?;
        let deleted = delete_at_version(&self.inner, namespace, version)?;
        debug!(store = %self.name, namespace, version, deleted, "deleted keys at version");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(mut pruner) = self.pruner.lock().take() {
            pruner.stop();
        }
        if let Some(mut collector) = self.collector.lock().take() {
            collector.stop();
        }

        let (queue, applier) = {
            let mut pipeline = self.pipeline.lock();
            (pipeline.queue.take(), pipeline.applier.take())
        };
        drop(queue);
        if let Some(handle) = applier {
            if handle.join().is_err() {
                warn!(store = %self.name, "MVCC applier thread panicked");
            }
        }

        if let Some(wal) = &self.wal {
            wal.close()?;
        }
        self.inner.kv.flush()?;
        info!(store = %self.name, latest = self.inner.latest(), "closed MVCC engine");
        Ok(())
    }
}

impl<K: KvEngine> Drop for MvccDb<K> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(store = %self.name, error = %e, "error closing MVCC engine on drop");
        }
    }
}
