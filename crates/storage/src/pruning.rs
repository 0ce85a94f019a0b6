//! Background pruning task
//!
//! `PruningManager` wakes up every prune interval (plus a random jitter so
//! that several stores opened together do not prune in lockstep) and runs
//! a prune pass. For a state store the pass prunes everything older than
//! `latest - keep_recent`.
//!
//! Failures are logged and retried on the next tick. Shutdown drops the
//! stop channel and joins the thread; a pass in progress finishes first.

use rand::Rng;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use versiondb_core::{Result, StateStore, Version};

/// Periodic prune loop on its own thread.
pub struct PruningManager {
    name: String,
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// Version to prune up to, or `None` if nothing is old enough.
pub fn prune_target(latest: Version, keep_recent: i64) -> Option<Version> {
    let target = latest - keep_recent;
    (target > 0).then_some(target)
}

impl PruningManager {
    /// Run `pass` every `interval` (plus jitter) until stopped.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, pass: F) -> Result<Self>
    where
        F: Fn() -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_name = format!("{}-pruner", name);
        let label = name.clone();
        let handle = thread::Builder::new().name(thread_name).spawn(move || loop {
            let jitter_ms = rand::thread_rng().gen_range(0..=interval.as_millis() as u64 / 2);
            match stop_rx.recv_timeout(interval + Duration::from_millis(jitter_ms)) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = pass() {
                        warn!(store = %label, error = %e, "prune pass failed");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
        debug!(store = %name, interval_ms = interval.as_millis() as u64, "started pruner");
        Ok(PruningManager {
            name,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Prune `store` down to its newest `keep_recent` versions every
    /// `interval`.
    pub fn for_state_store(
        name: impl Into<String>,
        store: Arc<dyn StateStore>,
        keep_recent: i64,
        interval: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let label = name.clone();
        Self::spawn(name, interval, move || {
            if let Some(target) = prune_target(store.latest_version(), keep_recent) {
                info!(store = %label, target, "pruning");
                store.prune(target)?;
            }
            Ok(())
        })
    }

    /// Stop the loop and join it. Idempotent.
    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(store = %self.name, "pruner thread panicked");
            }
        }
    }
}

impl Drop for PruningManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::{MvccDb, MvccOptions};
    use versiondb_core::{ChangeSet, KvPair, NamedChangeSet, StateStoreConfig};

    #[test]
    fn test_prune_target() {
        assert_eq!(prune_target(100, 10), Some(90));
        assert_eq!(prune_target(10, 10), None);
        assert_eq!(prune_target(5, 0), Some(5));
    }

    #[test]
    fn test_manager_prunes_state_store() {
        let db = Arc::new(
            MvccDb::in_memory(MvccOptions::new(StateStoreConfig::for_testing())).unwrap(),
        );
        for v in 1..=10 {
            db.apply_changeset_sync(
                v,
                &[NamedChangeSet::new("s", ChangeSet::new(vec![KvPair::set("k", "v")]))],
            )
            .unwrap();
        }
        let store: Arc<dyn StateStore> = db.clone();
        let mut manager =
            PruningManager::for_state_store("test", store, 3, Duration::from_millis(10)).unwrap();
        for _ in 0..200 {
            if db.earliest_version() == 8 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        manager.stop();
        manager.stop();
        assert_eq!(db.earliest_version(), 8);
        assert_eq!(db.get("s", 7, b"k").unwrap(), None);
        assert_eq!(db.get("s", 8, b"k").unwrap(), Some(b"v".to_vec()));
    }
}
