//! Engine counters and the periodic metrics collector.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cumulative MVCC engine counters.
///
/// These accumulate over the lifetime of an engine and are never reset.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    gets: AtomicU64,
    get_nanos: AtomicU64,
    applies: AtomicU64,
    apply_nanos: AtomicU64,
    pairs_written: AtomicU64,
    prunes: AtomicU64,
    pruned_entries: AtomicU64,
    pending_writes: AtomicI64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Point reads served
    pub gets: u64,
    /// Nanoseconds spent in point reads
    pub get_nanos: u64,
    /// Changesets applied (sync and async)
    pub applies: u64,
    /// Nanoseconds spent applying changesets
    pub apply_nanos: u64,
    /// Pairs written by applies and imports
    pub pairs_written: u64,
    /// Completed prune runs
    pub prunes: u64,
    /// Entries deleted by pruning
    pub pruned_entries: u64,
    /// Async changesets enqueued but not yet applied
    pub pending_writes: i64,
}

impl EngineMetrics {
    /// Record a point read that started at `started`.
    pub fn record_get(&self, started: Instant) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.get_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record an applied changeset of `pairs` pairs.
    pub fn record_apply(&self, started: Instant, pairs: usize) {
        self.applies.fetch_add(1, Ordering::Relaxed);
        self.apply_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.pairs_written.fetch_add(pairs as u64, Ordering::Relaxed);
    }

    /// Record imported pairs.
    pub fn record_import(&self, pairs: u64) {
        self.pairs_written.fetch_add(pairs, Ordering::Relaxed);
    }

    /// Record a finished prune run.
    pub fn record_prune(&self, deleted: u64) {
        self.prunes.fetch_add(1, Ordering::Relaxed);
        self.pruned_entries.fetch_add(deleted, Ordering::Relaxed);
    }

    /// Adjust the async queue gauge.
    pub fn add_pending(&self, delta: i64) {
        self.pending_writes.fetch_add(delta, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            get_nanos: self.get_nanos.load(Ordering::Relaxed),
            applies: self.applies.load(Ordering::Relaxed),
            apply_nanos: self.apply_nanos.load(Ordering::Relaxed),
            pairs_written: self.pairs_written.load(Ordering::Relaxed),
            prunes: self.prunes.load(Ordering::Relaxed),
            pruned_entries: self.pruned_entries.load(Ordering::Relaxed),
            pending_writes: self.pending_writes.load(Ordering::Relaxed),
        }
    }
}

/// Background loop that logs a metrics snapshot every interval.
pub struct MetricsCollector {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MetricsCollector {
    /// Start collecting `metrics` for the store labelled `store`.
    pub fn spawn(
        store: String,
        metrics: Arc<EngineMetrics>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("versiondb-metrics".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let s = metrics.snapshot();
                        debug!(
                            target: "versiondb::metrics",
                            store = %store,
                            gets = s.gets,
                            avg_get_ns = s.get_nanos.checked_div(s.gets).unwrap_or(0),
                            applies = s.applies,
                            avg_apply_ns = s.apply_nanos.checked_div(s.applies).unwrap_or(0),
                            pairs_written = s.pairs_written,
                            prunes = s.prunes,
                            pruned_entries = s.pruned_entries,
                            pending_writes = s.pending_writes,
                            "engine metrics"
                        );
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(MetricsCollector {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the loop and join it. Idempotent.
    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("metrics collector thread panicked");
            }
        }
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.stop();
    }
}
