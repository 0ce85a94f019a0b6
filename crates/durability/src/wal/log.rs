//! Typed write-ahead log with an optional async writer and retention pruner.
//!
//! `Wal<E>` stores entries of any serde type, MessagePack-encoded, in a
//! [`SegmentLog`]. Two background threads may run per log:
//!
//! - the writer, when `write_buffer_size > 0`: drains a bounded queue,
//!   appending up to `write_batch_size` entries per fsync;
//! - the pruner, when `keep_recent > 0`: every `prune_interval` truncates the
//!   front so that at most `keep_recent` entries remain.
//!
//! Both stop when `close()` drops the sender half of their channel.

use super::config::WalConfig;
use super::segment_log::SegmentLog;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};
use versiondb_core::{Error, Result};

/// State shared with the background threads.
struct Shared {
    log: Mutex<SegmentLog>,
    /// First async write failure, sticky
    write_error: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl Shared {
    fn check_error(&self) -> Result<()> {
        match self.write_error.lock().as_ref() {
            Some(msg) => Err(Error::WalWrite(msg.clone())),
            None => Ok(()),
        }
    }

    fn record_error(&self, err: &Error) {
        let mut slot = self.write_error.lock();
        if slot.is_none() {
            error!(error = %err, "async WAL write failed");
            *slot = Some(err.to_string());
        }
    }
}

/// Handles owned by `Wal` and released by `close()`.
#[derive(Default)]
struct Workers {
    queue: Option<SyncSender<Vec<u8>>>,
    writer: Option<JoinHandle<()>>,
    stop_pruner: Option<mpsc::Sender<()>>,
    pruner: Option<JoinHandle<()>>,
}

/// Generic write-ahead log of `E` entries.
pub struct Wal<E> {
    shared: Arc<Shared>,
    workers: Mutex<Workers>,
    dir: PathBuf,
    config: WalConfig,
    _entry: PhantomData<fn() -> E>,
}

impl<E> Wal<E>
where
    E: Serialize + DeserializeOwned,
{
    /// Open (or create) the log in `dir`.
    pub fn open(dir: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let log = SegmentLog::open(&dir, config.segment_size)?;

        let shared = Arc::new(Shared {
            log: Mutex::new(log),
            write_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let mut workers = Workers::default();

        if config.is_async() {
            let (tx, rx) = mpsc::sync_channel(config.write_buffer_size as usize);
            let writer_shared = Arc::clone(&shared);
            let batch = config.write_batch_size;
            let handle = thread::Builder::new()
                .name("wal-writer".to_string())
                .spawn(move || writer_loop(writer_shared, rx, batch))?;
            workers.queue = Some(tx);
            workers.writer = Some(handle);
        }

        if config.keep_recent > 0 {
            let (stop_tx, stop_rx) = mpsc::channel();
            let pruner_shared = Arc::clone(&shared);
            let keep = config.keep_recent;
            let interval = config.prune_interval;
            let handle = thread::Builder::new()
                .name("wal-pruner".to_string())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => prune_front(&pruner_shared, keep),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                })?;
            workers.stop_pruner = Some(stop_tx);
            workers.pruner = Some(handle);
        }

        Ok(Wal {
            shared,
            workers: Mutex::new(workers),
            dir,
            config,
            _entry: PhantomData,
        })
    }

    /// Directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configuration the log was opened with.
    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Append an entry.
    ///
    /// Synchronous logs append and fsync before returning. Async logs return
    /// once the entry is queued; a failure of an earlier async write is
    /// returned here instead.
    pub fn write(&self, entry: &E) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("WAL"));
        }
        self.shared.check_error()?;

        let bytes = rmp_serde::to_vec(entry).map_err(|e| Error::Serialization(e.to_string()))?;

        let queue = self.workers.lock().queue.clone();
        match queue {
            Some(tx) => tx.send(bytes).map_err(|_| Error::Closed("WAL")),
            None if self.config.is_async() => Err(Error::Closed("WAL")),
            None => {
                let mut log = self.shared.log.lock();
                log.append(bytes)?;
                log.sync()
            }
        }
    }

    /// First failure of the async writer, if any.
    pub fn check_error(&self) -> Result<()> {
        self.shared.check_error()
    }

    /// Read the entry at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<E> {
        let payload = self.shared.log.lock().read(offset)?;
        decode(&payload, offset)
    }

    /// Offset of the first entry, 0 when empty.
    pub fn first_offset(&self) -> u64 {
        self.shared.log.lock().first_index()
    }

    /// Offset of the last entry, 0 when empty.
    pub fn last_offset(&self) -> u64 {
        self.shared.log.lock().last_index()
    }

    /// Decode entries `start..=end` in order and pass them to `f`.
    ///
    /// The range is clamped to the log's current bounds. The log lock is
    /// released while `f` runs, so `f` may write to or truncate this log.
    /// An error from `f` stops the replay and is returned.
    pub fn replay<F>(&self, start: u64, end: u64, mut f: F) -> Result<()>
    where
        F: FnMut(u64, E) -> Result<()>,
    {
        let mut cursor = start.max(self.first_offset());
        loop {
            let chunk = {
                let log = self.shared.log.lock();
                if log.is_empty() {
                    return Ok(());
                }
                let end = end.min(log.last_index());
                cursor = cursor.max(log.first_index());
                if cursor > end {
                    return Ok(());
                }
                log.read_chunk(cursor, end)?
            };
            for record in chunk {
                cursor = record.index + 1;
                let entry = decode(&record.payload, record.index)?;
                f(record.index, entry)?;
            }
        }
    }

    /// Drop every entry before `offset`.
    pub fn truncate_before(&self, offset: u64) -> Result<()> {
        self.shared.log.lock().truncate_front(offset)
    }

    /// Drop every entry after `offset`; the next write lands at `offset + 1`.
    pub fn truncate_after(&self, offset: u64) -> Result<()> {
        self.shared.log.lock().truncate_back(offset)
    }

    /// Drain the queue, stop background threads and sync the log.
    ///
    /// Safe to call more than once. Writes racing with `close()` either land
    /// before the log is closed or fail with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Dropping the senders is the stop signal.
        workers.queue.take();
        workers.stop_pruner.take();

        if let Some(handle) = workers.writer.take() {
            if handle.join().is_err() {
                warn!(dir = %self.dir.display(), "WAL writer thread panicked");
            }
        }
        if let Some(handle) = workers.pruner.take() {
            if handle.join().is_err() {
                warn!(dir = %self.dir.display(), "WAL pruner thread panicked");
            }
        }

        self.shared.log.lock().close()?;
        debug!(dir = %self.dir.display(), "closed WAL");
        self.shared.check_error()
    }
}

impl<E> Drop for Wal<E> {
    fn drop(&mut self) {
        let mut workers = self.workers.lock();
        self.shared.closed.store(true, Ordering::Release);
        workers.queue.take();
        workers.stop_pruner.take();
        if let Some(handle) = workers.writer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = workers.pruner.take() {
            let _ = handle.join();
        }
    }
}

fn decode<E: DeserializeOwned>(payload: &[u8], offset: u64) -> Result<E> {
    rmp_serde::from_slice(payload)
        .map_err(|e| Error::Serialization(format!("WAL entry {}: {}", offset, e)))
}

fn writer_loop(shared: Arc<Shared>, rx: Receiver<Vec<u8>>, batch_size: usize) {
    // recv() fails only once every sender is gone and the queue is empty.
    while let Ok(first) = rx.recv() {
        let mut batch = Vec::with_capacity(batch_size);
        batch.push(first);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(bytes) => batch.push(bytes),
                Err(_) => break,
            }
        }

        if shared.write_error.lock().is_some() {
            // The log may have a gap; nothing more is appended.
            continue;
        }

        let mut log = shared.log.lock();
        let result = batch
            .into_iter()
            .try_for_each(|bytes| log.append(bytes).map(|_| ()))
            .and_then(|()| log.sync());
        drop(log);

        if let Err(e) = result {
            shared.record_error(&e);
        }
    }
}

fn prune_front(shared: &Shared, keep_recent: u64) {
    let mut log = shared.log.lock();
    if log.is_empty() {
        return;
    }
    let (first, last) = (log.first_index(), log.last_index());
    if last - first + 1 <= keep_recent {
        return;
    }
    let new_first = last - keep_recent + 1;
    match log.truncate_front(new_first) {
        Ok(()) => debug!(from = first, to = new_first, "pruned WAL front"),
        Err(e) => warn!(error = %e, "WAL front truncation failed"),
    }
}
