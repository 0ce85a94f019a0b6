//! Indexed, segmented append log.
//!
//! `SegmentLog` is the untyped storage under [`crate::wal::Wal`]. Records are
//! addressed by a dense index starting at 1. The log keeps the byte position
//! of every record in memory, so random reads are one seek and truncation at
//! either end touches at most one segment file.
//!
//! Only the tail segment is ever appended to. A corrupted or torn record ends
//! the log: on open, the segment holding it is truncated to the last valid
//! record and every later segment is deleted.

use crate::format::{WalRecord, WalSegment, SEGMENT_HEADER_SIZE};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use versiondb_core::{Error, Result};

const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug)]
struct SegmentMeta {
    first_index: u64,
    path: PathBuf,
    /// Absolute byte position of each record, in index order
    positions: Vec<u64>,
    /// End of the last valid record
    end: u64,
}

impl SegmentMeta {
    fn len(&self) -> u64 {
        self.positions.len() as u64
    }

    /// Index one past the last record.
    fn next_index(&self) -> u64 {
        self.first_index + self.len()
    }

    fn contains(&self, index: u64) -> bool {
        index >= self.first_index && index < self.next_index()
    }

    /// Byte span `(position, length)` of a record in this segment.
    fn span(&self, index: u64) -> (u64, usize) {
        let slot = (index - self.first_index) as usize;
        let pos = self.positions[slot];
        let end = self.positions.get(slot + 1).copied().unwrap_or(self.end);
        (pos, (end - pos) as usize)
    }
}

/// Segmented log of opaque payloads.
pub struct SegmentLog {
    dir: PathBuf,
    log_uuid: [u8; 16],
    segment_size: u64,
    /// Ordered; never empty; the last one is `active`
    segments: Vec<SegmentMeta>,
    active: WalSegment,
    next_index: u64,
}

impl SegmentLog {
    /// Open (or create) the log in `dir`, repairing a corrupted tail.
    pub fn open(dir: &Path, segment_size: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(TMP_SUFFIX) {
                debug!(file = name, "removing leftover WAL temp file");
                fs::remove_file(entry.path())?;
                continue;
            }
            if let Some(first) = WalSegment::parse_segment_name(name) {
                found.push((first, entry.path()));
            }
        }
        found.sort();

        let mut segments: Vec<SegmentMeta> = Vec::new();
        let mut active: Option<WalSegment> = None;
        let mut log_uuid = None;
        let mut truncated = false;

        for (first, path) in &found {
            if truncated {
                warn!(path = %path.display(), "removing WAL segment after corrupted record");
                fs::remove_file(path)?;
                continue;
            }

            let mut segment = match WalSegment::open(path) {
                Ok(s) if s.header().first_index == *first => s,
                Ok(_) | Err(_) => {
                    warn!(path = %path.display(), "removing WAL segment with unreadable header");
                    fs::remove_file(path)?;
                    truncated = true;
                    continue;
                }
            };
            log_uuid.get_or_insert(segment.header().log_uuid);

            // An interrupted front truncation leaves the original segment next
            // to its rewritten suffix; the suffix wins.
            if let Some(prev) = segments.last() {
                if *first < prev.next_index() {
                    info!(path = %prev.path.display(), "dropping segment superseded by front truncation");
                    fs::remove_file(&prev.path)?;
                    segments.pop();
                } else if *first > prev.next_index() {
                    return Err(Error::Corruption(format!(
                        "WAL gap: segment {} starts at {}, expected {}",
                        path.display(),
                        first,
                        prev.next_index()
                    )));
                }
            }

            let body = segment.read_body()?;
            let (positions, end, problem) = scan_records(&body, *first);
            if let Some(reason) = problem {
                warn!(
                    path = %path.display(),
                    valid_end = end,
                    reason = %reason,
                    "truncating corrupted WAL tail"
                );
                segment.truncate(end)?;
                truncated = true;
            }

            segments.push(SegmentMeta {
                first_index: *first,
                path: path.clone(),
                positions,
                end,
            });
            active = Some(segment);
        }

        let log_uuid = log_uuid.unwrap_or_else(|| *uuid::Uuid::new_v4().as_bytes());

        let (active, next_index) = match (active, segments.last()) {
            (Some(active), Some(last)) if active.path() == last.path => {
                let next = last.next_index();
                (active, next)
            }
            (_, Some(last)) => {
                let next = last.next_index();
                (WalSegment::open(&last.path)?, next)
            }
            (_, None) => {
                let first = found.first().map(|(first, _)| *first).unwrap_or(1).max(1);
                let segment = WalSegment::create(dir, first, log_uuid)?;
                segments.push(SegmentMeta {
                    first_index: first,
                    path: segment.path().to_path_buf(),
                    positions: Vec::new(),
                    end: SEGMENT_HEADER_SIZE as u64,
                });
                (segment, first)
            }
        };

        let log = SegmentLog {
            dir: dir.to_path_buf(),
            log_uuid,
            segment_size,
            segments,
            active,
            next_index,
        };
        debug!(
            dir = %dir.display(),
            first = log.first_index(),
            last = log.last_index(),
            "opened WAL"
        );
        Ok(log)
    }

    /// Whether the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.positions.is_empty())
    }

    /// Index of the first record, 0 when empty.
    pub fn first_index(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.segments[0].first_index
        }
    }

    /// Index of the last record, 0 when empty.
    pub fn last_index(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.next_index - 1
        }
    }

    /// Append a payload at `last_index + 1`, returning its index.
    pub fn append(&mut self, payload: Vec<u8>) -> Result<u64> {
        if self.active.size() >= self.segment_size && !self.tail().positions.is_empty() {
            self.rotate()?;
        }

        let index = self.next_index;
        let bytes = WalRecord::new(index, payload).to_bytes();
        let pos = self.active.size();
        self.active.write(&bytes)?;

        let tail = self.tail_mut();
        tail.positions.push(pos);
        tail.end = pos + bytes.len() as u64;
        self.next_index += 1;
        Ok(index)
    }

    /// fsync the active segment.
    pub fn sync(&mut self) -> Result<()> {
        self.active.sync()?;
        Ok(())
    }

    /// Read one record's payload.
    pub fn read(&self, index: u64) -> Result<Vec<u8>> {
        let meta = self.locate(index)?;
        let (pos, len) = meta.span(index);
        let mut file = File::open(&meta.path)?;
        file.seek(SeekFrom::Start(pos))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        decode_at(&buf, index)
    }

    /// Read records `from..=to`, stopping at the end of the segment holding
    /// `from`. Returns an empty vector when `from > to`.
    pub fn read_chunk(&self, from: u64, to: u64) -> Result<Vec<WalRecord>> {
        if from > to {
            return Ok(Vec::new());
        }
        let meta = self.locate(from)?;
        let last = to.min(meta.next_index() - 1);
        let (start, _) = meta.span(from);
        let (end_pos, end_len) = meta.span(last);

        let mut file = File::open(&meta.path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end_pos - start) as usize + end_len];
        file.read_exact(&mut buf)?;

        let mut records = Vec::with_capacity((last - from + 1) as usize);
        let mut offset = 0;
        for index in from..=last {
            let (record, consumed) = WalRecord::from_bytes(&buf[offset..])
                .map_err(|e| Error::Corruption(format!("WAL record {}: {}", index, e)))?;
            if record.index != index {
                return Err(Error::Corruption(format!(
                    "WAL record {} found at slot {}",
                    record.index, index
                )));
            }
            offset += consumed;
            records.push(record);
        }
        Ok(records)
    }

    /// Remove every record with index `< index`.
    pub fn truncate_front(&mut self, index: u64) -> Result<()> {
        if self.is_empty() || index <= self.first_index() {
            return Ok(());
        }
        if index > self.last_index() {
            let next = self.next_index;
            return self.reset(next);
        }

        while self.segments[0].next_index() <= index {
            let meta = self.segments.remove(0);
            fs::remove_file(&meta.path)?;
        }

        if self.segments[0].first_index < index {
            self.rewrite_front(index)?;
        }
        debug!(first = index, "truncated WAL front");
        Ok(())
    }

    /// Remove every record with index `> index`. The next append gets
    /// `index + 1`.
    pub fn truncate_back(&mut self, index: u64) -> Result<()> {
        if self.is_empty() || index >= self.last_index() {
            return Ok(());
        }
        if index < self.first_index() {
            return self.reset(index + 1);
        }

        while self.tail().first_index > index {
            if let Some(meta) = self.segments.pop() {
                fs::remove_file(&meta.path)?;
            }
        }

        let tail = self.tail();
        let keep = (index - tail.first_index + 1) as usize;
        let cut = tail.positions.get(keep).copied().unwrap_or(tail.end);
        let path = tail.path.clone();

        let mut active = WalSegment::open(&path)?;
        active.truncate(cut)?;
        self.active = active;

        let tail = self.tail_mut();
        tail.positions.truncate(keep);
        tail.end = cut;
        self.next_index = index + 1;
        debug!(last = index, "truncated WAL back");
        Ok(())
    }

    /// Sync and release the active segment.
    pub fn close(&mut self) -> Result<()> {
        self.active.sync()?;
        Ok(())
    }

    fn tail(&self) -> &SegmentMeta {
        &self.segments[self.segments.len() - 1]
    }

    fn tail_mut(&mut self) -> &mut SegmentMeta {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    fn locate(&self, index: u64) -> Result<&SegmentMeta> {
        let slot = self
            .segments
            .partition_point(|s| s.first_index <= index)
            .checked_sub(1);
        slot.map(|i| &self.segments[i])
            .filter(|s| s.contains(index))
            .ok_or_else(|| {
                Error::Corruption(format!(
                    "WAL offset {} out of range [{}, {}]",
                    index,
                    self.first_index(),
                    self.last_index()
                ))
            })
    }

    fn rotate(&mut self) -> Result<()> {
        self.active.sync()?;
        let segment = WalSegment::create(&self.dir, self.next_index, self.log_uuid)?;
        debug!(first = self.next_index, "rotated WAL segment");
        self.segments.push(SegmentMeta {
            first_index: self.next_index,
            path: segment.path().to_path_buf(),
            positions: Vec::new(),
            end: SEGMENT_HEADER_SIZE as u64,
        });
        self.active = segment;
        Ok(())
    }

    /// Rewrite the first segment so that it starts at `index`.
    fn rewrite_front(&mut self, index: u64) -> Result<()> {
        let is_tail = self.segments.len() == 1;
        let meta = &self.segments[0];
        let (cut, _) = meta.span(index);

        let mut old = File::open(&meta.path)?;
        old.seek(SeekFrom::Start(cut))?;
        let mut suffix = Vec::new();
        old.read_to_end(&mut suffix)?;
        suffix.truncate((meta.end - cut) as usize);

        let final_path = WalSegment::segment_path(&self.dir, index);
        let tmp_path = self
            .dir
            .join(format!("wal-{:020}.seg{}", index, TMP_SUFFIX));
        let mut rewritten = WalSegment::create_at(tmp_path.clone(), index, self.log_uuid)?;
        rewritten.write(&suffix)?;
        rewritten.sync()?;
        drop(rewritten);
        fs::rename(&tmp_path, &final_path)?;
        fs::remove_file(&meta.path)?;

        let shift = cut - SEGMENT_HEADER_SIZE as u64;
        let skip = (index - meta.first_index) as usize;
        let positions = meta.positions[skip..].iter().map(|p| p - shift).collect();
        let end = meta.end - shift;

        self.segments[0] = SegmentMeta {
            first_index: index,
            path: final_path.clone(),
            positions,
            end,
        };
        if is_tail {
            self.active = WalSegment::open(&final_path)?;
        }
        Ok(())
    }

    /// Drop every segment and start empty at `next`.
    fn reset(&mut self, next: u64) -> Result<()> {
        for meta in self.segments.drain(..) {
            fs::remove_file(&meta.path)?;
        }
        let next = next.max(1);
        let segment = WalSegment::create(&self.dir, next, self.log_uuid)?;
        sync_dir(&self.dir);
        self.segments.push(SegmentMeta {
            first_index: next,
            path: segment.path().to_path_buf(),
            positions: Vec::new(),
            end: SEGMENT_HEADER_SIZE as u64,
        });
        self.active = segment;
        self.next_index = next;
        debug!(next, "reset WAL");
        Ok(())
    }
}

/// Walk a segment body, returning record positions, the end of the valid
/// prefix and the reason the walk stopped early (if it did).
fn scan_records(body: &[u8], first_index: u64) -> (Vec<u64>, u64, Option<String>) {
    let header = SEGMENT_HEADER_SIZE as u64;
    let mut positions = Vec::new();
    let mut offset = 0usize;
    let mut expected = first_index;

    while offset < body.len() {
        match WalRecord::from_bytes(&body[offset..]) {
            Ok((record, consumed)) => {
                if record.index != expected {
                    let reason = format!("record index {} where {} expected", record.index, expected);
                    return (positions, header + offset as u64, Some(reason));
                }
                positions.push(header + offset as u64);
                offset += consumed;
                expected += 1;
            }
            Err(e) => return (positions, header + offset as u64, Some(e.to_string())),
        }
    }
    (positions, header + offset as u64, None)
}

fn decode_at(buf: &[u8], index: u64) -> Result<Vec<u8>> {
    let (record, _) = WalRecord::from_bytes(buf)
        .map_err(|e| Error::Corruption(format!("WAL record {}: {}", index, e)))?;
    if record.index != index {
        return Err(Error::Corruption(format!(
            "WAL record {} found at slot {}",
            record.index, index
        )));
    }
    Ok(record.payload)
}

/// Best-effort directory fsync so segment creation and removal survive a
/// crash.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
