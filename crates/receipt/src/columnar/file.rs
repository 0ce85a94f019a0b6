//! Column file format.
//!
//! Files are named `receipts_<start>.col` / `logs_<start>.col` where
//! `<start>` is the first block written to the pair.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Header (15 bytes)                    │
//! ├──────────────────────────────────────┤
//! │ Chunk 0                              │
//! ├──────────────────────────────────────┤
//! │ ...                                  │
//! ├──────────────────────────────────────┤
//! │ Footer (33 bytes, sealed files only) │
//! └──────────────────────────────────────┘
//! ```
//!
//! # Chunk Layout
//!
//! ```text
//! ┌────────┬─────────┬──────────┬─────────┬─────────┬────────────┬──────────┬──────────────────────────┐
//! │ Tag (1)│ Len (4) │ Rows (4) │ Min (8) │ Max (8) │ Bloom (256)│ xxh3 (8) │ zstd(msgpack(columns))   │
//! └────────┴─────────┴──────────┴─────────┴─────────┴────────────┴──────────┴──────────────────────────┘
//! ```
//!
//! Min/max are the chunk's block range. The checksum covers the compressed
//! payload. Every chunk is fsynced when written; a file without a footer is
//! still being written, or was abandoned by a crash.

use crate::bloom::{Bloom, BLOOM_BYTES};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use versiondb_core::{Error, Result};
use xxhash_rust::xxh3::xxh3_64;

/// Magic bytes identifying a column file: "VDBC"
pub const COLUMN_MAGIC: [u8; 4] = *b"VDBC";

/// Current column file format version
pub const COLUMN_FORMAT_VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 4 + 2 + 1 + 8;

/// Chunk header size in bytes (everything before the payload)
pub const CHUNK_HEADER_SIZE: usize = 1 + 4 + 4 + 8 + 8 + BLOOM_BYTES + 8;

/// Footer size in bytes
pub const FOOTER_SIZE: usize = 1 + 4 + 8 + 8 + 8 + 4;

const CHUNK_TAG: u8 = 0xC1;
const FOOTER_TAG: u8 = 0xF5;
const ZSTD_LEVEL: i32 = 3;
const MAX_CHUNK_LEN: u32 = 256 * 1024 * 1024;

/// What a column file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// One row per receipt
    Receipts,
    /// One row per log
    Logs,
}

impl FileKind {
    fn tag(self) -> u8 {
        match self {
            FileKind::Receipts => 1,
            FileKind::Logs => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FileKind::Receipts),
            2 => Some(FileKind::Logs),
            _ => None,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            FileKind::Receipts => "receipts",
            FileKind::Logs => "logs",
        }
    }
}

/// File name for `kind` starting at `start_block`.
pub fn file_name(kind: FileKind, start_block: u64) -> String {
    format!("{}_{}.col", kind.prefix(), start_block)
}

/// Inverse of [`file_name`].
pub fn parse_file_name(name: &str) -> Option<(FileKind, u64)> {
    let stem = name.strip_suffix(".col")?;
    let (prefix, start) = stem.split_once('_')?;
    let kind = [FileKind::Receipts, FileKind::Logs]
        .into_iter()
        .find(|k| k.prefix() == prefix)?;
    Some((kind, start.parse().ok()?))
}

/// Location and summary of one chunk.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    /// Offset of the compressed payload
    pub offset: u64,
    /// Payload length
    pub len: u32,
    /// Rows in the chunk
    pub rows: u32,
    /// Lowest block in the chunk
    pub min_block: u64,
    /// Highest block in the chunk
    pub max_block: u64,
    /// Bloom over the chunk's lookup keys
    pub bloom: Bloom,
    /// xxh3 of the payload
    pub checksum: u64,
}

impl ChunkMeta {
    /// Whether the chunk may hold rows of blocks `from..=to`.
    pub fn overlaps(&self, from: u64, to: u64) -> bool {
        self.min_block <= to && self.max_block >= from
    }
}

/// Summary written when a file is sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileFooter {
    /// Chunks in the file
    pub chunks: u32,
    /// Rows over all chunks
    pub rows: u64,
    /// Lowest block in the file
    pub min_block: u64,
    /// Highest block in the file
    pub max_block: u64,
}

impl FileFooter {
    fn to_bytes(self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0] = FOOTER_TAG;
        buf[1..5].copy_from_slice(&self.chunks.to_le_bytes());
        buf[5..13].copy_from_slice(&self.rows.to_le_bytes());
        buf[13..21].copy_from_slice(&self.min_block.to_le_bytes());
        buf[21..29].copy_from_slice(&self.max_block.to_le_bytes());
        buf[29..33].copy_from_slice(&COLUMN_MAGIC);
        buf
    }

    fn from_bytes(buf: &[u8; FOOTER_SIZE]) -> Option<Self> {
        if buf[0] != FOOTER_TAG || buf[29..33] != COLUMN_MAGIC {
            return None;
        }
        Some(FileFooter {
            chunks: u32::from_le_bytes(buf[1..5].try_into().ok()?),
            rows: u64::from_le_bytes(buf[5..13].try_into().ok()?),
            min_block: u64::from_le_bytes(buf[13..21].try_into().ok()?),
            max_block: u64::from_le_bytes(buf[21..29].try_into().ok()?),
        })
    }
}

fn encode_payload<T: Serialize>(columns: &T) -> Result<Vec<u8>> {
    let raw = rmp_serde::to_vec(columns).map_err(|e| Error::Serialization(e.to_string()))?;
    let mut encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    let mut decoder = zstd::Decoder::new(payload)?;
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    rmp_serde::from_slice(&raw).map_err(|e| Error::Serialization(e.to_string()))
}

// ============================================================================
// Writer
// ============================================================================

/// Appends chunks to one column file.
pub struct ColumnWriter {
    out: BufWriter<File>,
    path: PathBuf,
    kind: FileKind,
    start_block: u64,
    footer: FileFooter,
}

impl ColumnWriter {
    /// Create (or truncate) the `kind` file for `start_block` in `dir`.
    pub fn create(dir: &Path, kind: FileKind, start_block: u64) -> Result<Self> {
        let path = dir.join(file_name(kind, start_block));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&COLUMN_MAGIC)?;
        out.write_all(&COLUMN_FORMAT_VERSION.to_le_bytes())?;
        out.write_all(&[kind.tag()])?;
        out.write_all(&start_block.to_le_bytes())?;
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(ColumnWriter {
            out,
            path,
            kind,
            start_block,
            footer: FileFooter::default(),
        })
    }

    /// Path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File kind.
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// First block of the file.
    pub fn start_block(&self) -> u64 {
        self.start_block
    }

    /// Append one chunk of `rows` rows covering blocks `min..=max` and sync.
    pub fn write_chunk<T: Serialize>(
        &mut self,
        columns: &T,
        rows: u32,
        min_block: u64,
        max_block: u64,
        bloom: &Bloom,
    ) -> Result<()> {
        let payload = encode_payload(columns)?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_CHUNK_LEN)
            .ok_or_else(|| Error::Corruption(format!("chunk of {} bytes too large", payload.len())))?;

        self.out.write_all(&[CHUNK_TAG])?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(&rows.to_le_bytes())?;
        self.out.write_all(&min_block.to_le_bytes())?;
        self.out.write_all(&max_block.to_le_bytes())?;
        self.out.write_all(bloom.as_bytes())?;
        self.out.write_all(&xxh3_64(&payload).to_le_bytes())?;
        self.out.write_all(&payload)?;
        self.out.flush()?;
        self.out.get_ref().sync_data()?;

        let footer = &mut self.footer;
        footer.min_block = if footer.chunks == 0 {
            min_block
        } else {
            footer.min_block.min(min_block)
        };
        footer.max_block = footer.max_block.max(max_block);
        footer.chunks += 1;
        footer.rows += rows as u64;
        Ok(())
    }

    /// Write the footer and sync. The file is immutable afterwards.
    pub fn seal(mut self) -> Result<FileFooter> {
        self.out.write_all(&self.footer.to_bytes())?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.footer)
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Parsed layout of a column file.
#[derive(Debug, Clone)]
pub struct ColumnFile {
    /// File path
    pub path: PathBuf,
    /// File kind
    pub kind: FileKind,
    /// First block of the file
    pub start_block: u64,
    /// Chunks in write order
    pub chunks: Vec<ChunkMeta>,
    /// Present once the file is sealed
    pub footer: Option<FileFooter>,
}

fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> io::Result<bool> {
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

impl ColumnFile {
    /// Scan the chunk headers of `path`.
    ///
    /// A torn trailing chunk ends the scan; such a file reports no footer.
    /// A file that ends in a footer but cannot be scanned up to it is
    /// [`Error::Corruption`].
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut header = [0u8; HEADER_SIZE];
        if !read_exact_or_eof(&mut file, &mut header)? || header[0..4] != COLUMN_MAGIC {
            return Err(Error::Corruption(format!(
                "{} is not a column file",
                path.display()
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != COLUMN_FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "{}: unsupported format version {}",
                path.display(),
                version
            )));
        }
        let kind = FileKind::from_tag(header[6])
            .ok_or_else(|| Error::Corruption(format!("{}: unknown kind", path.display())))?;
        let mut start = [0u8; 8];
        start.copy_from_slice(&header[7..15]);
        let start_block = u64::from_le_bytes(start);

        let mut chunks = Vec::new();
        let mut footer = None;
        let mut pos = HEADER_SIZE as u64;
        loop {
            let mut tag = [0u8; 1];
            if !read_exact_or_eof(&mut file, &mut tag)? {
                break;
            }
            match tag[0] {
                CHUNK_TAG => {
                    let mut rest = [0u8; CHUNK_HEADER_SIZE - 1];
                    if !read_exact_or_eof(&mut file, &mut rest)? {
                        break;
                    }
                    let meta = parse_chunk_header(&rest, pos + CHUNK_HEADER_SIZE as u64)?;
                    let end = meta.offset + meta.len as u64;
                    if end > file_len {
                        break;
                    }
                    file.seek(SeekFrom::Start(end))?;
                    pos = end;
                    chunks.push(meta);
                }
                FOOTER_TAG => {
                    let mut buf = [0u8; FOOTER_SIZE];
                    buf[0] = FOOTER_TAG;
                    if !read_exact_or_eof(&mut file, &mut buf[1..])? {
                        break;
                    }
                    footer = FileFooter::from_bytes(&buf)
                        .filter(|f| f.chunks as usize == chunks.len());
                    break;
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "{}: unexpected tag {:#04x} at offset {}",
                        path.display(),
                        other,
                        pos
                    )));
                }
            }
        }

        if footer.is_none() && file_len >= (HEADER_SIZE + FOOTER_SIZE) as u64 {
            // A footer at the end that the scan never reached means a damaged
            // sealed file, not an interrupted write.
            let mut tail = [0u8; FOOTER_SIZE];
            file.seek(SeekFrom::Start(file_len - FOOTER_SIZE as u64))?;
            file.read_exact(&mut tail)?;
            if FileFooter::from_bytes(&tail).is_some() {
                return Err(Error::Corruption(format!(
                    "{}: sealed file has a damaged chunk index",
                    path.display()
                )));
            }
        }

        Ok(ColumnFile {
            path: path.to_path_buf(),
            kind,
            start_block,
            chunks,
            footer,
        })
    }

    /// Whether the file carries a valid footer.
    pub fn is_sealed(&self) -> bool {
        self.footer.is_some()
    }

    /// Decode one chunk, verifying its checksum.
    pub fn read_chunk<T: DeserializeOwned>(&self, meta: &ChunkMeta) -> Result<T> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(meta.offset))?;
        let mut payload = vec![0u8; meta.len as usize];
        file.read_exact(&mut payload)?;
        if xxh3_64(&payload) != meta.checksum {
            return Err(Error::Corruption(format!(
                "{}: checksum mismatch in chunk at offset {}",
                self.path.display(),
                meta.offset
            )));
        }
        decode_payload(&payload)
    }
}

fn parse_chunk_header(rest: &[u8; CHUNK_HEADER_SIZE - 1], offset: u64) -> Result<ChunkMeta> {
    let u32_at = |at: usize| u32::from_le_bytes([rest[at], rest[at + 1], rest[at + 2], rest[at + 3]]);
    let u64_at = |at: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&rest[at..at + 8]);
        u64::from_le_bytes(b)
    };
    let len = u32_at(0);
    if len > MAX_CHUNK_LEN {
        return Err(Error::Corruption(format!("chunk length {} out of range", len)));
    }
    let bloom_at = 4 + 4 + 8 + 8;
    let bloom = Bloom::from_slice(&rest[bloom_at..bloom_at + BLOOM_BYTES])
        .ok_or_else(|| Error::Corruption("chunk bloom has wrong length".into()))?;
    Ok(ChunkMeta {
        offset,
        len,
        rows: u32_at(4),
        min_block: u64_at(8),
        max_block: u64_at(16),
        bloom,
        checksum: u64_at(bloom_at + BLOOM_BYTES),
    })
}
