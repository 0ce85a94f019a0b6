//! On-disk layout of WAL segments and the records inside them.
//!
//! WAL segments are named `wal-NNNNNNNNNNNNNNNNNNNN.seg` where the number is
//! the zero-padded index of the first record the segment holds.
//!
//! # Segment Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment Header (32 bytes)          │
//! ├────────────────────────────────────┤
//! │ Record N                           │
//! ├────────────────────────────────────┤
//! │ Record N+1                         │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬────────────────┬────────────┬────────────────────┬──────────┐
//! │ Length (4 bytes)│ Format Ver (1) │ Index (8)  │ Payload (variable) │ CRC32 (4)│
//! └─────────────────┴────────────────┴────────────┴────────────────────┴──────────┘
//! ```
//!
//! The length covers everything after itself; the CRC covers format version,
//! index and payload.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a WAL segment file: "VDBW"
pub const SEGMENT_MAGIC: [u8; 4] = *b"VDBW";

/// Segment header format version
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Fixed header length
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Record framing version
pub const WAL_RECORD_FORMAT_VERSION: u8 = 1;

/// Bytes of framing around a record payload (length + version + index + crc).
pub const RECORD_OVERHEAD: usize = 4 + 1 + 8 + 4;

/// Upper bound on a single record, used to reject garbage length fields.
const MAX_RECORD_LEN: usize = 256 * 1024 * 1024;

/// Header at the start of every segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes: "VDBW"
    pub magic: [u8; 4],

    /// `SEGMENT_FORMAT_VERSION` at write time
    pub format_version: u32,

    /// Index of the first record in this segment
    pub first_index: u64,

    /// Log UUID, shared by every segment of one log
    pub log_uuid: [u8; 16],
}

impl SegmentHeader {
    /// Header for a segment starting at `first_index`.
    pub fn new(first_index: u64, log_uuid: [u8; 16]) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            first_index,
            log_uuid,
        }
    }

    /// Little-endian encoding.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.first_index.to_le_bytes());
        bytes[16..32].copy_from_slice(&self.log_uuid);
        bytes
    }

    /// Decode; validity is checked separately.
    pub fn from_bytes(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Option<Self> {
        Some(SegmentHeader {
            magic: bytes[0..4].try_into().ok()?,
            format_version: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            first_index: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            log_uuid: bytes[16..32].try_into().ok()?,
        })
    }

    /// Validate magic bytes and version.
    pub fn is_valid(&self) -> bool {
        self.magic == SEGMENT_MAGIC && self.format_version == SEGMENT_FORMAT_VERSION
    }
}

/// Open handle on one segment file.
pub struct WalSegment {
    file: File,
    header: SegmentHeader,
    write_position: u64,
    path: PathBuf,
}

impl WalSegment {
    /// Create a new segment file and write its header.
    pub fn create(dir: &Path, first_index: u64, log_uuid: [u8; 16]) -> std::io::Result<Self> {
        let path = Self::segment_path(dir, first_index);
        Self::create_at(path, first_index, log_uuid)
    }

    /// Create a segment at an explicit path (used for rewrite-then-rename).
    pub fn create_at(path: PathBuf, first_index: u64, log_uuid: [u8; 16]) -> std::io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(&path)?;

        let header = SegmentHeader::new(first_index, log_uuid);
        file.write_all(&header.to_bytes())?;

        Ok(WalSegment {
            file,
            header,
            write_position: SEGMENT_HEADER_SIZE as u64,
            path,
        })
    }

    /// Open an existing segment for reading and appending.
    ///
    /// Validates the header and positions at the end of the file.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header_bytes = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;

        let header = SegmentHeader::from_bytes(&header_bytes)
            .filter(SegmentHeader::is_valid)
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid segment header")
            })?;

        let write_position = file.seek(SeekFrom::End(0))?;

        Ok(WalSegment {
            file,
            header,
            write_position,
            path: path.to_path_buf(),
        })
    }

    /// Segment file path for a first index.
    pub fn segment_path(dir: &Path, first_index: u64) -> PathBuf {
        dir.join(format!("wal-{:020}.seg", first_index))
    }

    /// Parse the first index out of a segment file name.
    pub fn parse_segment_name(name: &str) -> Option<u64> {
        name.strip_prefix("wal-")?
            .strip_suffix(".seg")?
            .parse()
            .ok()
    }

    /// Segment header.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Current segment size in bytes.
    pub fn size(&self) -> u64 {
        self.write_position
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append bytes at the end of the segment.
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(self.write_position))?;
        self.file.write_all(data)?;
        self.write_position += data.len() as u64;
        Ok(())
    }

    /// fsync data and metadata.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }

    /// Read everything after the header.
    pub fn read_body(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.file.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE as u64))?;
        self.file.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Read `len` bytes at absolute position `pos`.
    pub fn read_at(&mut self, pos: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Cut the file at `position`.
    ///
    /// Used on open to remove a corrupted tail and by back-truncation.
    pub fn truncate(&mut self, position: u64) -> std::io::Result<()> {
        self.file.set_len(position)?;
        self.write_position = position;
        self.file.seek(SeekFrom::Start(position))?;
        self.file.sync_all()
    }
}

/// One framed WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Position in the log, 1-based
    pub index: u64,
    /// msgpack-encoded entry
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// Record `payload` at `index`.
    pub fn new(index: u64, payload: Vec<u8>) -> Self {
        WalRecord { index, payload }
    }

    /// Frame the record: `len ‖ version ‖ index ‖ payload ‖ crc32`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let framed_len = RECORD_OVERHEAD - 4 + self.payload.len();
        let mut out = Vec::with_capacity(4 + framed_len);
        out.extend_from_slice(&(framed_len as u32).to_le_bytes());
        out.push(WAL_RECORD_FORMAT_VERSION);
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.payload);
        let crc = crc32fast::hash(&out[4..]);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse one record from the front of `bytes`, returning it with the
    /// number of bytes it spans.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), WalRecordError> {
        let len_field: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(WalRecordError::InsufficientData)?;
        let framed_len = u32::from_le_bytes(len_field) as usize;
        if framed_len < RECORD_OVERHEAD - 4 || framed_len > MAX_RECORD_LEN {
            return Err(WalRecordError::InvalidFormat);
        }
        let total = 4 + framed_len;
        let frame = bytes.get(4..total).ok_or(WalRecordError::InsufficientData)?;

        let (body, crc_field) = frame.split_at(framed_len - 4);
        let stored = u32::from_le_bytes([crc_field[0], crc_field[1], crc_field[2], crc_field[3]]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(WalRecordError::ChecksumMismatch { stored, computed });
        }
        if body[0] != WAL_RECORD_FORMAT_VERSION {
            return Err(WalRecordError::UnsupportedVersion(body[0]));
        }

        let mut index = [0u8; 8];
        index.copy_from_slice(&body[1..9]);
        let record = WalRecord::new(u64::from_le_bytes(index), body[9..].to_vec());
        Ok((record, total))
    }
}

/// Why a record could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalRecordError {
    /// The buffer ends inside the record (torn write)
    #[error("record extends past end of data")]
    InsufficientData,

    /// Length field out of range
    #[error("record length field out of range")]
    InvalidFormat,

    /// CRC32 over version, index and payload does not match
    #[error("record crc mismatch: stored {stored:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// CRC found in the record
        stored: u32,
        /// CRC of the bytes read
        computed: u32,
    },

    /// Record written by a newer format
    #[error("unknown record format version {0}")]
    UnsupportedVersion(u8),
}
