//! Binary on-disk formats.

pub mod wal_record;

pub use wal_record::{
    SegmentHeader, WalRecord, WalRecordError, WalSegment, RECORD_OVERHEAD, SEGMENT_FORMAT_VERSION,
    SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, WAL_RECORD_FORMAT_VERSION,
};
