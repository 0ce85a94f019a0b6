//! WAL configuration.

use std::time::Duration;
use versiondb_core::Error;

/// Tuning for one `Wal`.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Rotate to a new segment file past this many bytes (64MB).
    pub segment_size: u64,

    /// Depth of the async write queue. `<= 0` makes every write synchronous.
    pub write_buffer_size: i64,

    /// Most entries the background writer appends per fsync.
    pub write_batch_size: usize,

    /// Entries retained behind the tail by the background pruner; `0`
    /// disables pruning.
    pub keep_recent: u64,

    /// Interval of the background pruner.
    pub prune_interval: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            segment_size: 64 * 1024 * 1024,
            write_buffer_size: 0,
            write_batch_size: 64,
            keep_recent: 0,
            prune_interval: Duration::from_secs(60),
        }
    }
}

impl WalConfig {
    /// Synchronous defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Segment rotation threshold.
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Async queue depth; `<= 0` writes synchronously.
    pub fn with_write_buffer_size(mut self, depth: i64) -> Self {
        self.write_buffer_size = depth;
        self
    }

    /// Entries per writer fsync.
    pub fn with_write_batch_size(mut self, size: usize) -> Self {
        self.write_batch_size = size;
        self
    }

    /// Keep at most `keep_recent` entries, checked every `interval`.
    pub fn with_keep_recent(mut self, keep_recent: u64, interval: Duration) -> Self {
        self.keep_recent = keep_recent;
        self.prune_interval = interval;
        self
    }

    /// Whether writes go through the background writer.
    pub fn is_async(&self) -> bool {
        self.write_buffer_size > 0
    }

    /// Reject settings `Wal::open` cannot honour.
    pub fn validate(&self) -> Result<(), WalConfigError> {
        if self.segment_size < 1024 {
            return Err(WalConfigError::SegmentSizeTooSmall);
        }
        if self.write_batch_size == 0 {
            return Err(WalConfigError::ZeroBatchSize);
        }
        if self.keep_recent > 0 && self.prune_interval.is_zero() {
            return Err(WalConfigError::ZeroPruneInterval);
        }
        Ok(())
    }

    /// 4KB segments so tests rotate quickly.
    pub fn for_testing() -> Self {
        WalConfig {
            segment_size: 4 * 1024,
            write_buffer_size: 0,
            write_batch_size: 8,
            keep_recent: 0,
            prune_interval: Duration::from_millis(50),
        }
    }
}

/// Invalid `WalConfig`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalConfigError {
    /// `segment_size` below 1024
    #[error("segment size must be at least 1024 bytes")]
    SegmentSizeTooSmall,

    /// Writer batch size is zero.
    #[error("write batch size must be at least 1")]
    ZeroBatchSize,

    /// Pruning enabled with a zero interval.
    #[error("prune interval must be non-zero when keep_recent is set")]
    ZeroPruneInterval,
}

impl From<WalConfigError> for Error {
    fn from(e: WalConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(WalConfig::default().validate().is_ok());
        assert!(!WalConfig::default().is_async());
    }

    #[test]
    fn test_segment_size_too_small() {
        let config = WalConfig::new().with_segment_size(512);
        assert_eq!(config.validate(), Err(WalConfigError::SegmentSizeTooSmall));
    }

    #[test]
    fn test_zero_prune_interval() {
        let config = WalConfig::new().with_keep_recent(10, Duration::ZERO);
        assert_eq!(config.validate(), Err(WalConfigError::ZeroPruneInterval));
    }

    #[test]
    fn test_async_toggle() {
        assert!(WalConfig::new().with_write_buffer_size(10).is_async());
        assert!(!WalConfig::new().with_write_buffer_size(-1).is_async());
    }
}
