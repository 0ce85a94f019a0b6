//! Fault injection points of the columnar write path.

use parking_lot::Mutex;
use versiondb_core::{Error, Result};

/// Points in the write path where a test may stop the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// A block's WAL entry is durable, its receipts not yet buffered
    AfterWalWrite,
    /// Buffered receipts are about to be written to the active files
    BeforeFlush,
    /// A chunk was written but the buffer not yet cleared
    AfterFlush,
    /// Rotation sealed the old file pair
    AfterCloseWriters,
    /// Rotation cleared the WAL; new writers are not yet open
    AfterWalClear,
}

impl FaultPoint {
    /// Every fault point, in write-path order.
    pub const ALL: [FaultPoint; 5] = [
        FaultPoint::AfterWalWrite,
        FaultPoint::BeforeFlush,
        FaultPoint::AfterFlush,
        FaultPoint::AfterCloseWriters,
        FaultPoint::AfterWalClear,
    ];

    /// Stable name used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            FaultPoint::AfterWalWrite => "after_wal_write",
            FaultPoint::BeforeFlush => "before_flush",
            FaultPoint::AfterFlush => "after_flush",
            FaultPoint::AfterCloseWriters => "after_close_writers",
            FaultPoint::AfterWalClear => "after_wal_clear",
        }
    }
}

/// Called by the store at every [`FaultPoint`]; an error aborts the write.
pub trait FaultHooks: Send + Sync {
    /// `block` is the block being written (or the next block, for rotation).
    fn on_fault_point(&self, point: FaultPoint, block: u64) -> Result<()>;
}

/// Hooks that never fire.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultHooks for NoFaults {
    fn on_fault_point(&self, _point: FaultPoint, _block: u64) -> Result<()> {
        Ok(())
    }
}

/// Fails once at `point`, on the first call at or after `from_block`.
#[derive(Debug)]
pub struct FailOnce {
    point: FaultPoint,
    from_block: u64,
    fired: Mutex<Option<u64>>,
}

impl FailOnce {
    /// Fail the first time `point` is reached.
    pub fn new(point: FaultPoint) -> Self {
        Self::from_block(point, 0)
    }

    /// Fail the first time `point` is reached for a block `>= from_block`.
    pub fn from_block(point: FaultPoint, from_block: u64) -> Self {
        FailOnce {
            point,
            from_block,
            fired: Mutex::new(None),
        }
    }

    /// Block the hook fired at, if it has.
    pub fn fired_at(&self) -> Option<u64> {
        *self.fired.lock()
    }
}

impl FaultHooks for FailOnce {
    fn on_fault_point(&self, point: FaultPoint, block: u64) -> Result<()> {
        if point != self.point || block < self.from_block {
            return Ok(());
        }
        let mut fired = self.fired.lock();
        if fired.is_some() {
            return Ok(());
        }
        *fired = Some(block);
        Err(Error::FaultInjected(point.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_once() {
        let hook = FailOnce::from_block(FaultPoint::AfterFlush, 3);
        assert!(hook.on_fault_point(FaultPoint::AfterFlush, 2).is_ok());
        assert!(hook.on_fault_point(FaultPoint::BeforeFlush, 3).is_ok());
        assert!(matches!(
            hook.on_fault_point(FaultPoint::AfterFlush, 4),
            Err(Error::FaultInjected("after_flush"))
        ));
        assert_eq!(hook.fired_at(), Some(4));
        assert!(hook.on_fault_point(FaultPoint::AfterFlush, 5).is_ok());
    }
}
