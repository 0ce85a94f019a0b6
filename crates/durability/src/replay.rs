//! WAL-replay recovery.
//!
//! A store that logs changes before applying them can crash with its WAL
//! ahead of its persisted state. On open it calls [`recover_from_wal`]:
//!
//! 1. If the WAL's last entry is at or below the store's latest version,
//!    there is nothing to do.
//! 2. Otherwise walk backward from the tail until an entry at or below the
//!    store's latest version is found (or fall back to the first offset when
//!    the store is empty or nothing qualifies).
//! 3. Replay forward from the entry after it, applying each synchronously.
//!
//! Entries are applied at their own versions, so replaying a range twice
//! converges to the same state.

use crate::wal::Wal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;
use versiondb_core::{Result, Version};

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// First offset replayed, 0 when nothing was replayed
    pub start_offset: u64,
    /// Entries applied
    pub replayed: u64,
    /// Version of the last applied entry
    pub last_version: Version,
}

/// Offset replay must start from to catch a store at `store_latest` up with
/// `wal`, or `None` when the store is already current.
pub fn find_replay_start<E, V>(wal: &Wal<E>, store_latest: Version, version_of: V) -> Result<Option<u64>>
where
    E: Serialize + DeserializeOwned,
    V: Fn(&E) -> Version,
{
    let (first, last) = (wal.first_offset(), wal.last_offset());
    if last == 0 {
        return Ok(None);
    }
    if store_latest <= 0 {
        return Ok(Some(first));
    }
    if version_of(&wal.read_at(last)?) <= store_latest {
        return Ok(None);
    }

    let mut offset = last;
    while offset > first {
        offset -= 1;
        if version_of(&wal.read_at(offset)?) <= store_latest {
            return Ok(Some(offset + 1));
        }
    }
    Ok(Some(first))
}

/// Replay every WAL entry the store has not applied yet.
pub fn recover_from_wal<E, V, A>(
    wal: &Wal<E>,
    store_latest: Version,
    version_of: V,
    mut apply: A,
) -> Result<ReplayStats>
where
    E: Serialize + DeserializeOwned,
    V: Fn(&E) -> Version,
    A: FnMut(E) -> Result<()>,
{
    let Some(start) = find_replay_start(wal, store_latest, &version_of)? else {
        return Ok(ReplayStats::default());
    };

    let mut stats = ReplayStats {
        start_offset: start,
        ..ReplayStats::default()
    };
    wal.replay(start, wal.last_offset(), |_, entry| {
        stats.last_version = version_of(&entry);
        apply(entry)?;
        stats.replayed += 1;
        Ok(())
    })?;

    info!(
        start = stats.start_offset,
        replayed = stats.replayed,
        last_version = stats.last_version,
        "replayed WAL"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WalConfig;
    use tempfile::tempdir;
    use versiondb_core::ChangelogEntry;

    fn wal_with_versions(dir: &std::path::Path, versions: &[Version]) -> Wal<ChangelogEntry> {
        let wal = Wal::open(dir, WalConfig::for_testing()).unwrap();
        for v in versions {
            wal.write(&ChangelogEntry::new(*v, Vec::new())).unwrap();
        }
        wal
    }

    #[test]
    fn test_nothing_to_replay_when_current() {
        let dir = tempdir().unwrap();
        let wal = wal_with_versions(dir.path(), &[1, 2, 3]);
        assert_eq!(find_replay_start(&wal, 3, |e| e.version).unwrap(), None);
    }

    #[test]
    fn test_empty_store_replays_everything() {
        let dir = tempdir().unwrap();
        let wal = wal_with_versions(dir.path(), &[1, 2, 3]);
        assert_eq!(find_replay_start(&wal, 0, |e| e.version).unwrap(), Some(1));
    }

    #[test]
    fn test_walks_back_to_store_version() {
        let dir = tempdir().unwrap();
        let wal = wal_with_versions(dir.path(), &[10, 11, 12, 13, 14]);
        assert_eq!(find_replay_start(&wal, 12, |e| e.version).unwrap(), Some(4));

        let mut applied = Vec::new();
        let stats = recover_from_wal(&wal, 12, |e| e.version, |e| {
            applied.push(e.version);
            Ok(())
        })
        .unwrap();
        assert_eq!(applied, vec![13, 14]);
        assert_eq!(stats.replayed, 2);
        assert_eq!(stats.last_version, 14);
    }

    #[test]
    fn test_store_behind_whole_wal() {
        let dir = tempdir().unwrap();
        let wal = wal_with_versions(dir.path(), &[10, 11]);
        assert_eq!(find_replay_start(&wal, 5, |e| e.version).unwrap(), Some(1));
    }

    #[test]
    fn test_empty_wal() {
        let dir = tempdir().unwrap();
        let wal = wal_with_versions(dir.path(), &[]);
        let stats = recover_from_wal(&wal, 0, |e| e.version, |_| Ok(())).unwrap();
        assert_eq!(stats, ReplayStats::default());
    }
}
