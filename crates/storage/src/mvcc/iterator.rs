//! Version-resolving iterator over raw MVCC entries.

use crate::encoding::{decode_user_key, decode_value, is_deleted_at};
use crate::kv::KvIter;
use versiondb_core::{Result, Version};

/// The entry chosen so far for the user key being grouped.
struct Group {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
}

/// Yields, for each user key in range, the value of its newest entry at or
/// below the target version, skipping keys deleted as of that version.
///
/// Raw entries arrive grouped by user key: ascending versions when iterating
/// forward, descending when in reverse.
pub struct MvccIterator<'a> {
    raw: KvIter<'a>,
    prefix_len: usize,
    version: Version,
    reverse: bool,
    group: Option<Group>,
    done: bool,
}

impl<'a> MvccIterator<'a> {
    pub(crate) fn new(raw: KvIter<'a>, prefix_len: usize, version: Version, reverse: bool) -> Self {
        MvccIterator {
            raw,
            prefix_len,
            version,
            reverse,
            group: None,
            done: false,
        }
    }

    fn next_raw(&mut self) -> Option<Result<(Vec<u8>, Vec<u8>)>> {
        if self.reverse {
            self.raw.next_back()
        } else {
            self.raw.next()
        }
    }

    /// Resolve a finished group; `None` when the key has no live value.
    fn resolve(&self, group: Group) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(raw) = group.value else {
            return Ok(None);
        };
        let (value, tombstone) = decode_value(&raw)?;
        if is_deleted_at(tombstone, self.version) {
            return Ok(None);
        }
        Ok(Some((group.key, value.to_vec())))
    }
}

impl<'a> Iterator for MvccIterator<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let (raw_key, raw_value) = match self.next_raw() {
                Some(Ok(pair)) => pair,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    break;
                }
            };
            let (key, version) = match decode_user_key(&raw_key[self.prefix_len..]) {
                Ok(parts) => parts,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let finished = match &self.group {
                Some(g) if g.key == key => None,
                _ => self.group.replace(Group {
                    key,
                    value: None,
                }),
            };

            if version <= self.version {
                if let Some(g) = self.group.as_mut() {
                    // Forward: later entries are newer. Reverse: the first
                    // match is the newest.
                    if !self.reverse || g.value.is_none() {
                        g.value = Some(raw_value);
                    }
                }
            }

            if let Some(g) = finished {
                match self.resolve(g) {
                    Ok(Some(pair)) => return Some(Ok(pair)),
                    Ok(None) => {}
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
        }

        let last = self.group.take()?;
        self.resolve(last).transpose()
    }
}

#[cfg(test)]
mod tests {
    use crate::mvcc::{MvccDb, MvccOptions};
    use versiondb_core::{ChangeSet, Error, KvPair, NamedChangeSet, StateStore, StateStoreConfig};

    fn db_with(entries: &[(i64, Vec<KvPair>)]) -> MvccDb<crate::kv::MemoryEngine> {
        let db = MvccDb::in_memory(MvccOptions::new(StateStoreConfig::for_testing())).unwrap();
        for (v, pairs) in entries {
            db.apply_changeset_sync(*v, &[NamedChangeSet::new("s", ChangeSet::new(pairs.clone()))])
                .unwrap();
        }
        db
    }

    fn keys(it: versiondb_core::DbIterator<'_>) -> Vec<(String, String)> {
        it.map(|r| {
            let (k, v) = r.unwrap();
            (String::from_utf8(k).unwrap(), String::from_utf8(v).unwrap())
        })
        .collect()
    }

    #[test]
    fn test_forward_and_reverse_resolve_versions() {
        let db = db_with(&[
            (1, vec![KvPair::set("a", "a1"), KvPair::set("b", "b1"), KvPair::set("c", "c1")]),
            (3, vec![KvPair::set("a", "a3"), KvPair::delete("b")]),
            (5, vec![KvPair::set("c", "c5")]),
        ]);

        assert_eq!(
            keys(db.iterator("s", 4, None, None).unwrap()),
            vec![("a".into(), "a3".into()), ("c".into(), "c1".into())]
        );
        assert_eq!(
            keys(db.reverse_iterator("s", 4, None, None).unwrap()),
            vec![("c".into(), "c1".into()), ("a".into(), "a3".into())]
        );
        assert_eq!(
            keys(db.iterator("s", 2, None, None).unwrap()),
            vec![
                ("a".into(), "a1".into()),
                ("b".into(), "b1".into()),
                ("c".into(), "c1".into())
            ]
        );
    }

    #[test]
    fn test_bounds_are_half_open() {
        let db = db_with(&[(1, vec![
            KvPair::set("a", "1"),
            KvPair::set("b", "2"),
            KvPair::set("c", "3"),
        ])]);
        let got = keys(db.iterator("s", 1, Some(b"b"), Some(b"c")).unwrap());
        assert_eq!(got, vec![("b".into(), "2".into())]);
        let got = keys(db.reverse_iterator("s", 1, Some(b"a"), Some(b"c")).unwrap());
        assert_eq!(got, vec![("b".into(), "2".into()), ("a".into(), "1".into())]);
    }

    #[test]
    fn test_invalid_bounds() {
        let db = db_with(&[]);
        assert!(matches!(
            db.iterator("s", 1, Some(b""), None),
            Err(Error::KeyEmpty)
        ));
        assert!(matches!(
            db.reverse_iterator("s", 1, None, Some(b"")),
            Err(Error::KeyEmpty)
        ));
        assert!(matches!(
            db.iterator("s", 1, Some(b"z"), Some(b"a")),
            Err(Error::StartAfterEnd)
        ));
        assert_eq!(db.iterator("s", 1, Some(b"a"), Some(b"a")).unwrap().count(), 0);
    }

    #[test]
    fn test_keys_only_newer_than_target_are_hidden() {
        let db = db_with(&[(7, vec![KvPair::set("late", "x")]), (2, vec![KvPair::set("early", "y")])]);
        assert_eq!(
            keys(db.iterator("s", 5, None, None).unwrap()),
            vec![("early".into(), "y".into())]
        );
    }
}
