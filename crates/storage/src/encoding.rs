//! MVCC key and value encoding.
//!
//! # Keys
//!
//! ```text
//! "s/k:" ‖ esc(namespace) ‖ esc(user_key) ‖ version (u64, big-endian)
//! ```
//!
//! `esc` maps `0x00` to `0x00 0xFF` and ends with the terminator `0x00 0x01`.
//! The escaped form sorts exactly like the raw bytes and no escaped string is
//! a prefix of another, so under a bytewise comparator:
//!
//! - all keys of a namespace are contiguous,
//! - all versions of a user key are contiguous and ascending,
//! - the newest version `<= v` is the last key in
//!   `[prefix ‖ 0, prefix ‖ v]`.
//!
//! # Values
//!
//! ```text
//! value ‖ [tombstone (u64, big-endian)] ‖ suffix_len (u8: 0 or 8)
//! ```
//!
//! A missing or zero tombstone means "not deleted".
//!
//! # Metadata
//!
//! `s/_latest` and `s/_earliest` hold the version bounds as 8-byte
//! little-endian integers. They sort before every data key.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use versiondb_core::{Error, Result, Version};

/// Prefix of every data key.
pub const DATA_PREFIX: &[u8] = b"s/k:";

/// Metadata key holding the latest version.
pub const LATEST_VERSION_KEY: &[u8] = b"s/_latest";

/// Metadata key holding the earliest version.
pub const EARLIEST_VERSION_KEY: &[u8] = b"s/_earliest";

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;
const VERSION_LEN: usize = 8;

/// Append the order-preserving escape of `bytes` to `out`.
pub fn escape_into(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == ESCAPE {
            out.extend_from_slice(&[ESCAPE, ESCAPED_ZERO]);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&[ESCAPE, TERMINATOR]);
}

/// Undo [`escape_into`]; returns the raw bytes and the escaped length
/// consumed (terminator included).
pub fn unescape(input: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            ESCAPE => match input.get(i + 1) {
                Some(&TERMINATOR) => return Ok((out, i + 2)),
                Some(&ESCAPED_ZERO) => {
                    out.push(0);
                    i += 2;
                }
                _ => return Err(Error::Corruption("bad escape sequence in MVCC key".into())),
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Err(Error::Corruption("unterminated component in MVCC key".into()))
}

/// Prefix shared by every key of `namespace`.
pub fn namespace_prefix(namespace: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(DATA_PREFIX.len() + namespace.len() + 2);
    out.extend_from_slice(DATA_PREFIX);
    escape_into(&mut out, namespace.as_bytes());
    out
}

/// Prefix shared by every version of `key` in `namespace`.
pub fn key_prefix(namespace: &str, key: &[u8]) -> Vec<u8> {
    let mut out = namespace_prefix(namespace);
    escape_into(&mut out, key);
    out
}

/// `prefix ‖ version`.
pub fn with_version(mut prefix: Vec<u8>, version: Version) -> Vec<u8> {
    let mut buf = [0u8; VERSION_LEN];
    BigEndian::write_u64(&mut buf, version.max(0) as u64);
    prefix.extend_from_slice(&buf);
    prefix
}

/// Full MVCC key.
pub fn encode_key(namespace: &str, key: &[u8], version: Version) -> Vec<u8> {
    with_version(key_prefix(namespace, key), version)
}

/// A data key split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    /// Namespace bytes
    pub namespace: Vec<u8>,
    /// User key
    pub key: Vec<u8>,
    /// Version
    pub version: Version,
}

/// Split a data key.
pub fn decode_key(raw: &[u8]) -> Result<DecodedKey> {
    let rest = raw
        .strip_prefix(DATA_PREFIX)
        .ok_or_else(|| Error::Corruption("MVCC key without data prefix".into()))?;
    let (namespace, used) = unescape(rest)?;
    let (key, version) = decode_user_key(&rest[used..])?;
    Ok(DecodedKey {
        namespace,
        key,
        version,
    })
}

/// Split `esc(user_key) ‖ version`, the part after a namespace prefix.
pub fn decode_user_key(rest: &[u8]) -> Result<(Vec<u8>, Version)> {
    let (key, used) = unescape(rest)?;
    let tail = &rest[used..];
    if tail.len() != VERSION_LEN {
        return Err(Error::Corruption(format!(
            "MVCC key version suffix has {} bytes",
            tail.len()
        )));
    }
    Ok((key, BigEndian::read_u64(tail) as Version))
}

/// Encode a stored value.
pub fn encode_value(value: &[u8], tombstone: Option<Version>) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + VERSION_LEN + 1);
    out.extend_from_slice(value);
    match tombstone {
        Some(v) if v > 0 => {
            let mut buf = [0u8; VERSION_LEN];
            BigEndian::write_u64(&mut buf, v as u64);
            out.extend_from_slice(&buf);
            out.push(VERSION_LEN as u8);
        }
        _ => out.push(0),
    }
    out
}

/// Split a stored value into `(value, tombstone)`; tombstone 0 means live.
pub fn decode_value(raw: &[u8]) -> Result<(&[u8], Version)> {
    let (&suffix, rest) = raw
        .split_last()
        .ok_or_else(|| Error::Corruption("empty MVCC value".into()))?;
    match suffix as usize {
        0 => Ok((rest, 0)),
        VERSION_LEN if rest.len() >= VERSION_LEN => {
            let split = rest.len() - VERSION_LEN;
            Ok((&rest[..split], BigEndian::read_u64(&rest[split..]) as Version))
        }
        n => Err(Error::Corruption(format!("MVCC value suffix length {}", n))),
    }
}

/// Whether a decoded value is deleted as seen from `version`.
pub fn is_deleted_at(tombstone: Version, version: Version) -> bool {
    tombstone > 0 && tombstone <= version
}

/// Encode a metadata version.
pub fn encode_meta_version(version: Version) -> Vec<u8> {
    let mut buf = vec![0u8; VERSION_LEN];
    LittleEndian::write_i64(&mut buf, version);
    buf
}

/// Decode a metadata version.
pub fn decode_meta_version(raw: &[u8]) -> Result<Version> {
    if raw.len() != VERSION_LEN {
        return Err(Error::Corruption(format!(
            "metadata version has {} bytes",
            raw.len()
        )));
    }
    Ok(LittleEndian::read_i64(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn esc(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        escape_into(&mut out, bytes);
        out
    }

    #[test]
    fn test_key_roundtrip_with_awkward_bytes() {
        let raw = encode_key("bank/sub", &[0x00, b'/', 0xFF, 0x00], 42);
        let decoded = decode_key(&raw).unwrap();
        assert_eq!(decoded.namespace, b"bank/sub".to_vec());
        assert_eq!(decoded.key, vec![0x00, b'/', 0xFF, 0x00]);
        assert_eq!(decoded.version, 42);
    }

    #[test]
    fn test_value_tombstone_suffix() {
        let live = encode_value(b"abc", None);
        assert_eq!(decode_value(&live).unwrap(), (&b"abc"[..], 0));

        let dead = encode_value(b"", Some(9));
        let (value, tombstone) = decode_value(&dead).unwrap();
        assert!(value.is_empty());
        assert_eq!(tombstone, 9);
        assert!(is_deleted_at(tombstone, 9));
        assert!(!is_deleted_at(tombstone, 8));
        assert!(!is_deleted_at(0, 100));
    }

    #[test]
    fn test_corrupt_value_rejected() {
        assert!(decode_value(&[]).is_err());
        assert!(decode_value(&[1, 2, 8]).is_err());
        assert!(decode_value(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_metadata_sorts_before_data() {
        assert!(LATEST_VERSION_KEY < DATA_PREFIX);
        assert!(EARLIEST_VERSION_KEY < DATA_PREFIX);
        assert_eq!(decode_meta_version(&encode_meta_version(77)).unwrap(), 77);
    }

    #[test]
    fn test_namespace_prefix_not_shared() {
        // "a" and "a\0b" must not share the namespace prefix of "a".
        let a = namespace_prefix("a");
        let longer = namespace_prefix("a\0b");
        assert!(!longer.starts_with(&a));
    }

    proptest! {
        #[test]
        fn escape_preserves_order(a in proptest::collection::vec(any::<u8>(), 0..12),
                                  b in proptest::collection::vec(any::<u8>(), 0..12)) {
            prop_assert_eq!(esc(&a).cmp(&esc(&b)), a.cmp(&b));
        }

        #[test]
        fn versions_of_a_key_are_contiguous(a in proptest::collection::vec(any::<u8>(), 0..8),
                                            b in proptest::collection::vec(any::<u8>(), 0..8),
                                            va in 0i64..1_000_000, vb in 0i64..1_000_000) {
            prop_assume!(a != b);
            let ka = encode_key("ns", &a, va);
            let kb = encode_key("ns", &b, vb);
            prop_assert_eq!(ka.cmp(&kb), a.cmp(&b));
        }
    }
}
