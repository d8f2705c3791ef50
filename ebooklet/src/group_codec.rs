//! Packs many `(key, timestamp, value)` records into a single opaque blob
//! addressed by a group id derived from a stable hash of the key
//! (spec.md §4.4).
//!
//! ```text
//! u32 be   n_entries
//! repeat n_entries {
//!   u16 be  key_len
//!   u8[]    key_utf8
//!   u8[7]   timestamp_be
//!   u32 be  value_len
//!   u8[]    value_bytes
//! }
//! ```

use blake2::digest::consts::U4;
use blake2::{Blake2b, Digest};

use crate::error::{Error, Result};

/// A single entry as packed into (or unpacked from) a group blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub key: String,
    pub timestamp: u64,
    pub value: Vec<u8>,
}

type Blake2b32 = Blake2b<U4>;

/// `group_id(key) = be_u32(blake2b(utf8(key), 4 bytes)) mod num_groups`.
pub fn group_id(key: &str, num_groups: u32) -> u32 {
    assert!(num_groups > 0, "num_groups must be nonzero");
    let mut hasher = Blake2b32::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes(digest.into()) % num_groups
}

/// Encodes a 7-byte big-endian timestamp, the wire width used for the
/// remote index, changelog, and group codec (spec.md §3).
pub fn encode_be7(ts: u64) -> [u8; 7] {
    let full = ts.to_be_bytes();
    full[1..8].try_into().expect("8 bytes minus 1 is 7")
}

pub fn decode_be7(bytes: &[u8; 7]) -> u64 {
    let mut full = [0u8; 8];
    full[1..8].copy_from_slice(bytes);
    u64::from_be_bytes(full)
}

/// Packs entries into a blob. Total and pure: `pack([])` is 4 zero bytes.
pub fn pack(entries: &[GroupEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in entries {
        let key_bytes = entry.key.as_bytes();
        out.extend_from_slice(&(key_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(key_bytes);
        out.extend_from_slice(&encode_be7(entry.timestamp));
        out.extend_from_slice(&(entry.value.len() as u32).to_be_bytes());
        out.extend_from_slice(&entry.value);
    }
    out
}

/// Unpacks a blob produced by [`pack`]. Rejects any buffer whose declared
/// sizes run past the input length, including trailing garbage after the
/// last entry.
pub fn unpack(data: &[u8]) -> Result<Vec<GroupEntry>> {
    if data.len() < 4 {
        return Err(Error::CorruptGroup);
    }
    let n_entries = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
    let mut off = 4;
    let mut out = Vec::with_capacity(n_entries);

    for _ in 0..n_entries {
        if data.len() < off + 2 {
            return Err(Error::CorruptGroup);
        }
        let key_len = u16::from_be_bytes(data[off..off + 2].try_into().unwrap()) as usize;
        off += 2;

        if data.len() < off + key_len + 7 + 4 {
            return Err(Error::CorruptGroup);
        }
        let key = std::str::from_utf8(&data[off..off + key_len])
            .map_err(|_| Error::CorruptGroup)?
            .to_string();
        off += key_len;

        let timestamp = decode_be7(data[off..off + 7].try_into().unwrap());
        off += 7;

        let value_len = u32::from_be_bytes(data[off..off + 4].try_into().unwrap()) as usize;
        off += 4;

        if data.len() < off + value_len {
            return Err(Error::CorruptGroup);
        }
        let value = data[off..off + value_len].to_vec();
        off += value_len;

        out.push(GroupEntry { key, timestamp, value });
    }

    if off != data.len() {
        return Err(Error::CorruptGroup);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_of_empty_is_four_zero_bytes() {
        assert_eq!(pack(&[]), vec![0u8, 0, 0, 0]);
    }

    #[test]
    fn round_trips_through_unpack() {
        let entries = vec![
            GroupEntry { key: "a".into(), timestamp: 1, value: vec![1, 2, 3] },
            GroupEntry { key: "bb".into(), timestamp: u64::MAX >> 8, value: vec![] },
            GroupEntry { key: "unicode-é".into(), timestamp: 42, value: vec![0; 64] },
        ];
        let packed = pack(&entries);
        assert_eq!(unpack(&packed).unwrap(), entries);
    }

    #[test]
    fn be7_round_trips_max_56_bit_value() {
        let max56 = (1u64 << 56) - 1;
        assert_eq!(decode_be7(&encode_be7(max56)), max56);
    }

    #[test]
    fn unpack_rejects_truncated_buffer() {
        let entries = vec![GroupEntry { key: "a".into(), timestamp: 1, value: vec![9; 10] }];
        let mut packed = pack(&entries);
        packed.truncate(packed.len() - 3);
        assert!(unpack(&packed).is_err());
    }

    #[test]
    fn unpack_rejects_trailing_garbage() {
        let mut packed = pack(&[]);
        packed.push(0xFF);
        assert!(unpack(&packed).is_err());
    }

    #[test]
    fn group_id_is_deterministic_and_within_range() {
        for key in ["a", "b", "some-long-key-name"] {
            let g1 = group_id(key, 17);
            let g2 = group_id(key, 17);
            assert_eq!(g1, g2);
            assert!(g1 < 17);
        }
    }
}
