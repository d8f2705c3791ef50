//! The 200-byte header that opens every booklet file.
//!
//! ```text
//! 0..16    magic "BOOKLET1\0\0\0\0\0\0\0\0"
//! 16..49   reserved
//! 49..65   uuid (16 bytes)
//! 65..73   file_timestamp, u64 BE, microseconds
//! 73..77   n_buckets, u32 BE
//! 77..81   n_keys, u32 BE           (n_keys_pos = 77)
//! 81..200  reserved
//! ```
//!
//! The internal layout is not part of the contract the rest of the workspace
//! relies on (see `spec.md` §4.2): only the byte ranges that the remote
//! protocol inherits (uuid at 49..65, a timestamp, and a zeroable key count)
//! are load-bearing outside this module.

pub const HEADER_LEN: usize = 200;
pub const MAGIC: &[u8; 16] = b"BOOKLET1\0\0\0\0\0\0\0\0";
pub const UUID_POS: usize = 49;
pub const UUID_LEN: usize = 16;
pub const FILE_TIMESTAMP_POS: usize = 65;
pub const N_BUCKETS_POS: usize = 73;
pub const N_KEYS_POS: usize = 77;

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub uuid: uuid::Uuid,
    pub file_timestamp: u64,
    pub n_buckets: u32,
    pub n_keys: u32,
}

impl Header {
    pub fn new(uuid: uuid::Uuid, n_buckets: u32) -> Self {
        Self {
            uuid,
            file_timestamp: 0,
            n_buckets,
            n_keys: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..16].copy_from_slice(MAGIC);
        buf[UUID_POS..UUID_POS + UUID_LEN].copy_from_slice(self.uuid.as_bytes());
        buf[FILE_TIMESTAMP_POS..FILE_TIMESTAMP_POS + 8]
            .copy_from_slice(&self.file_timestamp.to_be_bytes());
        buf[N_BUCKETS_POS..N_BUCKETS_POS + 4].copy_from_slice(&self.n_buckets.to_be_bytes());
        buf[N_KEYS_POS..N_KEYS_POS + 4].copy_from_slice(&self.n_keys.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN || &buf[0..16] != MAGIC {
            return None;
        }
        let uuid = uuid::Uuid::from_slice(&buf[UUID_POS..UUID_POS + UUID_LEN]).ok()?;
        let file_timestamp =
            u64::from_be_bytes(buf[FILE_TIMESTAMP_POS..FILE_TIMESTAMP_POS + 8].try_into().ok()?);
        let n_buckets =
            u32::from_be_bytes(buf[N_BUCKETS_POS..N_BUCKETS_POS + 4].try_into().ok()?);
        let n_keys = u32::from_be_bytes(buf[N_KEYS_POS..N_KEYS_POS + 4].try_into().ok()?);
        Some(Self {
            uuid,
            file_timestamp,
            n_buckets,
            n_keys,
        })
    }

    /// The first 200 bytes with `n_keys` zeroed, as uploaded in the remote header object
    /// (spec.md §4.5(e) / §9: the remote's authoritative key count lives in the Remote Index,
    /// not in any one client's header).
    pub fn encode_with_zeroed_n_keys(&self) -> [u8; HEADER_LEN] {
        let mut buf = self.encode();
        buf[N_KEYS_POS..N_KEYS_POS + 4].copy_from_slice(&0u32.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let h = Header {
            uuid: uuid::Uuid::new_v4(),
            file_timestamp: 123_456_789,
            n_buckets: 12007,
            n_keys: 42,
        };
        let buf = h.encode();
        let h2 = Header::decode(&buf).unwrap();
        assert_eq!(h.uuid, h2.uuid);
        assert_eq!(h.file_timestamp, h2.file_timestamp);
        assert_eq!(h.n_buckets, h2.n_buckets);
        assert_eq!(h.n_keys, h2.n_keys);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = [0u8; HEADER_LEN];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn zeroes_n_keys_for_upload() {
        let h = Header {
            uuid: uuid::Uuid::new_v4(),
            file_timestamp: 1,
            n_buckets: 1,
            n_keys: 99,
        };
        let buf = h.encode_with_zeroed_n_keys();
        assert_eq!(Header::decode(&buf).unwrap().n_keys, 0);
    }
}
