//! A keyed byte store on disk, with per-key microsecond timestamps, a file
//! UUID, a file timestamp, and a 200-byte `init_bytes` header.
//!
//! This is the "Booklet" primitive: a dbm-style local file. The rest of the
//! workspace (`ebooklet`) treats it as a black box with the contract
//! described in this crate's public API; the on-disk layout in [`header`] is
//! an implementation detail.

mod error;
mod header;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};

pub use error::{Error, Result};
pub use header::{Header, HEADER_LEN};

/// The key under which user metadata is stored, both locally and (translated
/// to `_metadata`) on the remote. Not a valid user-facing key.
pub const METADATA_KEY: &str = "\u{0}metadata";

/// How a store is opened, mirroring the dbm `flag` convention of spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `r` - read-only, the file must already exist.
    Read,
    /// `w` - read/write, the file must already exist.
    Write,
    /// `c` - read/write, created if absent.
    Create,
    /// `n` - always a fresh, empty file.
    New,
}

impl OpenMode {
    pub fn is_write(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

#[derive(Debug, Clone)]
struct Record {
    timestamp: u64,
    value: Vec<u8>,
}

/// A single booklet file: header + an in-memory index of every key, loaded
/// eagerly on open and rewritten compactly on [`Store::sync`].
pub struct Store {
    path: PathBuf,
    file: File,
    header: Header,
    entries: BTreeMap<String, Record>,
    fixed_value_len: Option<u32>,
    mode: OpenMode,
    buffer_size: usize,
    dirty: bool,
}

fn io_err(path: &Path, source: std::io::Error) -> Error {
    Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Store {
    /// Opens (or creates) a booklet file.
    ///
    /// `init_bytes`, when given, seeds the header (uuid + file_timestamp) of
    /// a freshly created file — used when a local file is born by inheriting
    /// a remote object's header (spec.md §3, Lifecycles).
    pub fn open(
        path: impl AsRef<Path>,
        mode: OpenMode,
        n_buckets: u32,
        buffer_size: usize,
        init_bytes: Option<&[u8]>,
    ) -> Result<Self> {
        Self::open_with_value_len(path, mode, n_buckets, buffer_size, init_bytes, None)
    }

    /// Opens a fixed-length-value store (used for the Remote Index and the
    /// Changelog: spec.md §4.3 and §4.5(c)).
    pub fn open_fixed(
        path: impl AsRef<Path>,
        mode: OpenMode,
        n_buckets: u32,
        value_len: u32,
    ) -> Result<Self> {
        Self::open_with_value_len(path, mode, n_buckets, 1 << 16, None, Some(value_len))
    }

    fn open_with_value_len(
        path: impl AsRef<Path>,
        mode: OpenMode,
        n_buckets: u32,
        buffer_size: usize,
        init_bytes: Option<&[u8]>,
        fixed_value_len: Option<u32>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists() && mode != OpenMode::New;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(mode != OpenMode::Read)
            .truncate(mode == OpenMode::New)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        if mode.is_write() {
            flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|_| Error::Locked {
                path: path.clone(),
            })?;
        }

        let (header, entries) = if exists {
            let mut buf = Vec::new();
            let mut f = &file;
            f.read_to_end(&mut buf).map_err(|e| io_err(&path, e))?;
            if buf.is_empty() {
                (Header::new(uuid::Uuid::new_v4(), n_buckets), BTreeMap::new())
            } else {
                let header = Header::decode(&buf).ok_or_else(|| Error::CorruptHeader {
                    path: path.clone(),
                })?;
                let entries = decode_records(&buf[HEADER_LEN..]);
                (header, entries)
            }
        } else {
            let header = match init_bytes {
                Some(bytes) => {
                    let mut h = Header::decode(bytes).ok_or_else(|| Error::CorruptHeader {
                        path: path.clone(),
                    })?;
                    h.n_keys = 0;
                    h
                }
                None => Header::new(uuid::Uuid::new_v4(), n_buckets),
            };
            (header, BTreeMap::new())
        };

        let mut store = Self {
            path,
            file,
            header,
            entries,
            fixed_value_len,
            mode,
            buffer_size,
            dirty: !exists,
        };
        if !exists {
            store.rewrite()?;
        }
        Ok(store)
    }

    pub fn uuid(&self) -> uuid::Uuid {
        self.header.uuid
    }

    pub fn file_timestamp(&self) -> u64 {
        self.header.file_timestamp
    }

    pub fn set_file_timestamp(&mut self, ts: u64) {
        self.header.file_timestamp = ts;
        self.dirty = true;
    }

    pub fn n_buckets(&self) -> u32 {
        self.header.n_buckets
    }

    /// The raw 200-byte header, as it currently stands on disk (`n_keys` reflects
    /// this client's local key count, not the remote's — callers that need the
    /// upload-ready variant use [`Store::init_bytes_for_upload`]).
    pub fn init_bytes(&self) -> [u8; HEADER_LEN] {
        let mut h = self.header;
        h.n_keys = self.entries.len() as u32;
        h.encode()
    }

    pub fn init_bytes_for_upload(&self) -> [u8; HEADER_LEN] {
        let mut h = self.header;
        h.n_keys = self.entries.len() as u32;
        h.encode_with_zeroed_n_keys()
    }

    fn require_writable(&self) -> Result<()> {
        if self.mode.is_write() {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    fn check_value_len(&self, value: &[u8]) -> Result<()> {
        if let Some(expected) = self.fixed_value_len {
            if value.len() != expected as usize {
                return Err(Error::WrongValueLength {
                    expected: expected as usize,
                    actual: value.len(),
                });
            }
        }
        Ok(())
    }

    /// Writes `key => value`. If `timestamp` is `None`, assigns one strictly
    /// greater than the key's previous timestamp (spec.md §3 Invariant 2).
    /// If `timestamp` is `Some`, it is used verbatim — used both by
    /// `set_timestamp`-style explicit overrides and by the sync engine when
    /// writing values pulled from the remote (which carries its own
    /// timestamp and must not be re-stamped).
    pub fn set(&mut self, key: &str, value: Vec<u8>, timestamp: Option<u64>) -> Result<()> {
        self.require_writable()?;
        self.check_value_len(&value)?;

        let ts = match timestamp {
            Some(ts) => ts,
            None => {
                let now = now_us();
                match self.entries.get(key) {
                    Some(prev) if prev.timestamp >= now => prev.timestamp + 1,
                    _ => now,
                }
            }
        };

        self.entries.insert(key.to_string(), Record { timestamp: ts, value });
        self.dirty = true;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|r| r.value.as_slice())
    }

    pub fn get_timestamp(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|r| r.timestamp)
    }

    pub fn get_timestamp_and_value(&self, key: &str) -> Option<(u64, &[u8])> {
        self.entries.get(key).map(|r| (r.timestamp, r.value.as_slice()))
    }

    pub fn set_timestamp(&mut self, key: &str, timestamp: u64) -> Result<()> {
        self.require_writable()?;
        match self.entries.get_mut(key) {
            Some(r) => {
                r.timestamp = timestamp;
                self.dirty = true;
                Ok(())
            }
            None => Err(Error::KeyMissing(key.to_string())),
        }
    }

    pub fn del(&mut self, key: &str) -> Result<()> {
        self.require_writable()?;
        if self.entries.remove(key).is_some() {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn timestamps(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(k, r)| (k.as_str(), r.timestamp))
    }

    pub fn items(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, r)| (k.as_str(), r.value.as_slice()))
    }

    pub fn set_metadata(&mut self, data: Vec<u8>, timestamp: Option<u64>) -> Result<()> {
        self.set(METADATA_KEY, data, timestamp)
    }

    pub fn get_metadata(&self) -> Option<&[u8]> {
        self.get(METADATA_KEY)
    }

    /// Removes keys older than `timestamp` (or all keys, if `None`), returning the
    /// number of keys removed. `reindex`, when set, adjusts the recorded
    /// `n_buckets` — the on-disk layout here doesn't bucket, so this only
    /// updates the header field for fidelity with the spec.md §4.2 contract.
    pub fn prune(&mut self, timestamp: Option<u64>, reindex: Option<u32>) -> Result<usize> {
        self.require_writable()?;
        let before = self.entries.len();
        match timestamp {
            Some(ts) => self.entries.retain(|_, r| r.timestamp >= ts),
            None => self.entries.clear(),
        }
        if let Some(n) = reindex {
            self.header.n_buckets = n;
        }
        self.dirty = true;
        let removed = before - self.entries.len();
        self.sync()?;
        Ok(removed)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.require_writable()?;
        self.entries.clear();
        self.dirty = true;
        Ok(())
    }

    /// Flushes the in-memory index to disk as a compact rewrite.
    pub fn sync(&mut self) -> Result<()> {
        if self.dirty {
            self.rewrite()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Rewrites the file compactly in place, on the already-open (and, for
    /// writers, already-flocked) file handle. A temp-file-plus-rename here
    /// would swap the directory entry to a new inode out from under the held
    /// flock (`flock` locks an open file description, not a path), letting a
    /// second open silently acquire a lock on the fresh inode instead of
    /// contending with this one.
    fn rewrite(&mut self) -> Result<()> {
        self.header.n_keys = self.entries.len() as u32;

        let mut buf = Vec::with_capacity(self.buffer_size);
        buf.extend_from_slice(&self.header.encode());
        for (key, record) in &self.entries {
            encode_record(&mut buf, key, record.timestamp, &record.value)
                .map_err(|e| io_err(&self.path, e))?;
        }

        use std::io::{Seek, SeekFrom};
        self.file.set_len(0).map_err(|e| io_err(&self.path, e))?;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| io_err(&self.path, e))?;
        self.file.write_all(&buf).map_err(|e| io_err(&self.path, e))?;
        self.file.flush().map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }
}

fn encode_record(w: &mut impl Write, key: &str, timestamp: u64, value: &[u8]) -> std::io::Result<()> {
    let key_bytes = key.as_bytes();
    w.write_all(&(key_bytes.len() as u16).to_be_bytes())?;
    w.write_all(key_bytes)?;
    w.write_all(&timestamp.to_be_bytes())?;
    w.write_all(&(value.len() as u32).to_be_bytes())?;
    w.write_all(value)?;
    Ok(())
}

fn decode_records(mut data: &[u8]) -> BTreeMap<String, Record> {
    let mut out = BTreeMap::new();
    while data.len() >= 2 {
        let key_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let mut off = 2;
        if data.len() < off + key_len + 8 + 4 {
            break;
        }
        let key = match std::str::from_utf8(&data[off..off + key_len]) {
            Ok(s) => s.to_string(),
            Err(_) => break,
        };
        off += key_len;
        let timestamp = u64::from_be_bytes(data[off..off + 8].try_into().unwrap());
        off += 8;
        let value_len = u32::from_be_bytes(data[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        if data.len() < off + value_len {
            break;
        }
        let value = data[off..off + value_len].to_vec();
        off += value_len;
        out.insert(key, Record { timestamp, value });
        data = &data[off..];
    }
    out
}

fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("db.blt");
        let mut store = Store::open(&path, OpenMode::New, 1009, 1 << 16, None).unwrap();
        store.set("a", b"1".to_vec(), None).unwrap();
        assert_eq!(store.get("a"), Some(b"1".as_slice()));
        assert!(store.get_timestamp("a").unwrap() > 0);
    }

    #[test]
    fn timestamps_are_monotonic_per_key() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("db.blt");
        let mut store = Store::open(&path, OpenMode::New, 1009, 1 << 16, None).unwrap();
        store.set("a", b"1".to_vec(), Some(100)).unwrap();
        store.set("a", b"2".to_vec(), Some(100)).unwrap();
        // explicit timestamps are honoured verbatim; the monotonic bump only
        // applies to auto-assigned (`None`) timestamps.
        assert_eq!(store.get_timestamp("a"), Some(100));

        store.set("b", b"1".to_vec(), None).unwrap();
        let t1 = store.get_timestamp("b").unwrap();
        store.set("b", b"2".to_vec(), None).unwrap();
        let t2 = store.get_timestamp("b").unwrap();
        assert!(t2 > t1);
    }

    #[test]
    fn survives_reopen() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("db.blt");
        let uuid;
        {
            let mut store = Store::open(&path, OpenMode::New, 1009, 1 << 16, None).unwrap();
            store.set("a", b"hello".to_vec(), None).unwrap();
            store.sync().unwrap();
            uuid = store.uuid();
        }
        let store = Store::open(&path, OpenMode::Write, 1009, 1 << 16, None).unwrap();
        assert_eq!(store.get("a"), Some(b"hello".as_slice()));
        assert_eq!(store.uuid(), uuid);
    }

    #[test]
    fn init_bytes_inherits_uuid_and_zeroes_n_keys_for_upload() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src.blt");
        let mut src = Store::open(&src_path, OpenMode::New, 1009, 1 << 16, None).unwrap();
        src.set("a", b"1".to_vec(), None).unwrap();
        src.set("b", b"2".to_vec(), None).unwrap();
        let init_bytes = src.init_bytes();

        let dst_path = dir.path().join("dst.blt");
        let dst = Store::open(&dst_path, OpenMode::New, 1009, 1 << 16, Some(&init_bytes)).unwrap();
        assert_eq!(dst.uuid(), src.uuid());
        assert_eq!(dst.len(), 0);
        assert_eq!(Header::decode(&dst.init_bytes_for_upload()).unwrap().n_keys, 0);
    }

    #[test]
    fn second_write_open_is_locked() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("db.blt");
        let _store = Store::open(&path, OpenMode::New, 1009, 1 << 16, None).unwrap();
        let second = Store::open(&path, OpenMode::Write, 1009, 1 << 16, None);
        assert!(matches!(second, Err(Error::Locked { .. })));
    }

    #[test]
    fn prune_removes_old_keys() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("db.blt");
        let mut store = Store::open(&path, OpenMode::New, 1009, 1 << 16, None).unwrap();
        store.set("old", b"1".to_vec(), Some(10)).unwrap();
        store.set("new", b"2".to_vec(), Some(1000)).unwrap();
        let removed = store.prune(Some(500), None).unwrap();
        assert_eq!(removed, 1);
        assert!(!store.contains("old"));
        assert!(store.contains("new"));
    }

    #[test]
    fn metadata_uses_reserved_key() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("db.blt");
        let mut store = Store::open(&path, OpenMode::New, 1009, 1 << 16, None).unwrap();
        store.set_metadata(b"{}".to_vec(), None).unwrap();
        assert_eq!(store.get_metadata(), Some(b"{}".as_slice()));
        assert!(!store.keys().any(|k| k == "user-visible-key"));
    }

    #[test]
    fn fixed_value_store_rejects_wrong_length() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.blt");
        let mut store = Store::open_fixed(&path, OpenMode::New, 1009, 7).unwrap();
        store.set("a", vec![0u8; 7], Some(1)).unwrap();
        let err = store.set("b", vec![0u8; 3], Some(1)).unwrap_err();
        assert!(matches!(err, Error::WrongValueLength { expected: 7, actual: 3 }));
    }
}
