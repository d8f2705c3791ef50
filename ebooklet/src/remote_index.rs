//! The Remote Index (C3): a local mirror of the remote's per-key
//! timestamps, one fixed-length 7-byte entry per key. A thin wrapper over
//! `booklet`'s fixed-length mode.

use std::path::Path;

use booklet::OpenMode;

use crate::error::Result;
use crate::group_codec::{decode_be7, encode_be7};

pub struct RemoteIndex {
    store: booklet::Store,
    path: std::path::PathBuf,
}

impl RemoteIndex {
    /// `<local>.remote_index`, sibling of the main Local Store file.
    pub fn sibling_path(local_path: &Path) -> std::path::PathBuf {
        let mut name = local_path.file_name().unwrap_or_default().to_os_string();
        name.push(".remote_index");
        local_path.with_file_name(name)
    }

    pub fn open(path: impl AsRef<Path>, mode: OpenMode, n_buckets: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Ok(Self {
            store: booklet::Store::open_fixed(&path, mode, n_buckets, 7)?,
            path,
        })
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.store
            .get(key)
            .map(|bytes| decode_be7(bytes.try_into().expect("remote index entries are 7 bytes")))
    }

    pub fn set(&mut self, key: &str, timestamp: u64) -> Result<()> {
        self.store.set(key, encode_be7(timestamp).to_vec(), Some(timestamp))?;
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<()> {
        self.store.del(key)?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.contains(key)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.store.keys()
    }

    /// Raw file bytes, used as the body of the header object on push
    /// (spec.md §4.5e): the remote's authoritative key count lives here,
    /// not in any one client's header.
    pub fn file_bytes(&mut self) -> Result<Vec<u8>> {
        self.store.sync()?;
        std::fs::read(&self.path).map_err(|source| {
            booklet::Error::Io {
                path: self.path.clone(),
                source,
            }
            .into()
        })
    }

    pub fn sync(&mut self) -> Result<()> {
        self.store.sync()?;
        Ok(())
    }

    /// Atomically replaces the on-disk remote index with `bytes`, the body
    /// of the remote's header object (spec.md §4.5a, §6). Called before the
    /// long-lived handle for this session is opened, under an exclusive
    /// advisory lock so a concurrent reader never observes a torn write.
    pub fn overwrite_with_remote_bytes(path: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
        use nix::fcntl::{flock, FlockArg};
        use std::io::Write;
        use std::os::fd::AsRawFd;

        let path = path.as_ref();
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| booklet::Error::Io { path: path.to_path_buf(), source })?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|_| booklet::Error::Locked { path: path.to_path_buf() })?;
        file.set_len(0)
            .and_then(|_| file.write_all(bytes))
            .map_err(|source| booklet::Error::Io { path: path.to_path_buf(), source })?;
        Ok(())
    }
}
