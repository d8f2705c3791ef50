//! The Database façade (C6): the public entry point, generic over the
//! transport and over a read/write capability marker checked at compile time
//! (spec.md §4.6, §9 redesign note).
//!
//! Opening always gives the handle write capability over its *local* files -
//! a read-only client still has to create or update its local cache on a
//! pull (spec.md §8, scenario 2). `ReadOnly`/`ReadWrite` instead gate which
//! *façade* methods are reachable: `set`/`del`/`push`/`clear` all require
//! `Mode = ReadWrite`. This is the one point where the type parameter
//! narrows behaviour below what the underlying `booklet::Store` permits.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use remote_storage::RemoteStorage;

use crate::error::{Error, Result};
use crate::remote_index::RemoteIndex;
use crate::sync as sync_engine;

mod private {
    pub trait Sealed {}
    impl Sealed for super::ReadOnly {}
    impl Sealed for super::ReadWrite {}
}

/// Capability marker sealed to this crate's two modes.
pub trait Mode: private::Sealed {}

/// A handle that can read and pull, but never mutate or push.
pub struct ReadOnly;
/// A handle that can additionally write and push.
pub struct ReadWrite;

impl Mode for ReadOnly {}
impl Mode for ReadWrite {}

/// The user-visible name of the reserved metadata slot (spec.md §3, §9):
/// the façade translates this name to the Local Store's own reserved key
/// on the way in and out, so a user-provided key is never allowed to
/// collide with it.
pub const RESERVED_METADATA_KEY: &str = "_metadata";

/// The dbm-style open flag, named after the Python convention this library's
/// on-disk format is drawn from (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlag {
    /// `r` - read-only; both the local file and the remote database must
    /// already exist (in some form).
    Read,
    /// `w` - read/write; the local file must already exist.
    Write,
    /// `c` - read/write, creating the local file if absent.
    Create,
    /// `n` - always start from a fresh, empty local file, wiping the remote
    /// database's existing objects on the first `push`.
    New,
}

/// Builder for opening a [`Database`] (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct OpenOptions {
    flag: OpenFlag,
    n_buckets: u32,
    buffer_size: usize,
    num_groups: Option<u32>,
    threads: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            flag: OpenFlag::Create,
            n_buckets: 1009,
            buffer_size: 1 << 16,
            num_groups: None,
            threads: 8,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(mut self, flag: OpenFlag) -> Self {
        self.flag = flag;
        self
    }

    pub fn n_buckets(mut self, n_buckets: u32) -> Self {
        self.n_buckets = n_buckets;
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Enables the Group Codec (spec.md §4.4): keys are bucketed into this
    /// many remote objects instead of uploaded one object per key.
    pub fn num_groups(mut self, num_groups: u32) -> Self {
        self.num_groups = Some(num_groups);
        self
    }

    /// Bounds concurrent in-flight pull/push requests (spec.md §9).
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub async fn open<T: RemoteStorage, M: Mode>(
        self,
        local_path: impl AsRef<Path>,
        db_key: impl Into<String>,
        transport: T,
    ) -> Result<Database<T, M>> {
        let local_path = local_path.as_ref().to_path_buf();
        let db_key = db_key.into();
        let (local, remote_index, opened_new) = sync_engine::open_and_reconcile(
            &local_path,
            &db_key,
            &transport,
            self.flag,
            self.n_buckets,
            self.buffer_size,
        )
        .await?;

        Ok(Database {
            local,
            remote_index,
            transport: Arc::new(transport),
            db_key,
            local_path,
            num_groups: self.num_groups,
            threads: self.threads,
            opened_new,
            pending_deletes: HashSet::new(),
            _marker: PhantomData,
        })
    }
}

/// A handle on one database: a Local Store, its Remote Index, and the
/// transport used to reach the remote copy (spec.md §4.6).
pub struct Database<T: RemoteStorage, M> {
    local: booklet::Store,
    remote_index: RemoteIndex,
    transport: Arc<T>,
    db_key: String,
    local_path: PathBuf,
    num_groups: Option<u32>,
    threads: usize,
    opened_new: bool,
    pending_deletes: HashSet<String>,
    _marker: PhantomData<M>,
}

impl<T: RemoteStorage, M: Mode> Database<T, M> {
    pub fn uuid(&self) -> uuid::Uuid {
        self.local.uuid()
    }

    pub fn db_key(&self) -> &str {
        &self.db_key
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// A key is present if either the local cache or the Remote Index
    /// (the remote's authoritative key set) knows about it.
    pub fn contains(&self, key: &str) -> bool {
        self.local.contains(key) || self.remote_index.contains(key)
    }

    /// Iteration order, and so `len`, follow the Remote Index when it is
    /// non-empty - the remote's authoritative key set - and the Local
    /// Store otherwise (spec.md §4.6).
    pub fn len(&self) -> usize {
        if self.remote_index.is_empty() {
            self.local.len()
        } else {
            self.remote_index.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        if self.remote_index.is_empty() {
            Box::new(self.local.keys())
        } else {
            Box::new(self.remote_index.keys())
        }
    }

    /// The timestamp known for `key`: the local one if present and at
    /// least as new as the Remote Index's, else the Remote Index's.
    fn timestamp_of(&self, key: &str) -> Option<u64> {
        let lt = self.local.get_timestamp(key);
        let rt = self.remote_index.get(key);
        match (lt, rt) {
            (Some(lt), Some(rt)) => Some(lt.max(rt)),
            (Some(lt), None) => Some(lt),
            (None, rt) => rt,
        }
    }

    /// The timestamp known for `key` (spec.md §4.6). `include_value = true`
    /// additionally pulls the key first if the local copy is stale or
    /// missing, and returns it alongside the timestamp (spec.md §4.5b).
    pub async fn get_timestamp(&mut self, key: &str, include_value: bool) -> Result<Option<(u64, Option<Vec<u8>>)>> {
        let value = if include_value {
            sync_engine::pull_one(
                &mut self.local,
                &self.remote_index,
                &*self.transport,
                &self.db_key,
                self.num_groups,
                key,
            )
            .await?
        } else {
            None
        };
        Ok(self.timestamp_of(key).map(|ts| (ts, value)))
    }

    /// A view over the local-ahead keys (the changelog), plus the
    /// operations that act on it (spec.md §4.6).
    pub fn changes(&mut self) -> Changes<'_, T, M> {
        Changes { db: self }
    }

    /// Reads a key, pulling it from the remote first if the Remote Index
    /// shows a newer timestamp than the local copy (spec.md §4.5b).
    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        sync_engine::pull_one(
            &mut self.local,
            &self.remote_index,
            &*self.transport,
            &self.db_key,
            self.num_groups,
            key,
        )
        .await
    }

    /// Reads straight from the local cache, without consulting the remote.
    pub fn get_local(&self, key: &str) -> Option<&[u8]> {
        self.local.get(key)
    }

    pub fn get_metadata_local(&self) -> Option<&[u8]> {
        self.local.get_metadata()
    }

    /// Reads the user metadata blob, pulling it from the remote first if
    /// the Remote Index shows a newer timestamp for the reserved key than
    /// the local copy (spec.md §4.5b, §4.6). `include_timestamp` additionally
    /// returns the timestamp the returned bytes carry.
    pub async fn get_metadata(&mut self, include_timestamp: bool) -> Result<Option<(Vec<u8>, Option<u64>)>> {
        let value = sync_engine::pull_one(
            &mut self.local,
            &self.remote_index,
            &*self.transport,
            &self.db_key,
            self.num_groups,
            booklet::METADATA_KEY,
        )
        .await?;
        Ok(value.map(|v| {
            let ts = if include_timestamp {
                self.local.get_timestamp(booklet::METADATA_KEY)
            } else {
                None
            };
            (v, ts)
        }))
    }

    /// Every value, pulling any key whose local copy is stale or missing
    /// first, fanned out over the configured thread pool (spec.md §4.5b).
    pub async fn values(&mut self) -> Result<Vec<Vec<u8>>> {
        let keys: Vec<String> = self.keys().map(str::to_string).collect();
        sync_engine::pull_many(
            &mut self.local,
            &self.remote_index,
            &self.transport,
            &self.db_key,
            self.num_groups,
            self.threads,
            keys.clone(),
        )
        .await?;
        Ok(keys.into_iter().filter_map(|k| self.local.get(&k).map(<[u8]>::to_vec)).collect())
    }

    /// Every `(key, value)` pair, with the same pull-before-read guarantee
    /// as [`Database::values`] (spec.md §4.5b, §4.6).
    pub async fn items(&mut self) -> Result<Vec<(String, Vec<u8>)>> {
        let keys: Vec<String> = self.keys().map(str::to_string).collect();
        sync_engine::pull_many(
            &mut self.local,
            &self.remote_index,
            &self.transport,
            &self.db_key,
            self.num_groups,
            self.threads,
            keys.clone(),
        )
        .await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| {
                let value = self.local.get(&k)?.to_vec();
                Some((k, value))
            })
            .collect())
    }

    /// Every `(key, timestamp)` pair, or `(key, timestamp, value)` when
    /// `include_value` is set - which also pulls any stale or missing value
    /// first, fanned out the same way as [`Database::values`] (spec.md §4.6).
    pub async fn timestamps(&mut self, include_value: bool) -> Result<Vec<(String, u64, Option<Vec<u8>>)>> {
        let keys: Vec<String> = self.keys().map(str::to_string).collect();
        if include_value {
            sync_engine::pull_many(
                &mut self.local,
                &self.remote_index,
                &self.transport,
                &self.db_key,
                self.num_groups,
                self.threads,
                keys.clone(),
            )
            .await?;
        }
        Ok(keys
            .into_iter()
            .filter_map(|k| {
                let ts = self.timestamp_of(&k)?;
                let value = if include_value { self.local.get(&k).map(<[u8]>::to_vec) } else { None };
                Some((k, ts, value))
            })
            .collect())
    }

    /// Reads several keys at once, pulling any that are stale or missing
    /// concurrently over the configured thread pool (spec.md §4.5b).
    pub async fn get_items(&mut self, keys: &[String]) -> Result<Vec<(String, Option<Vec<u8>>)>> {
        sync_engine::pull_many(
            &mut self.local,
            &self.remote_index,
            &self.transport,
            &self.db_key,
            self.num_groups,
            self.threads,
            keys.to_vec(),
        )
        .await?;
        Ok(keys.iter().map(|k| (k.clone(), self.local.get(k).map(<[u8]>::to_vec))).collect())
    }

    /// Brings every key the Remote Index knows about up to date locally.
    pub async fn pull(&mut self) -> Result<()> {
        sync_engine::pull_all(
            &mut self.local,
            &self.remote_index,
            &self.transport,
            &self.db_key,
            self.num_groups,
            self.threads,
        )
        .await
    }

    /// Flushes the Local Store and Remote Index to disk without touching
    /// the network.
    pub fn sync(&mut self) -> Result<()> {
        self.local.sync()?;
        self.remote_index.sync()?;
        Ok(())
    }

    /// Releases this handle (spec.md §4.6, §5): flushes the Local Store and
    /// Remote Index exactly as [`Database::sync`] does, then consumes the
    /// handle. This crate never leaves a pull or push running past the
    /// `.await` that issued it, so there's no outstanding work for `force`
    /// to act on beyond that flush - the flag is kept for interface parity
    /// with a caller choosing between draining and cancelling.
    pub fn close(mut self, force: bool) -> Result<()> {
        let _ = force;
        self.sync()
    }
}

impl<T: RemoteStorage> Database<T, ReadWrite> {
    /// Rejects the reserved metadata key name (spec.md §8 Boundary cases,
    /// §9) - use [`Database::set_metadata`] to write that slot instead.
    pub fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        if key == RESERVED_METADATA_KEY || key == booklet::METADATA_KEY {
            return Err(Error::ReservedKey(key.to_string()));
        }
        self.local.set(key, value, None)?;
        Ok(())
    }

    /// Sets every `(key, value)` pair from `items` (spec.md §4.6).
    pub fn update(&mut self, items: impl IntoIterator<Item = (String, Vec<u8>)>) -> Result<()> {
        for (key, value) in items {
            self.set(&key, value)?;
        }
        Ok(())
    }

    pub fn del(&mut self, key: &str) -> Result<()> {
        if self.remote_index.contains(key) {
            self.pending_deletes.insert(key.to_string());
        }
        self.local.del(key)?;
        Ok(())
    }

    pub fn set_metadata(&mut self, data: Vec<u8>) -> Result<()> {
        self.local.set_metadata(data, None)?;
        Ok(())
    }

    pub fn set_timestamp(&mut self, key: &str, timestamp: u64) -> Result<()> {
        self.local.set_timestamp(key, timestamp)?;
        Ok(())
    }

    /// Drops keys older than `timestamp` (or all keys, if `None`) from the
    /// local cache only; does not touch the remote.
    pub fn prune(&mut self, timestamp: Option<u64>, reindex: Option<u32>) -> Result<usize> {
        Ok(self.local.prune(timestamp, reindex)?)
    }

    /// Empties the local cache (spec.md §4.6). `local_only = true` (the
    /// default contract) leaves the remote's copies untouched; `local_only
    /// = false` additionally stages every key the Remote Index knows about
    /// for deletion on the next push.
    pub fn clear(&mut self, local_only: bool) -> Result<()> {
        if !local_only {
            for key in self.local.keys().map(str::to_string).collect::<Vec<_>>() {
                if self.remote_index.contains(&key) {
                    self.pending_deletes.insert(key);
                }
            }
        }
        self.local.clear()?;
        Ok(())
    }

    /// Uploads the accumulated changelog and pending deletes (spec.md §4.5d),
    /// then finalises the header (spec.md §4.5e). `force_push` uploads the
    /// header even if some keys failed, or if nothing changed at all.
    pub async fn push(&mut self, force_push: bool) -> Result<()> {
        if !self.transport.writable() {
            return Err(Error::NotWritable);
        }
        sync_engine::push(
            &mut self.local,
            &mut self.remote_index,
            &self.transport,
            &self.db_key,
            self.num_groups,
            self.threads,
            force_push,
            &mut self.pending_deletes,
            &mut self.opened_new,
        )
        .await
    }
}

impl<T: RemoteStorage, M> Drop for Database<T, M> {
    fn drop(&mut self) {
        let _ = self.local.sync();
        let _ = self.remote_index.sync();
    }
}

/// A view onto a database's unpushed local changes (spec.md §4.6): the
/// changelog itself, plus the operations that act on it. Borrowed from a
/// [`Database`] rather than owned, so it never outlives the handle it came
/// from.
pub struct Changes<'a, T: RemoteStorage, M> {
    db: &'a mut Database<T, M>,
}

impl<'a, T: RemoteStorage, M: Mode> Changes<'a, T, M> {
    /// Every `(key, local_ts, remote_ts)` triple where the local copy is
    /// ahead of what the Remote Index records (spec.md §4.5c).
    pub fn iter_changes(&self) -> Vec<(String, u64, u64)> {
        sync_engine::build_changelog(&self.db.local, &self.db.remote_index)
    }

    pub async fn pull(&mut self) -> Result<()> {
        self.db.pull().await
    }
}

impl<'a, T: RemoteStorage> Changes<'a, T, ReadWrite> {
    /// Drops local-ahead entries, reverting each named key (or, if `keys`
    /// is `None`, every key in the changelog) back to what the remote
    /// currently holds - or removing it locally if the remote has no copy.
    pub async fn discard(&mut self, keys: Option<&[String]>) -> Result<()> {
        let targets: Vec<String> = match keys {
            Some(keys) => keys.to_vec(),
            None => self.iter_changes().into_iter().map(|(k, _, _)| k).collect(),
        };
        for key in targets {
            if self.db.remote_index.contains(&key) {
                sync_engine::force_refresh_one(
                    &mut self.db.local,
                    &*self.db.transport,
                    &self.db.db_key,
                    self.db.num_groups,
                    &key,
                )
                .await?;
            } else {
                self.db.local.del(&key)?;
            }
        }
        Ok(())
    }

    pub async fn push(&mut self, force_push: bool) -> Result<()> {
        self.db.push(force_push).await
    }
}
