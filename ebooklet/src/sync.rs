//! The Sync Engine (C5): header reconciliation on open, the lazy
//! pull-on-read path, changelog construction, and the grouped/per-key push
//! path with header finalisation (spec.md §4.5).
//!
//! Concurrent reads and uploads fan out over a `tokio::sync::Semaphore`-gated
//! `tokio::task::JoinSet`, sized to the database's configured `threads` -
//! the idiomatic-Rust reading of the original's
//! `concurrent.futures.ThreadPoolExecutor`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use remote_storage::RemoteStorage;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::db::OpenFlag;
use crate::error::{Error, Result};
use crate::group_codec::{self, GroupEntry};
use crate::remote_index::RemoteIndex;

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_micros() as u64
}

fn metadata_object_key(db_key: &str) -> String {
    format!("{db_key}/_metadata")
}

fn per_key_object_key(db_key: &str, key: &str) -> String {
    format!("{db_key}/{key}")
}

fn group_object_key(db_key: &str, group_id: u32) -> String {
    format!("{db_key}/{group_id}")
}

fn booklet_mode_for(flag: OpenFlag, exists: bool) -> booklet::OpenMode {
    match flag {
        OpenFlag::New => booklet::OpenMode::New,
        _ if exists => booklet::OpenMode::Write,
        _ => booklet::OpenMode::Create,
    }
}

/// Header reconciliation on open (spec.md §4.5a): decides whether the local
/// remote index needs to be replaced wholesale from the remote, opens (or
/// creates/truncates) the Local Store accordingly, and returns it alongside
/// the reconciled Remote Index.
pub async fn open_and_reconcile<T: RemoteStorage>(
    local_path: &Path,
    db_key: &str,
    transport: &T,
    flag: OpenFlag,
    n_buckets: u32,
    buffer_size: usize,
) -> Result<(booklet::Store, RemoteIndex, bool)> {
    let local_existed = local_path.exists();
    let session = remote_storage::open(transport, db_key).await?;

    let (local, overwrite) = if local_existed && flag == OpenFlag::New {
        let local = booklet::Store::open(local_path, booklet::OpenMode::New, n_buckets, buffer_size, None)?;
        (local, true)
    } else if local_existed {
        let local = booklet::Store::open(local_path, booklet_mode_for(flag, true), n_buckets, buffer_size, None)?;
        match &session.init_bytes {
            Some(init_bytes) => {
                let header = booklet::Header::decode(init_bytes).ok_or(Error::CorruptHeader)?;
                if header.uuid != local.uuid() {
                    return Err(Error::UuidMismatch {
                        local: local.uuid().simple().to_string(),
                        remote: header.uuid.simple().to_string(),
                    });
                }
                let overwrite = session.timestamp.unwrap_or(0) > local.file_timestamp();
                (local, overwrite)
            }
            None => (local, false),
        }
    } else if let Some(init_bytes) = &session.init_bytes {
        let booklet_mode = if flag == OpenFlag::New {
            booklet::OpenMode::New
        } else {
            booklet_mode_for(flag, false)
        };
        let local = booklet::Store::open(local_path, booklet_mode, n_buckets, buffer_size, Some(init_bytes))?;
        (local, true)
    } else {
        if flag == OpenFlag::Read {
            return Err(Error::NotReadable);
        }
        let local = booklet::Store::open(local_path, booklet_mode_for(flag, false), n_buckets, buffer_size, None)?;
        (local, true)
    };

    let remote_index_path = RemoteIndex::sibling_path(local_path);
    if overwrite && flag != OpenFlag::New {
        // The header object's body *is* the Remote Index file bytes
        // (spec.md §6); `<db_key>.remote_index` is a historical alias for
        // the same content, not a second object we ever write.
        if let Some(bytes) = &session.remote_index_bytes {
            RemoteIndex::overwrite_with_remote_bytes(&remote_index_path, bytes)?;
        }
    }
    let ri_mode = if remote_index_path.exists() {
        booklet::OpenMode::Write
    } else {
        booklet::OpenMode::New
    };
    let remote_index = RemoteIndex::open(&remote_index_path, ri_mode, local.n_buckets())?;

    Ok((local, remote_index, flag == OpenFlag::New))
}

/// Fetches the value for a single key from the remote, without touching the
/// local store - used both by `pull_one` (which then caches the result) and
/// by `pull_all`.
async fn fetch_remote_value<T: RemoteStorage>(
    transport: &T,
    db_key: &str,
    num_groups: Option<u32>,
    key: &str,
) -> Result<Option<(u64, Vec<u8>)>> {
    match num_groups {
        Some(n) => {
            let gid = group_codec::group_id(key, n);
            match transport.get_object(&group_object_key(db_key, gid)).await {
                Ok(obj) => {
                    let entries = group_codec::unpack(&obj.bytes)?;
                    Ok(entries.into_iter().find(|e| e.key == key).map(|e| (e.timestamp, e.value)))
                }
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
        None => {
            let object_key = if key == booklet::METADATA_KEY {
                metadata_object_key(db_key)
            } else {
                per_key_object_key(db_key, key)
            };
            match transport.get_object(&object_key).await {
                Ok(obj) => {
                    let ts = obj
                        .metadata
                        .get("timestamp")
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(0);
                    Ok(Some((ts, obj.bytes.to_vec())))
                }
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Lazy read (spec.md §4.5b): compares local and remote-index timestamps,
/// only reaching the network on a cache miss or a stale local copy.
pub async fn pull_one<T: RemoteStorage>(
    local: &mut booklet::Store,
    remote_index: &RemoteIndex,
    transport: &T,
    db_key: &str,
    num_groups: Option<u32>,
    key: &str,
) -> Result<Option<Vec<u8>>> {
    let rt = match remote_index.get(key) {
        None => return Ok(local.get(key).map(|v| v.to_vec())),
        Some(rt) => rt,
    };

    if let Some(lt) = local.get_timestamp(key) {
        if lt >= rt {
            return Ok(local.get(key).map(|v| v.to_vec()));
        }
    }

    match fetch_remote_value(transport, db_key, num_groups, key).await? {
        None => Ok(None),
        Some((ts, value)) => {
            local.set(key, value.clone(), Some(ts))?;
            Ok(Some(value))
        }
    }
}

/// Unconditionally overwrites the local copy of `key` with whatever the
/// remote currently holds, ignoring local timestamps - used by
/// `changes().discard()` to revert a local-ahead key back to the remote's
/// version rather than leaving the newer local write in place.
pub async fn force_refresh_one<T: RemoteStorage>(
    local: &mut booklet::Store,
    transport: &T,
    db_key: &str,
    num_groups: Option<u32>,
    key: &str,
) -> Result<()> {
    if let Some((ts, value)) = fetch_remote_value(transport, db_key, num_groups, key).await? {
        local.set(key, value, Some(ts))?;
    }
    Ok(())
}

/// Bulk pull: brings every key in the Remote Index up to date locally,
/// fanning fetches out over a bounded pool of `threads` concurrent requests.
pub async fn pull_all<T: RemoteStorage>(
    local: &mut booklet::Store,
    remote_index: &RemoteIndex,
    transport: &Arc<T>,
    db_key: &str,
    num_groups: Option<u32>,
    threads: usize,
) -> Result<()> {
    let keys: Vec<String> = remote_index.keys().map(str::to_string).collect();
    let semaphore = Arc::new(Semaphore::new(threads.max(1)));
    let mut tasks = JoinSet::new();

    for key in keys {
        let transport = Arc::clone(transport);
        let db_key = db_key.to_string();
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            let result = fetch_remote_value(&*transport, &db_key, num_groups, &key).await;
            (key, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (key, result) = joined.expect("pull task panicked");
        if let Some((ts, value)) = result? {
            local.set(&key, value, Some(ts))?;
        }
    }
    Ok(())
}

/// Brings a specific set of keys up to date locally, fetching only those
/// that are missing from the local copy or stale against the Remote Index -
/// the same check `pull_one` makes for a single key - fanned out over a
/// bounded pool of `threads` concurrent requests. Used by the façade's
/// `values()`/`items()`/`timestamps(include_value)`/`get_items()` (spec.md
/// §4.5b).
pub async fn pull_many<T: RemoteStorage>(
    local: &mut booklet::Store,
    remote_index: &RemoteIndex,
    transport: &Arc<T>,
    db_key: &str,
    num_groups: Option<u32>,
    threads: usize,
    keys: Vec<String>,
) -> Result<()> {
    let stale: Vec<String> = keys
        .into_iter()
        .filter(|key| match remote_index.get(key) {
            None => false,
            Some(rt) => local.get_timestamp(key).map(|lt| lt < rt).unwrap_or(true),
        })
        .collect();

    let semaphore = Arc::new(Semaphore::new(threads.max(1)));
    let mut tasks = JoinSet::new();
    for key in stale {
        let transport = Arc::clone(transport);
        let db_key = db_key.to_string();
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            let result = fetch_remote_value(&*transport, &db_key, num_groups, &key).await;
            (key, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (key, result) = joined.expect("pull task panicked");
        if let Some((ts, value)) = result? {
            local.set(&key, value, Some(ts))?;
        }
    }
    Ok(())
}

/// Changelog construction (spec.md §4.5c): every local key ahead of what the
/// Remote Index records, including the reserved metadata entry. A remote
/// index with no entry for a key - whether because the remote is empty or
/// the key was never pushed - yields `remote_ts == 0` for it.
pub fn build_changelog(local: &booklet::Store, remote_index: &RemoteIndex) -> Vec<(String, u64, u64)> {
    local
        .timestamps()
        .filter_map(|(key, lt)| match remote_index.get(key) {
            None => Some((key.to_string(), lt, 0)),
            Some(rt) if lt > rt => Some((key.to_string(), lt, rt)),
            _ => None,
        })
        .collect()
}

async fn delete_remote<T: RemoteStorage>(transport: &T, db_key: &str) -> Result<()> {
    let keys = transport.list_objects(db_key).await?;
    if !keys.is_empty() {
        transport.delete_objects(&keys).await?;
    }
    Ok(())
}

/// Push (spec.md §4.5d-e): uploads the changelog either grouped or per-key,
/// applies pending deletes, then finalises by uploading the remote index as
/// the header object's body. Returns the failing key set (if any) via
/// [`Error::PartialPushFailure`] - the Remote Index is still advanced for
/// every key that *did* succeed, so a retry only resends the rest.
#[allow(clippy::too_many_arguments)]
pub async fn push<T: RemoteStorage>(
    local: &mut booklet::Store,
    remote_index: &mut RemoteIndex,
    transport: &Arc<T>,
    db_key: &str,
    num_groups: Option<u32>,
    threads: usize,
    force_push: bool,
    pending_deletes: &mut HashSet<String>,
    opened_new: &mut bool,
) -> Result<()> {
    if !transport.writable() {
        return Err(Error::NotWritable);
    }

    if *opened_new {
        delete_remote(&**transport, db_key).await?;
        *opened_new = false;
    }

    let changelog = build_changelog(local, remote_index);
    if changelog.is_empty() && pending_deletes.is_empty() && !force_push {
        debug!(db_key, "push: nothing to do");
        return Ok(());
    }

    let mut failed_keys = Vec::new();

    if let Some(num_groups) = num_groups {
        push_grouped(local, remote_index, transport, db_key, num_groups, threads, &changelog, pending_deletes, &mut failed_keys).await?;
    } else {
        push_per_key(local, remote_index, transport, db_key, threads, &changelog, pending_deletes, &mut failed_keys).await?;
    }

    // The header is uploaded even on a partial failure, so a subsequent
    // reader sees whatever progress did succeed (spec.md §9, open question a).
    finalize_header(local, remote_index, transport, db_key, num_groups).await?;

    if !failed_keys.is_empty() && !force_push {
        return Err(Error::PartialPushFailure { failed_keys });
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn push_grouped<T: RemoteStorage>(
    local: &booklet::Store,
    remote_index: &mut RemoteIndex,
    transport: &Arc<T>,
    db_key: &str,
    num_groups: u32,
    threads: usize,
    changelog: &[(String, u64, u64)],
    pending_deletes: &mut HashSet<String>,
    failed_keys: &mut Vec<String>,
) -> Result<()> {
    let mut affected_groups: HashSet<u32> = HashSet::new();
    for (k, _, _) in changelog {
        if k != booklet::METADATA_KEY {
            affected_groups.insert(group_codec::group_id(k, num_groups));
        }
    }
    for k in pending_deletes.iter() {
        affected_groups.insert(group_codec::group_id(k, num_groups));
    }

    if let Some((_, lt, _)) = changelog.iter().find(|(k, _, _)| k == booklet::METADATA_KEY) {
        let value = local.get_metadata().unwrap_or(&[]).to_vec();
        let mut meta = HashMap::new();
        meta.insert("timestamp".to_string(), lt.to_string());
        match transport.put_object(&metadata_object_key(db_key), Bytes::from(value), Some(meta)).await {
            Ok(()) => remote_index.set(booklet::METADATA_KEY, *lt)?,
            Err(e) => {
                warn!(error = %e, "metadata upload failed");
                failed_keys.push(booklet::METADATA_KEY.to_string());
            }
        }
    }

    let semaphore = Arc::new(Semaphore::new(threads.max(1)));
    let mut tasks = JoinSet::new();
    for gid in affected_groups {
        let entries: Vec<GroupEntry> = local
            .items()
            .filter(|(k, _)| *k != booklet::METADATA_KEY && group_codec::group_id(k, num_groups) == gid)
            .map(|(k, v)| GroupEntry {
                key: k.to_string(),
                timestamp: local.get_timestamp(k).unwrap_or(0),
                value: v.to_vec(),
            })
            .collect();
        let transport = Arc::clone(transport);
        let db_key = db_key.to_string();
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            let result = if entries.is_empty() {
                transport.delete_object(&group_object_key(&db_key, gid)).await
            } else {
                let blob = group_codec::pack(&entries);
                transport.put_object(&group_object_key(&db_key, gid), Bytes::from(blob), None).await
            };
            (gid, entries, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (gid, entries, result) = joined.expect("push task panicked");
        match result {
            Ok(()) => {
                for entry in entries {
                    let ts = changelog
                        .iter()
                        .find(|(k, _, _)| *k == entry.key)
                        .map(|(_, lt, _)| *lt)
                        .unwrap_or(entry.timestamp);
                    remote_index.set(&entry.key, ts)?;
                    pending_deletes.remove(&entry.key);
                }
            }
            Err(e) => {
                warn!(error = %e, group_id = gid, "group upload failed");
                failed_keys.push(format!("group:{gid}"));
            }
        }
    }

    for key in pending_deletes.drain().collect::<Vec<_>>() {
        remote_index.remove(&key)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn push_per_key<T: RemoteStorage>(
    local: &booklet::Store,
    remote_index: &mut RemoteIndex,
    transport: &Arc<T>,
    db_key: &str,
    threads: usize,
    changelog: &[(String, u64, u64)],
    pending_deletes: &mut HashSet<String>,
    failed_keys: &mut Vec<String>,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(threads.max(1)));
    let mut tasks = JoinSet::new();
    for (key, lt, _) in changelog.iter().cloned() {
        let value = if key == booklet::METADATA_KEY {
            local.get_metadata().unwrap_or(&[]).to_vec()
        } else {
            local.get(&key).unwrap_or(&[]).to_vec()
        };
        let transport = Arc::clone(transport);
        let db_key = db_key.to_string();
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            let object_key = if key == booklet::METADATA_KEY {
                metadata_object_key(&db_key)
            } else {
                per_key_object_key(&db_key, &key)
            };
            let mut meta = HashMap::new();
            meta.insert("timestamp".to_string(), lt.to_string());
            let result = transport.put_object(&object_key, Bytes::from(value), Some(meta)).await;
            (key, lt, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (key, lt, result) = joined.expect("push task panicked");
        match result {
            Ok(()) => remote_index.set(&key, lt)?,
            Err(e) => {
                warn!(error = %e, key, "per-key upload failed");
                failed_keys.push(key);
            }
        }
    }

    if !pending_deletes.is_empty() {
        let keys: Vec<String> = pending_deletes.iter().cloned().collect();
        let object_keys: Vec<String> = keys.iter().map(|k| per_key_object_key(db_key, k)).collect();
        match transport.delete_objects(&object_keys).await {
            Ok(()) => {
                for k in &keys {
                    remote_index.remove(k)?;
                    pending_deletes.remove(k);
                }
            }
            Err(e) => {
                warn!(error = %e, "tombstone deletion failed");
                failed_keys.extend(keys);
            }
        }
    }
    Ok(())
}

async fn finalize_header<T: RemoteStorage>(
    local: &mut booklet::Store,
    remote_index: &mut RemoteIndex,
    transport: &Arc<T>,
    db_key: &str,
    num_groups: Option<u32>,
) -> Result<()> {
    let now = now_us();
    local.set_file_timestamp(now);
    let init_bytes = local.init_bytes_for_upload();
    let remote_index_bytes = remote_index.file_bytes()?;

    let mut header_meta = HashMap::new();
    header_meta.insert("timestamp".to_string(), now.to_string());
    header_meta.insert("uuid".to_string(), local.uuid().simple().to_string());
    header_meta.insert("type".to_string(), "ebooklet".to_string());
    header_meta.insert(
        "init_bytes".to_string(),
        base64::encode_config(init_bytes, base64::URL_SAFE_NO_PAD),
    );
    if let Some(n) = num_groups {
        header_meta.insert("num_groups".to_string(), n.to_string());
    }

    transport
        .put_db_object(db_key, Bytes::from(remote_index_bytes), Some(header_meta))
        .await?;
    local.sync()?;
    remote_index.sync()?;
    Ok(())
}
