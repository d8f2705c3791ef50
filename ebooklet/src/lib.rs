//! An embedded, dbm-style key/value store whose authoritative copy lives in
//! an object store and whose working copy lives on the local filesystem.
//!
//! A [`Database`] is opened by naming a local file path and a remote object
//! key; mutations are buffered locally (see [`booklet`]) and reconciled with
//! the remote on demand through [`Database::push`] / [`Database::pull`].
//! Concurrent writers cooperate through [`remote_storage::lock::RemoteLock`]
//! and a per-key, last-write-wins microsecond timestamp.

mod conn_group;
mod db;
mod error;
mod group_codec;
mod remote_index;
mod sync;

pub use conn_group::{MemberDescriptor, RemoteConnGroup};
pub use db::{Changes, Database, Mode, OpenFlag, OpenOptions, ReadOnly, ReadWrite, RESERVED_METADATA_KEY};
pub use error::{Error, Result};
pub use group_codec::{group_id, pack, unpack, GroupEntry};
pub use remote_index::RemoteIndex;
