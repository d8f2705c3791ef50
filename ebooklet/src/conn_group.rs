//! Remote Conn Group (C7): a database whose values describe other
//! databases, keyed by the member's UUID in hex (spec.md §4.7). Purely a
//! naming convention over C1-C6 - this module adds no new storage or sync
//! machinery of its own.

use std::path::Path;

use remote_storage::RemoteStorage;
use serde::{Deserialize, Serialize};

use crate::db::{Database, Mode, OpenFlag, OpenOptions, ReadWrite};
use crate::error::Result;

/// What a member database looks like from the group's point of view:
/// enough to open it again without consulting any other source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberDescriptor {
    /// A free-form tag identifying the transport kind (e.g. `"s3"`, `"http"`).
    pub transport_type: String,
    pub db_key: String,
    /// Transport-specific parameters (bucket name, prefix, base URL, ...),
    /// serialised as whatever shape the transport's constructor expects.
    pub transport_params: serde_json::Value,
}

/// A [`Database`] specialised to hold [`MemberDescriptor`] values, addressed
/// by the member's UUID.
pub struct RemoteConnGroup<T: RemoteStorage, M> {
    inner: Database<T, M>,
}

impl<T: RemoteStorage, M: Mode> RemoteConnGroup<T, M> {
    pub async fn open(
        local_path: impl AsRef<Path>,
        db_key: impl Into<String>,
        transport: T,
        flag: OpenFlag,
    ) -> Result<Self> {
        let inner = OpenOptions::new()
            .flag(flag)
            .open::<T, M>(local_path, db_key, transport)
            .await?;
        Ok(Self { inner })
    }

    /// Looks up a member by UUID, pulling its descriptor from the remote if
    /// the local cache is stale.
    pub async fn member(&mut self, uuid: &uuid::Uuid) -> Result<Option<MemberDescriptor>> {
        let key = uuid.simple().to_string();
        match self.inner.get(&key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|_| {
                crate::error::Error::CorruptGroup
            })?)),
            None => Ok(None),
        }
    }

    pub fn member_uuids(&self) -> impl Iterator<Item = &str> {
        self.inner.keys()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub async fn pull(&mut self) -> Result<()> {
        self.inner.pull().await
    }

    pub fn database(&self) -> &Database<T, M> {
        &self.inner
    }
}

impl<T: RemoteStorage> RemoteConnGroup<T, ReadWrite> {
    pub fn add_member(&mut self, uuid: &uuid::Uuid, descriptor: &MemberDescriptor) -> Result<()> {
        let value = serde_json::to_vec(descriptor).expect("MemberDescriptor always serialises");
        self.inner.set(&uuid.simple().to_string(), value)
    }

    pub fn remove_member(&mut self, uuid: &uuid::Uuid) -> Result<()> {
        self.inner.del(&uuid.simple().to_string())
    }

    pub async fn push(&mut self, force_push: bool) -> Result<()> {
        self.inner.push(force_push).await
    }
}
