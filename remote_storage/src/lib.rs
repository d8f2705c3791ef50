//! Remote transport for the database's authoritative copy: an S3-compatible
//! object store reached either as an authenticated S3 client or as an
//! anonymous HTTP client. No other module is supposed to reach the network
//! directly; everything goes through the [`RemoteStorage`] trait.
//!
//! Two implementations are provided:
//!   * [`s3::S3Transport`] - authenticated, readable and writable.
//!   * [`http::HttpTransport`] - anonymous GET/HEAD only, never writable.

mod error;
pub mod http;
pub mod lock;
pub mod s3;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;

pub use error::{Error, Result};

/// As defined in S3 docs; batched `delete_objects` calls are chunked to this size.
pub const MAX_KEYS_PER_DELETE: usize = 1000;

/// A downloaded object: its bytes plus whatever metadata was stored
/// alongside it (e.g. `timestamp`, used as the per-key ordering field).
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub bytes: Bytes,
    pub metadata: HashMap<String, String>,
}

/// The result of a HEAD request: size and metadata, no body.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: u64,
    pub metadata: HashMap<String, String>,
}

/// A single entry returned by `list_object_versions`.
#[derive(Debug, Clone)]
pub struct ObjectVersion {
    pub key: String,
    pub version_id: Option<String>,
    pub is_delete_marker: bool,
}

/// Storage (potentially remote) API for the database's object store side.
/// Mirrors S3's actual semantics closely enough that both an authenticated
/// S3 client and a read-only HTTP client can implement it uniformly.
///
/// Methods are declared to return `impl Future<..> + Send` rather than using
/// `async fn` sugar directly, so that callers can fan work out across
/// `tokio::task::JoinSet` (which requires `Send + 'static` futures) without
/// every implementor needing `async-trait`'s boxing.
pub trait RemoteStorage: Send + Sync + 'static {
    /// Whether this transport instance was configured with write credentials
    /// at all (spec.md §4.1: `HTTP` is never writable, `S3` always is).
    fn writable(&self) -> bool;

    /// A readable-check succeeds if `get_db_object` returns 200 or 404 -
    /// the latter meaning "no database yet, but the transport is healthy".
    fn readable(&self, db_key: &str) -> impl std::future::Future<Output = bool> + Send {
        async move {
            match self.get_db_object(db_key).await {
                Ok(_) => true,
                Err(e) => e.is_not_found(),
            }
        }
    }

    fn get_db_object(&self, db_key: &str) -> impl std::future::Future<Output = Result<RemoteObject>> + Send;
    fn head_db_object(&self, db_key: &str) -> impl std::future::Future<Output = Result<ObjectMeta>> + Send;
    fn put_db_object(
        &self,
        db_key: &str,
        bytes: Bytes,
        metadata: Option<HashMap<String, String>>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn get_object(&self, key: &str) -> impl std::future::Future<Output = Result<RemoteObject>> + Send;
    fn head_object(&self, key: &str) -> impl std::future::Future<Output = Result<ObjectMeta>> + Send;
    fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        metadata: Option<HashMap<String, String>>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
    fn delete_object(&self, key: &str) -> impl std::future::Future<Output = Result<()>> + Send;
    fn delete_objects(&self, keys: &[String]) -> impl std::future::Future<Output = Result<()>> + Send;
    fn list_objects(&self, prefix: &str) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;
    fn list_object_versions(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ObjectVersion>>> + Send;

    /// A writable-check does a round-trip put+delete under a disposable
    /// suffix of the db key (spec.md §4.1), rather than trusting
    /// [`RemoteStorage::writable`] alone - a transport can be configured
    /// with credentials that turn out not to have bucket write permission.
    fn probe_writable(&self, db_key: &str) -> impl std::future::Future<Output = bool> + Send {
        async move {
            if !self.writable() {
                return false;
            }
            let probe_key = format!("{db_key}.write-probe");
            if self
                .put_object(&probe_key, Bytes::from_static(b"probe"), None)
                .await
                .is_err()
            {
                return false;
            }
            self.delete_object(&probe_key).await.is_ok()
        }
    }
}

/// Lets callers share one transport instance across several open databases
/// (e.g. two `Database` handles standing in for two separate clients in a
/// test, both backed by the same in-process mock store).
impl<T: RemoteStorage> RemoteStorage for Arc<T> {
    fn writable(&self) -> bool {
        (**self).writable()
    }

    fn get_db_object(&self, db_key: &str) -> impl std::future::Future<Output = Result<RemoteObject>> + Send {
        (**self).get_db_object(db_key)
    }

    fn head_db_object(&self, db_key: &str) -> impl std::future::Future<Output = Result<ObjectMeta>> + Send {
        (**self).head_db_object(db_key)
    }

    fn put_db_object(
        &self,
        db_key: &str,
        bytes: Bytes,
        metadata: Option<HashMap<String, String>>,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        (**self).put_db_object(db_key, bytes, metadata)
    }

    fn get_object(&self, key: &str) -> impl std::future::Future<Output = Result<RemoteObject>> + Send {
        (**self).get_object(key)
    }

    fn head_object(&self, key: &str) -> impl std::future::Future<Output = Result<ObjectMeta>> + Send {
        (**self).head_object(key)
    }

    fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        metadata: Option<HashMap<String, String>>,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        (**self).put_object(key, bytes, metadata)
    }

    fn delete_object(&self, key: &str) -> impl std::future::Future<Output = Result<()>> + Send {
        (**self).delete_object(key)
    }

    fn delete_objects(&self, keys: &[String]) -> impl std::future::Future<Output = Result<()>> + Send {
        (**self).delete_objects(keys)
    }

    fn list_objects(&self, prefix: &str) -> impl std::future::Future<Output = Result<Vec<String>>> + Send {
        (**self).list_objects(prefix)
    }

    fn list_object_versions(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ObjectVersion>>> + Send {
        (**self).list_object_versions(prefix)
    }
}

/// The session opened by `open()` (spec.md §4.1): a db object download that
/// eagerly surfaces whatever header bytes and timestamp metadata exist, or
/// "remote empty" (all fields `None`) on a 404 - never an error.
pub struct DbSession {
    /// The decoded 200-byte Local Store header - the object's `init_bytes`
    /// custom metadata, base64url-decoded (spec.md §6). Used to seed a
    /// fresh local file and to compare UUIDs on reconciliation.
    pub init_bytes: Option<Bytes>,
    /// The object's body: the Remote Index file bytes (spec.md §4.5e).
    pub remote_index_bytes: Option<Bytes>,
    /// The object's `timestamp` custom metadata, parsed as microseconds.
    pub timestamp: Option<u64>,
}

pub async fn open<T: RemoteStorage>(transport: &T, db_key: &str) -> Result<DbSession> {
    match transport.get_db_object(db_key).await {
        Ok(obj) => {
            let timestamp = obj
                .metadata
                .get("timestamp")
                .and_then(|s| s.parse::<u64>().ok());
            let init_bytes = obj
                .metadata
                .get("init_bytes")
                .and_then(|s| base64::decode_config(s, base64::URL_SAFE_NO_PAD).ok())
                .map(Bytes::from);
            Ok(DbSession {
                init_bytes,
                remote_index_bytes: Some(obj.bytes),
                timestamp,
            })
        }
        Err(e) if e.is_not_found() => Ok(DbSession {
            init_bytes: None,
            remote_index_bytes: None,
            timestamp: None,
        }),
        Err(e) => Err(e),
    }
}

/// Which kind of request a concurrency permit is being acquired for -
/// reads and writes are throttled separately, since S3 (and the bucket
/// owner's IAM layer) rate-limits them independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Get,
    Put,
    Delete,
    List,
}

/// Bounds how many requests are in flight against the remote at once.
/// Every request to S3 can be throttled or cancelled if too many are
/// outstanding; this keeps us under that ceiling client-side.
pub struct ConcurrencyLimiter {
    read: Arc<Semaphore>,
    write: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            read: Arc::new(Semaphore::new(limit)),
            write: Arc::new(Semaphore::new(limit)),
        }
    }

    fn for_kind(&self, kind: RequestKind) -> &Arc<Semaphore> {
        match kind {
            RequestKind::Get | RequestKind::List => &self.read,
            RequestKind::Put | RequestKind::Delete => &self.write,
        }
    }

    pub async fn acquire(&self, kind: RequestKind) -> tokio::sync::SemaphorePermit<'_> {
        self.for_kind(kind)
            .acquire()
            .await
            .expect("semaphore is never closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock::MockTransport;

    #[tokio::test]
    async fn readable_is_true_on_404() {
        let t = MockTransport::new(true);
        assert!(t.readable("some/db").await);
    }

    #[tokio::test]
    async fn probe_writable_false_for_http_like_transport() {
        let t = MockTransport::new(false);
        assert!(!t.probe_writable("some/db").await);
    }

    #[tokio::test]
    async fn probe_writable_true_for_s3_like_transport_and_leaves_no_trace() {
        let t = MockTransport::new(true);
        assert!(t.probe_writable("some/db").await);
        assert!(t.head_object("some/db.write-probe").await.is_err());
    }
}
