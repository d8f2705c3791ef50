//! Authenticated S3 transport: the read/write backend used by a database's
//! primary writer (spec.md §4.1, `S3` variant).

use std::collections::HashMap;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::instrument;

use crate::{ConcurrencyLimiter, Error, ObjectMeta, ObjectVersion, RemoteObject, RemoteStorage, RequestKind, Result, MAX_KEYS_PER_DELETE};

pub struct S3Transport {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    limiter: ConcurrencyLimiter,
}

impl S3Transport {
    pub async fn new(bucket: impl Into<String>, prefix: Option<String>, concurrency_limit: usize) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: Client::new(&config),
            bucket: bucket.into(),
            prefix,
            limiter: ConcurrencyLimiter::new(concurrency_limit),
        }
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(p) => format!("{}/{}", p.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }

    fn aws_err(e: impl std::error::Error) -> Error {
        Error::Request(e.to_string())
    }
}

impl RemoteStorage for S3Transport {
    fn writable(&self) -> bool {
        true
    }

    #[instrument(skip(self))]
    async fn get_db_object(&self, db_key: &str) -> Result<RemoteObject> {
        self.get_object(db_key).await
    }

    #[instrument(skip(self))]
    async fn head_db_object(&self, db_key: &str) -> Result<ObjectMeta> {
        self.head_object(db_key).await
    }

    #[instrument(skip(self, bytes))]
    async fn put_db_object(
        &self,
        db_key: &str,
        bytes: Bytes,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        self.put_object(db_key, bytes, metadata).await
    }

    #[instrument(skip(self))]
    async fn get_object(&self, key: &str) -> Result<RemoteObject> {
        let _permit = self.limiter.acquire(RequestKind::Get).await;
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| match e.as_service_error().and_then(|s| s.meta().code()) {
                Some("NoSuchKey") => Error::TransportError {
                    status: 404,
                    body: key.to_string(),
                },
                _ => Self::aws_err(e),
            })?;
        let metadata = resp.metadata().cloned().unwrap_or_default();
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(Self::aws_err)?
            .into_bytes();
        Ok(RemoteObject { bytes, metadata })
    }

    #[instrument(skip(self))]
    async fn head_object(&self, key: &str) -> Result<ObjectMeta> {
        let _permit = self.limiter.acquire(RequestKind::Get).await;
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| match e.as_service_error().map(|s| s.is_not_found()) {
                Some(true) => Error::TransportError {
                    status: 404,
                    body: key.to_string(),
                },
                _ => Self::aws_err(e),
            })?;
        Ok(ObjectMeta {
            size: resp.content_length().unwrap_or(0) as u64,
            metadata: resp.metadata().cloned().unwrap_or_default(),
        })
    }

    #[instrument(skip(self, bytes))]
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        let _permit = self.limiter.acquire(RequestKind::Put).await;
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(ByteStream::from(bytes));
        if let Some(metadata) = metadata {
            for (k, v) in metadata {
                req = req.metadata(k, v);
            }
        }
        req.send().await.map_err(Self::aws_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, key: &str) -> Result<()> {
        let _permit = self.limiter.acquire(RequestKind::Delete).await;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(Self::aws_err)?;
        Ok(())
    }

    #[instrument(skip(self, keys))]
    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        let _permit = self.limiter.acquire(RequestKind::Delete).await;
        for chunk in keys.chunks(MAX_KEYS_PER_DELETE) {
            let ids: Vec<_> = chunk
                .iter()
                .map(|k| {
                    aws_sdk_s3::types::ObjectIdentifier::builder()
                        .key(self.full_key(k))
                        .build()
                        .expect("key is always set")
                })
                .collect();
            let delete = aws_sdk_s3::types::Delete::builder()
                .set_objects(Some(ids))
                .build()
                .map_err(Self::aws_err)?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(Self::aws_err)?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let _permit = self.limiter.acquire(RequestKind::List).await;
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.full_key(prefix))
            .send()
            .await
            .map_err(Self::aws_err)?;
        Ok(resp
            .contents()
            .iter()
            .filter_map(|o| o.key().map(str::to_string))
            .collect())
    }

    #[instrument(skip(self))]
    async fn list_object_versions(&self, prefix: &str) -> Result<Vec<ObjectVersion>> {
        let _permit = self.limiter.acquire(RequestKind::List).await;
        let resp = self
            .client
            .list_object_versions()
            .bucket(&self.bucket)
            .prefix(self.full_key(prefix))
            .send()
            .await
            .map_err(Self::aws_err)?;
        let mut out: Vec<ObjectVersion> = resp
            .versions()
            .iter()
            .filter_map(|v| {
                Some(ObjectVersion {
                    key: v.key()?.to_string(),
                    version_id: v.version_id().map(str::to_string),
                    is_delete_marker: false,
                })
            })
            .collect();
        out.extend(resp.delete_markers().iter().filter_map(|d| {
            Some(ObjectVersion {
                key: d.key()?.to_string(),
                version_id: d.version_id().map(str::to_string),
                is_delete_marker: true,
            })
        }));
        Ok(out)
    }
}
