//! Anonymous, read-only HTTP transport: a `GET`/`HEAD`-only client against a
//! static file server or a public S3-compatible endpoint exposed over plain
//! HTTP, used when a consumer has no write credentials (spec.md §4.1).

use std::collections::HashMap;

use bytes::Bytes;

use crate::{ConcurrencyLimiter, Error, ObjectMeta, ObjectVersion, RemoteObject, RemoteStorage, Result};

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    limiter: ConcurrencyLimiter,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, concurrency_limit: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            limiter: ConcurrencyLimiter::new(concurrency_limit),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }

    fn metadata_from_headers(resp: &reqwest::Response) -> HashMap<String, String> {
        resp.headers()
            .iter()
            .filter_map(|(name, value)| {
                let name = name.as_str();
                let prefixed = name.strip_prefix("x-amz-meta-")?;
                Some((prefixed.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect()
    }

    async fn to_result<T>(resp: reqwest::Response, on_ok: impl FnOnce(reqwest::Response) -> T) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            Ok(on_ok(resp))
        } else {
            let status_code = status.as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(Error::TransportError {
                status: status_code,
                body,
            })
        }
    }
}

impl RemoteStorage for HttpTransport {
    fn writable(&self) -> bool {
        false
    }

    async fn get_db_object(&self, db_key: &str) -> Result<RemoteObject> {
        self.get_object(db_key).await
    }

    async fn head_db_object(&self, db_key: &str) -> Result<ObjectMeta> {
        self.head_object(db_key).await
    }

    async fn put_db_object(
        &self,
        _db_key: &str,
        _bytes: Bytes,
        _metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        Err(Error::NotWritable)
    }

    async fn get_object(&self, key: &str) -> Result<RemoteObject> {
        let _permit = self.limiter.acquire(crate::RequestKind::Get).await;
        let resp = self
            .client
            .get(self.url_for(key))
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::TransportError {
                status: status_code,
                body,
            });
        }
        let metadata = Self::metadata_from_headers(&resp);
        let bytes = resp.bytes().await.map_err(|e| Error::Request(e.to_string()))?;
        Ok(RemoteObject { bytes, metadata })
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta> {
        let _permit = self.limiter.acquire(crate::RequestKind::Get).await;
        let resp = self
            .client
            .head(self.url_for(key))
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;
        let metadata = Self::metadata_from_headers(&resp);
        let size = resp
            .content_length()
            .or_else(|| {
                resp.headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(0);
        Self::to_result(resp, |_| ObjectMeta { size, metadata }).await
    }

    async fn put_object(
        &self,
        _key: &str,
        _bytes: Bytes,
        _metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        Err(Error::NotWritable)
    }

    async fn delete_object(&self, _key: &str) -> Result<()> {
        Err(Error::NotWritable)
    }

    async fn delete_objects(&self, _keys: &[String]) -> Result<()> {
        Err(Error::NotWritable)
    }

    async fn list_objects(&self, _prefix: &str) -> Result<Vec<String>> {
        Err(Error::TransportError {
            status: 501,
            body: "listing is not supported over anonymous HTTP".to_string(),
        })
    }

    async fn list_object_versions(&self, _prefix: &str) -> Result<Vec<ObjectVersion>> {
        Err(Error::TransportError {
            status: 501,
            body: "versioned listing is not supported over anonymous HTTP".to_string(),
        })
    }
}
