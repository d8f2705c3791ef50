//! An in-process, `HashMap`-backed [`RemoteStorage`] used by the sync engine
//! and database façade tests - the same role `LocalFs` plays as a stand-in
//! for S3 in the teacher's own test suite, minus any filesystem I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use bytes::Bytes;

use crate::{Error, ObjectMeta, ObjectVersion, RemoteObject, RemoteStorage, Result};

struct Entry {
    bytes: Bytes,
    metadata: HashMap<String, String>,
    version: u64,
}

pub struct MockTransport {
    writable: bool,
    objects: Mutex<HashMap<String, Entry>>,
    next_version: Mutex<u64>,
    fail_next_put: Mutex<HashSet<String>>,
}

impl MockTransport {
    pub fn new(writable: bool) -> Self {
        Self {
            writable,
            objects: Mutex::new(HashMap::new()),
            next_version: Mutex::new(1),
            fail_next_put: Mutex::new(HashSet::new()),
        }
    }

    pub fn db_key(&self, key: &str) -> String {
        key.to_string()
    }

    fn next_version_id(&self) -> u64 {
        let mut v = self.next_version.lock().unwrap();
        let id = *v;
        *v += 1;
        id
    }

    fn not_found(key: &str) -> Error {
        Error::TransportError {
            status: 404,
            body: format!("no such object: {key}"),
        }
    }

    /// Test-only helpers for asserting on this transport's state and for
    /// injecting a single upload failure, without reaching into its private
    /// fields from outside the crate.
    pub fn has_object_for_test(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn object_count_under_for_test(&self, prefix: &str) -> usize {
        self.objects.lock().unwrap().keys().filter(|k| k.starts_with(prefix)).count()
    }

    pub async fn head_db_object_for_test(&self, db_key: &str) -> bool {
        self.head_object(db_key).await.is_ok()
    }

    /// The next `put_object` against this exact key fails with a transport
    /// error instead of succeeding; the failure is consumed (one-shot).
    pub fn fail_next_put_for_test(&self, key: &str) {
        self.fail_next_put.lock().unwrap().insert(key.to_string());
    }
}

impl RemoteStorage for MockTransport {
    fn writable(&self) -> bool {
        self.writable
    }

    async fn get_db_object(&self, db_key: &str) -> Result<RemoteObject> {
        self.get_object(db_key).await
    }

    async fn head_db_object(&self, db_key: &str) -> Result<ObjectMeta> {
        self.head_object(db_key).await
    }

    async fn put_db_object(
        &self,
        db_key: &str,
        bytes: Bytes,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        self.put_object(db_key, bytes, metadata).await
    }

    async fn get_object(&self, key: &str) -> Result<RemoteObject> {
        let objects = self.objects.lock().unwrap();
        objects
            .get(key)
            .map(|e| RemoteObject {
                bytes: e.bytes.clone(),
                metadata: e.metadata.clone(),
            })
            .ok_or_else(|| Self::not_found(key))
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta> {
        let objects = self.objects.lock().unwrap();
        objects
            .get(key)
            .map(|e| ObjectMeta {
                size: e.bytes.len() as u64,
                metadata: e.metadata.clone(),
            })
            .ok_or_else(|| Self::not_found(key))
    }

    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        if !self.writable {
            return Err(Error::NotWritable);
        }
        if self.fail_next_put.lock().unwrap().remove(key) {
            return Err(Error::TransportError {
                status: 500,
                body: format!("injected failure for {key}"),
            });
        }
        let version = self.next_version_id();
        self.objects.lock().unwrap().insert(
            key.to_string(),
            Entry {
                bytes,
                metadata: metadata.unwrap_or_default(),
                version,
            },
        );
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        if !self.writable {
            return Err(Error::NotWritable);
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        if !self.writable {
            return Err(Error::NotWritable);
        }
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn list_object_versions(&self, prefix: &str) -> Result<Vec<ObjectVersion>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| ObjectVersion {
                key: k.clone(),
                version_id: Some(e.version.to_string()),
                is_delete_marker: false,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_only_transport_rejects_writes() {
        let t = MockTransport::new(false);
        let err = t
            .put_object("k", Bytes::from_static(b"v"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotWritable));
    }

    #[tokio::test]
    async fn missing_object_is_404_not_found() {
        let t = MockTransport::new(true);
        let err = t.get_object("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn put_then_get_round_trips_metadata() {
        let t = MockTransport::new(true);
        let mut meta = HashMap::new();
        meta.insert("timestamp".to_string(), "123".to_string());
        t.put_object("k", Bytes::from_static(b"v"), Some(meta))
            .await
            .unwrap();
        let obj = t.get_object("k").await.unwrap();
        assert_eq!(obj.bytes, Bytes::from_static(b"v"));
        assert_eq!(obj.metadata.get("timestamp").map(String::as_str), Some("123"));
    }
}
