//! The advisory remote lock (spec.md §5): a sentinel object written under
//! `{db_key}.lock`, holding an owner token and an acquisition time. There is
//! no compare-and-swap primitive available across both S3 and anonymous
//! HTTP, so this is cooperative by construction - a concurrent writer that
//! doesn't honour it can still stomp on the lock. What it does guarantee is
//! that well-behaved writers serialise, and that a writer that crashed
//! without releasing the lock doesn't wedge the database forever: any other
//! writer can `break_lock` once the holder's lease has visibly expired.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Error, RemoteStorage, Result};

#[derive(Debug, Serialize, Deserialize)]
struct LockPayload {
    owner_token: String,
    acquired_at_us: u64,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_micros() as u64
}

/// A held (or not-yet-acquired) advisory lock on a database key.
pub struct RemoteLock {
    lock_key: String,
    owner_token: String,
    held: bool,
}

impl RemoteLock {
    pub fn new(db_key: &str) -> Self {
        Self {
            lock_key: format!("{db_key}.lock"),
            owner_token: Uuid::new_v4().to_string(),
            held: false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Attempts to acquire the lock, retrying until `timeout` elapses. If an
    /// existing lock's lease is older than `lease` it is broken and claimed.
    pub async fn acquire<T: RemoteStorage>(
        &mut self,
        transport: &T,
        timeout: Duration,
        lease: Duration,
    ) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match transport.get_object(&self.lock_key).await {
                Err(e) if e.is_not_found() => {
                    self.claim(transport).await?;
                    return Ok(());
                }
                Ok(obj) => {
                    if let Some(existing) = parse_payload(&obj.bytes) {
                        let age_us = now_us().saturating_sub(existing.acquired_at_us);
                        if age_us > lease.as_micros() as u64 {
                            warn!(lock_key = %self.lock_key, owner = %existing.owner_token, "breaking expired remote lock");
                            self.claim(transport).await?;
                            return Ok(());
                        }
                    } else {
                        // unparseable lock object: treat as a foreign, live lock.
                    }
                }
                Err(e) => return Err(e),
            }

            if std::time::Instant::now() >= deadline {
                return Err(Error::TransportError {
                    status: 0,
                    body: format!("could not acquire remote lock {} within timeout", self.lock_key),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Forces acquisition regardless of any existing holder.
    pub async fn break_lock<T: RemoteStorage>(&mut self, transport: &T) -> Result<()> {
        info!(lock_key = %self.lock_key, "force-breaking remote lock");
        self.claim(transport).await
    }

    async fn claim<T: RemoteStorage>(&mut self, transport: &T) -> Result<()> {
        let payload = LockPayload {
            owner_token: self.owner_token.clone(),
            acquired_at_us: now_us(),
        };
        let bytes = Bytes::from(serde_json::to_vec(&payload).expect("lock payload is serializable"));
        transport.put_object(&self.lock_key, bytes, None).await?;
        self.held = true;
        Ok(())
    }

    /// Releases the lock, but only if it's still ours - a lock broken by
    /// another writer while we held it (our lease expired) must not be torn
    /// down out from under its new owner.
    pub async fn release<T: RemoteStorage>(&mut self, transport: &T) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        match transport.get_object(&self.lock_key).await {
            Ok(obj) => {
                if parse_payload(&obj.bytes).map(|p| p.owner_token) == Some(self.owner_token.clone()) {
                    transport.delete_object(&self.lock_key).await?;
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.held = false;
        Ok(())
    }
}

fn parse_payload(bytes: &[u8]) -> Option<LockPayload> {
    serde_json::from_slice(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    #[tokio::test]
    async fn acquire_then_release_round_trips() {
        let t = MockTransport::new(true);
        let mut lock = RemoteLock::new("db/foo");
        lock.acquire(&t, Duration::from_secs(1), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(lock.is_held());
        assert!(t.head_object("db/foo.lock").await.is_ok());
        lock.release(&t).await.unwrap();
        assert!(t.head_object("db/foo.lock").await.is_err());
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_first_holds() {
        let t = MockTransport::new(true);
        let mut first = RemoteLock::new("db/foo");
        first
            .acquire(&t, Duration::from_secs(1), Duration::from_secs(60))
            .await
            .unwrap();

        let mut second = RemoteLock::new("db/foo");
        let err = second
            .acquire(&t, Duration::from_millis(250), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportError { status: 0, .. }));
    }

    #[tokio::test]
    async fn break_lock_claims_regardless_of_holder() {
        let t = MockTransport::new(true);
        let mut first = RemoteLock::new("db/foo");
        first
            .acquire(&t, Duration::from_secs(1), Duration::from_secs(60))
            .await
            .unwrap();

        let mut second = RemoteLock::new("db/foo");
        second.break_lock(&t).await.unwrap();
        assert!(second.is_held());

        // the original holder's release is now a no-op - it no longer owns the lock.
        first.release(&t).await.unwrap();
        assert!(t.head_object("db/foo.lock").await.is_ok());
    }
}
