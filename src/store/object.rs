use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Presigned PUT URLs live long enough to cover a full execution.
pub const UPLOAD_URL_TTL: Duration = Duration::from_secs(3 * 3600);
/// Presigned GET URLs are short-lived; clients fetch and go.
pub const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(180);

pub fn program_key(job_id: &str) -> String {
    format!("jobs/{job_id}/program")
}

pub fn result_key(job_id: &str) -> String {
    format!("jobs/{job_id}/result")
}

/// Time-limited capability to PUT or GET one object-store key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

/// Gateway to the external object store holding program and result blobs.
/// The scheduler never reads result payloads; it only mints capabilities.
#[async_trait]
pub trait ObjectStoreGateway: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError>;

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError>;

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError>;

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<PresignedUrl, ObjectStoreError>;

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<PresignedUrl, ObjectStoreError>;

    /// Attach bucket-lifecycle tags to an object. Missing objects are not an
    /// error; the worker may have uploaded nothing.
    async fn tag_object(
        &self,
        key: &str,
        tags: &[(String, String)],
    ) -> Result<(), ObjectStoreError>;
}

/// In-memory object store used by tests and `--dev` mode. Presigned URLs use
/// a `memory://` scheme that no client can dereference, which is fine: tests
/// assert on keys and expiries, not on transfers.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    tags: Mutex<HashMap<String, Vec<(String, String)>>>,
    fail_next: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn tags_for(&self, key: &str) -> Vec<(String, String)> {
        self.tags.lock().unwrap().get(key).cloned().unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    fn check_fault(&self) -> Result<(), ObjectStoreError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(ObjectStoreError::Unavailable("injected fault".into()));
        }
        Ok(())
    }

    fn presign(&self, method: &str, key: &str, ttl: Duration) -> PresignedUrl {
        let expires_at =
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        PresignedUrl {
            url: format!(
                "memory://jobs/{method}/{key}?expires={}",
                expires_at.timestamp()
            ),
            expires_at,
        }
    }
}

#[async_trait]
impl ObjectStoreGateway for MemoryObjectStore {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError> {
        self.check_fault()?;
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        self.check_fault()?;
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.check_fault()?;
        self.objects.lock().unwrap().remove(key);
        self.tags.lock().unwrap().remove(key);
        Ok(())
    }

    async fn presign_put(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, ObjectStoreError> {
        self.check_fault()?;
        Ok(self.presign("put", key, ttl))
    }

    async fn presign_get(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, ObjectStoreError> {
        self.check_fault()?;
        Ok(self.presign("get", key, ttl))
    }

    async fn tag_object(
        &self,
        key: &str,
        tags: &[(String, String)],
    ) -> Result<(), ObjectStoreError> {
        self.check_fault()?;
        self.tags.lock().unwrap().insert(key.to_string(), tags.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn presigned_urls_carry_expiry() {
        let store = MemoryObjectStore::new();
        let before = Utc::now();
        let url = store.presign_put("jobs/j1/result", UPLOAD_URL_TTL).await.unwrap();
        assert!(url.expires_at >= before + chrono::Duration::seconds(3 * 3600 - 5));
        assert!(url.url.contains("jobs/j1/result"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryObjectStore::new();
        store.put_object("k", vec![1, 2, 3]).await.unwrap();
        store.delete_object("k").await.unwrap();
        store.delete_object("k").await.unwrap();
        assert!(store.get_object("k").await.unwrap().is_none());
    }
}
