//! Content-addressed blob storage for bill files.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

use billflow_core::Clock;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

impl BlobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BlobError::Unavailable(_))
    }
}

/// Blob store contract. Keys are caller-chosen and opaque (typically
/// `bills/{billId}/{fileId}/{filename}`); the store never interprets them.
/// `delete` exists for operator tooling only — the core never calls it while
/// any event references the key.
pub trait BlobStore: Send + Sync {
    /// Store bytes and return their hex sha256 checksum.
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, BlobError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    fn exists(&self, key: &str) -> Result<bool, BlobError>;

    /// Issue a time-limited download URL for the key.
    fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, BlobError>;

    fn delete(&self, key: &str) -> Result<(), BlobError>;
}

impl<B> BlobStore for Arc<B>
where
    B: BlobStore + ?Sized,
{
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, BlobError> {
        (**self).put(key, bytes, content_type)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        (**self).get(key)
    }

    fn exists(&self, key: &str) -> Result<bool, BlobError> {
        (**self).exists(key)
    }

    fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, BlobError> {
        (**self).presign_get(key, ttl)
    }

    fn delete(&self, key: &str) -> Result<(), BlobError> {
        (**self).delete(key)
    }
}

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    #[allow(dead_code)]
    content_type: String,
}

/// In-memory blob store for tests/dev. Presigned URLs carry an expiry and a
/// key-bound signature in the query string, shaped like the real thing.
pub struct InMemoryBlobStore {
    objects: RwLock<HashMap<String, StoredBlob>>,
    base_url: String,
    clock: Arc<dyn Clock>,
}

impl InMemoryBlobStore {
    pub fn new(base_url: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            base_url: base_url.into(),
            clock,
        }
    }

    pub fn checksum(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, BlobError> {
        let checksum = Self::checksum(bytes);
        let mut objects = self
            .objects
            .write()
            .map_err(|_| BlobError::Unavailable("lock poisoned".to_string()))?;
        objects.insert(
            key.to_string(),
            StoredBlob {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(checksum)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| BlobError::Unavailable("lock poisoned".to_string()))?;
        objects
            .get(key)
            .map(|blob| blob.bytes.clone())
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    fn exists(&self, key: &str) -> Result<bool, BlobError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| BlobError::Unavailable("lock poisoned".to_string()))?;
        Ok(objects.contains_key(key))
    }

    fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, BlobError> {
        if !self.exists(key)? {
            return Err(BlobError::NotFound(key.to_string()));
        }
        let expires = self.clock.now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        let signature = hex::encode(Sha256::digest(
            format!("{key}|{}", expires.timestamp()).as_bytes(),
        ));
        Ok(format!(
            "{}/{key}?expires={}&signature={}",
            self.base_url,
            expires.timestamp(),
            &signature[..32],
        ))
    }

    fn delete(&self, key: &str) -> Result<(), BlobError> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| BlobError::Unavailable("lock poisoned".to_string()))?;
        objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use billflow_core::SystemClock;

    fn store() -> InMemoryBlobStore {
        InMemoryBlobStore::new("http://localhost/blobs", Arc::new(SystemClock))
    }

    #[test]
    fn put_returns_sha256_hex_and_get_round_trips() {
        let store = store();
        let checksum = store.put("bills/b1/f1/a.pdf", b"hello", "application/pdf").unwrap();
        assert_eq!(
            checksum,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(store.get("bills/b1/f1/a.pdf").unwrap(), b"hello");
        assert!(store.exists("bills/b1/f1/a.pdf").unwrap());
    }

    #[test]
    fn missing_keys_are_not_found() {
        let store = store();
        assert!(matches!(store.get("nope"), Err(BlobError::NotFound(_))));
        assert!(matches!(
            store.presign_get("nope", Duration::from_secs(60)),
            Err(BlobError::NotFound(_))
        ));
    }

    #[test]
    fn presigned_urls_embed_key_and_expiry() {
        let store = store();
        store.put("bills/b1/f1/a.pdf", b"x", "application/pdf").unwrap();
        let url = store
            .presign_get("bills/b1/f1/a.pdf", Duration::from_secs(900))
            .unwrap();
        assert!(url.starts_with("http://localhost/blobs/bills/b1/f1/a.pdf?expires="));
        assert!(url.contains("&signature="));
    }
}
