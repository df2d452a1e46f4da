//! In-memory storage backend.
//!
//! Thread-safe, `Arc<RwLock<HashMap>>`-backed implementation of
//! [`StorageBackend`] for testing and development. Data is lost when the
//! process exits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{StorageBackend, StorageError, StorageResult};

type Bucket = HashMap<String, Vec<u8>>;

/// In-memory key-value store, keyed by `(bucket, key)`.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let buckets = self.buckets.read().await;
        Ok(buckets.get(bucket).and_then(|b| b.get(key)).cloned())
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        let mut buckets = self.buckets.write().await;
        Ok(buckets
            .get_mut(bucket)
            .map(|b| b.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list_keys(&self, bucket: &str) -> StorageResult<Vec<String>> {
        let buckets = self.buckets.read().await;
        Ok(buckets
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryBackend::new();
        store.put("subaccounts", "acct-1", b"payload").await.unwrap();

        let retrieved = store.get("subaccounts", "acct-1").await.unwrap().unwrap();
        assert_eq!(retrieved, b"payload");
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = MemoryBackend::new();
        assert!(store.get("subaccounts", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryBackend::new();
        store.put("seeds", "seed-1", b"x").await.unwrap();

        assert!(store.delete("seeds", "seed-1").await.unwrap());
        assert!(!store.delete("seeds", "seed-1").await.unwrap());
        assert!(store.get("seeds", "seed-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_keys() {
        let store = MemoryBackend::new();
        store.put("subaccounts", "a", b"1").await.unwrap();
        store.put("subaccounts", "b", b"2").await.unwrap();

        let mut keys = store.list_keys("subaccounts").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_buckets_are_independent() {
        let store = MemoryBackend::new();
        store.put("seeds", "k", b"seed-value").await.unwrap();
        store.put("subaccounts", "k", b"acct-value").await.unwrap();

        assert_eq!(store.get("seeds", "k").await.unwrap().unwrap(), b"seed-value");
        assert_eq!(
            store.get("subaccounts", "k").await.unwrap().unwrap(),
            b"acct-value"
        );
    }
}
