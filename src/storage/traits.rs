//! Storage trait definition.
//!
//! The account subsystem treats persistence as an opaque collaborator: a
//! bucket/key byte store plus a garbage-collection hook. Concrete entities
//! persisted through this trait are the master secret's ciphertext, seed
//! ciphertexts, and per-subaccount snapshots (counters, elements, scan
//! progress, notification-txid sets) — all serialized by their owners
//! before reaching this layer, so the trait itself has no knowledge of
//! their shape.

use async_trait::async_trait;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Abstract key-value storage backend.
///
/// Implementations:
/// - [`super::sqlite::SqliteBackend`] - durable storage via SQLite
/// - [`super::memory::MemoryBackend`] - in-memory storage for testing
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write `value` under `(bucket, key)`, replacing any prior value.
    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Read the value stored under `(bucket, key)`, if any.
    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Remove the value stored under `(bucket, key)`. Returns whether a
    /// value was present.
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<bool>;

    /// List all keys currently stored in `bucket`.
    async fn list_keys(&self, bucket: &str) -> StorageResult<Vec<String>>;

    /// Run backend-specific garbage collection (e.g. vacuuming expired
    /// reservation metadata). Invoked periodically by the storage GC
    /// thread described in the concurrency model; a no-op backend may
    /// simply return `Ok(())`.
    async fn gc(&self) -> StorageResult<()> {
        Ok(())
    }
}
