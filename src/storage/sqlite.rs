//! SQLite-backed storage, pooled via r2d2 for concurrent access.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

use super::traits::{StorageBackend, StorageError, StorageResult};

/// SQLite-backed key-value store with connection pooling.
pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `db_path` and run
    /// migrations.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            );
            CREATE INDEX IF NOT EXISTS idx_kv_bucket ON kv(bucket);
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    fn put_sync(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value",
            params![bucket, key, value],
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    fn get_sync(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn delete_sync(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "DELETE FROM kv WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(rows > 0)
    }

    fn list_keys_sync(&self, bucket: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT key FROM kv WHERE bucket = ?1")
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let keys = stmt
            .query_map(params![bucket], |row| row.get(0))
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(keys)
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        self.put_sync(bucket, key, value)
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.get_sync(bucket, key)
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        self.delete_sync(bucket, key)
    }

    async fn list_keys(&self, bucket: &str) -> StorageResult<Vec<String>> {
        self.list_keys_sync(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = SqliteBackend::in_memory().unwrap();
        store.put("subaccounts", "acct-1", b"payload").await.unwrap();

        let retrieved = store.get("subaccounts", "acct-1").await.unwrap().unwrap();
        assert_eq!(retrieved, b"payload");
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = SqliteBackend::in_memory().unwrap();
        store.put("seeds", "k", b"v1").await.unwrap();
        store.put("seeds", "k", b"v2").await.unwrap();

        assert_eq!(store.get("seeds", "k").await.unwrap().unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_delete() {
        let store = SqliteBackend::in_memory().unwrap();
        store.put("seeds", "k", b"v").await.unwrap();

        assert!(store.delete("seeds", "k").await.unwrap());
        assert!(store.get("seeds", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_keys() {
        let store = SqliteBackend::in_memory().unwrap();
        store.put("subaccounts", "a", b"1").await.unwrap();
        store.put("subaccounts", "b", b"2").await.unwrap();

        let mut keys = store.list_keys("subaccounts").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
