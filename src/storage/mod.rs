//! Storage layer.
//!
//! Defines the [`StorageBackend`] trait the rest of the crate persists
//! through, plus an in-memory and a SQLite implementation.

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
pub use traits::{StorageBackend, StorageError, StorageResult};
