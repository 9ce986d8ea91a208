//! Persistence backends for the rewind response cache.
//!
//! This crate provides the key/value contract the cache layer persists
//! through, plus the concrete backends:
//!
//! - [`MemoryStore`]: bounded in-memory LRU
//! - [`FileStore`]: one file per entry, key encoded in the file name
//! - [`SqliteStore`]: a queryable SQL table with an expiry index
//!
//! # Example
//!
//! ```ignore
//! use rewind_storage::{KeyValueStore, MemoryStore};
//! use bytes::Bytes;
//!
//! let store = MemoryStore::new(20);
//! store.save("pending-abc", Bytes::from("payload")).await?;
//! store.rename("pending-abc", "abc_def_1_2_0_0").await?;
//! ```

mod error;
mod file;
mod memory;
mod sqlite;
mod stats;
mod traits;

pub use error::{Result, StorageError};
pub use file::FileStore;
pub use memory::{MemoryStore, DEFAULT_MAX_ENTRIES};
pub use sqlite::{CacheRow, SqliteStore};
pub use stats::StoreStats;
pub use traits::KeyValueStore;

// Re-export bytes for convenience
pub use bytes::Bytes;
