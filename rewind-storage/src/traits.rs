//! Core key/value store trait.
//!
//! The `KeyValueStore` trait is the narrow contract the cache persistence
//! layer needs from a backend: point reads and writes, prefix lookup, an
//! atomic rename and a commit that replaces the previous entry in one step.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Key/value storage used by the response cache.
///
/// Keys are opaque strings; the persistence layer encodes request hashes,
/// dates and flags into them. Values are the fully serialised payloads.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync`. Mutating operations are
/// serialised by each backend so that a `rename` is never observed half-done
/// by a concurrent `get` or `save`.
///
/// # Error Handling
///
/// Reads of absent keys return `Ok(None)`. Errors are reserved for backend
/// failures (I/O, invalid keys).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Every entry whose key starts with `prefix`, keys and values read in
    /// one step.
    ///
    /// Used to locate the entry for a logical request regardless of the
    /// dates and flags encoded in the rest of its key. A concurrent
    /// [`commit`](Self::commit) or `rename` is observed either before or
    /// after, never in between.
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>>;

    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store `value` under `key`, overwriting any existing value.
    async fn save(&self, key: &str, value: Bytes) -> Result<()>;

    /// Delete the value stored under `key`.
    ///
    /// Returns whether a value was removed. Idempotent.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Move the value stored under `old_key` to `new_key`.
    ///
    /// At every point during the move at least one of the two keys resolves
    /// to the value. Overwrites `new_key` if it exists.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if `old_key` does not exist.
    async fn rename(&self, old_key: &str, new_key: &str) -> Result<()>;

    /// Store `value` under `key`, replacing every other key that starts
    /// with `replaces_prefix`.
    ///
    /// Backends whose writes can be interrupted stage the value under
    /// `pending_key` first, so a partial write never lands under `key`.
    /// Superseded entries are dropped before capacity is checked, so
    /// replacing an entry never evicts an unrelated one.
    async fn commit(
        &self,
        pending_key: &str,
        key: &str,
        value: Bytes,
        replaces_prefix: &str,
    ) -> Result<()>;

    /// List every stored key.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Snapshot of every stored entry.
    ///
    /// Keys that disappear between listing and reading are skipped.
    async fn values(&self) -> Result<Vec<(String, Bytes)>> {
        let keys = self.keys().await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key).await? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    /// Get a human-readable name for this storage backend.
    fn backend_name(&self) -> &'static str;
}
