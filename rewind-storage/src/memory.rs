//! Bounded in-memory LRU store.
//!
//! Entries are evicted purely by recency once the configured number of
//! entries is reached. Reads and prefix lookups refresh recency.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{Result, StorageError};
use crate::stats::StoreStats;
use crate::traits::KeyValueStore;

/// Default number of entries kept in memory.
pub const DEFAULT_MAX_ENTRIES: usize = 20;

#[derive(Debug)]
struct MemoryEntry {
    value: Bytes,
    last_accessed: AtomicU64,
}

/// In-memory LRU key/value store.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
    max_entries: usize,
    access_counter: Arc<AtomicU64>,
    stats: Arc<StoreStats>,
}

impl MemoryStore {
    /// Create a store holding at most `max_entries` entries (minimum 1).
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_entries: max_entries.max(1),
            access_counter: Arc::new(AtomicU64::new(0)),
            stats: Arc::new(StoreStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<StoreStats> {
        Arc::clone(&self.stats)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn tick(&self) -> u64 {
        self.access_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn evict_lru(entries: &mut HashMap<String, MemoryEntry>, stats: &StoreStats) -> Option<String> {
        let lru_key = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed.load(Ordering::Relaxed))
            .map(|(k, _)| k.clone())?;

        entries.remove(&lru_key)?;
        stats.evict();
        metrics::counter!("rewind_store_evictions_total", "backend" => "memory").increment(1);
        Some(lru_key)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entry_count())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let entries = self.entries.read();
        let found: Vec<(String, Bytes)> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, entry)| {
                entry.last_accessed.store(self.tick(), Ordering::Relaxed);
                (k.clone(), entry.value.clone())
            })
            .collect();

        if found.is_empty() {
            self.stats.miss();
        } else {
            self.stats.hit();
        }
        Ok(found)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) => {
                self.stats.hit();
                entry.last_accessed.store(self.tick(), Ordering::Relaxed);
                Ok(Some(entry.value.clone()))
            }
            None => {
                self.stats.miss();
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, value), fields(key = %key, size = value.len()))]
    async fn save(&self, key: &str, value: Bytes) -> Result<()> {
        let mut entries = self.entries.write();

        if !entries.contains_key(key) {
            while entries.len() >= self.max_entries {
                match Self::evict_lru(&mut entries, &self.stats) {
                    Some(evicted) => debug!("Evicted least recently used entry {}", evicted),
                    None => break,
                }
            }
        }

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                last_accessed: AtomicU64::new(self.tick()),
            },
        );
        Ok(())
    }

    /// Inserts under a single write guard, so the provisional key is never
    /// materialised and never occupies a slot.
    #[instrument(skip_all, fields(key = %key, size = value.len()))]
    async fn commit(
        &self,
        _pending_key: &str,
        key: &str,
        value: Bytes,
        replaces_prefix: &str,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        entries.retain(|k, _| k == key || !k.starts_with(replaces_prefix));

        if !entries.contains_key(key) {
            while entries.len() >= self.max_entries {
                match Self::evict_lru(&mut entries, &self.stats) {
                    Some(evicted) => debug!("Evicted least recently used entry {}", evicted),
                    None => break,
                }
            }
        }

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                last_accessed: AtomicU64::new(self.tick()),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    #[instrument(skip(self))]
    async fn rename(&self, old_key: &str, new_key: &str) -> Result<()> {
        // Single write guard: readers see either the old or the new key.
        let mut entries = self.entries.write();
        let entry = entries
            .remove(old_key)
            .ok_or_else(|| StorageError::NotFound(old_key.to_string()))?;
        entry.last_accessed.store(self.tick(), Ordering::Relaxed);
        entries.insert(new_key.to_string(), entry);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    async fn values(&self) -> Result<Vec<(String, Bytes)>> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = MemoryStore::new(5);
        assert_eq!(store.entry_count(), 0);
        assert_eq!(store.max_entries(), 5);
        assert!(store.get("missing").await.unwrap().is_none());
        assert_eq!(store.stats().misses(), 1);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let store = MemoryStore::new(0);
        assert_eq!(store.max_entries(), 1);
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = MemoryStore::new(5);
        store.save("key_1", bytes("value")).await.unwrap();

        assert_eq!(store.get("key_1").await.unwrap(), Some(bytes("value")));
        assert_eq!(store.stats().hits(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let store = MemoryStore::new(2);
        store.save("a", bytes("1")).await.unwrap();
        store.save("b", bytes("2")).await.unwrap();
        store.save("a", bytes("3")).await.unwrap();

        assert_eq!(store.entry_count(), 2);
        assert_eq!(store.get("a").await.unwrap(), Some(bytes("3")));
        assert_eq!(store.stats().evictions(), 0);
    }

    #[tokio::test]
    async fn test_inserting_past_capacity_evicts_exactly_lru() {
        let capacity = 4;
        let store = MemoryStore::new(capacity);
        for i in 0..capacity {
            store.save(&format!("k{}", i), bytes("v")).await.unwrap();
        }

        // Touch k0 so k1 becomes the least recently used.
        store.get("k0").await.unwrap();
        store.save("k_new", bytes("v")).await.unwrap();

        assert_eq!(store.entry_count(), capacity);
        assert_eq!(store.stats().evictions(), 1);
        assert!(store.get("k1").await.unwrap().is_none());
        for key in ["k0", "k2", "k3", "k_new"] {
            assert!(store.get(key).await.unwrap().is_some(), "{} was evicted", key);
        }
    }

    #[tokio::test]
    async fn test_find_by_prefix() {
        let store = MemoryStore::new(5);
        store.save("abc_def_100_200_0_1", bytes("v")).await.unwrap();
        store.save("xyz_def_100_200_0_1", bytes("w")).await.unwrap();

        assert_eq!(
            store.find_by_prefix("abc_def_").await.unwrap(),
            vec![("abc_def_100_200_0_1".to_string(), bytes("v"))]
        );
        assert!(store.find_by_prefix("nope_").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_replacing_at_capacity_keeps_other_entries() {
        let store = MemoryStore::new(2);
        store.commit("pending-a", "a_1", bytes("a1"), "a_").await.unwrap();
        store.commit("pending-b", "b_1", bytes("b1"), "b_").await.unwrap();
        store.get("a_1").await.unwrap();

        store.commit("pending-a", "a_2", bytes("a2"), "a_").await.unwrap();

        assert_eq!(store.entry_count(), 2);
        assert_eq!(store.stats().evictions(), 0);
        assert!(store.get("a_1").await.unwrap().is_none());
        assert_eq!(store.get("a_2").await.unwrap(), Some(bytes("a2")));
        assert_eq!(store.get("b_1").await.unwrap(), Some(bytes("b1")));
        assert!(store.get("pending-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_new_entry_past_capacity_evicts_lru() {
        let store = MemoryStore::new(2);
        store.commit("p", "a_1", bytes("a"), "a_").await.unwrap();
        store.commit("p", "b_1", bytes("b"), "b_").await.unwrap();
        store.get("a_1").await.unwrap();

        store.commit("p", "c_1", bytes("c"), "c_").await.unwrap();

        assert_eq!(store.entry_count(), 2);
        assert_eq!(store.stats().evictions(), 1);
        assert!(store.get("b_1").await.unwrap().is_none());
        assert!(store.get("a_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rename() {
        let store = MemoryStore::new(5);
        store.save("old", bytes("payload")).await.unwrap();
        store.rename("old", "new").await.unwrap();

        assert!(store.get("old").await.unwrap().is_none());
        assert_eq!(store.get("new").await.unwrap(), Some(bytes("payload")));
    }

    #[tokio::test]
    async fn test_rename_missing_key() {
        let store = MemoryStore::new(5);
        let err = store.rename("missing", "new").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rename_never_loses_both_keys() {
        let store = MemoryStore::new(100);
        store.save("k_a", bytes("payload")).await.unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    let (from, to) = if i % 2 == 0 { ("k_a", "k_b") } else { ("k_b", "k_a") };
                    store.rename(from, to).await.unwrap();
                }
            })
        };

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    let found = store.find_by_prefix("k_").await.unwrap();
                    assert_eq!(found.len(), 1, "rename observed half-done");
                }
            })
        };

        writer.await.unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new(5);
        store.save("k", bytes("v")).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
