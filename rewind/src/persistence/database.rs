//! Persistence over the SQLite response table.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rewind_storage::{CacheRow, SqliteStore};
use tracing::{debug, instrument, warn};

use super::{CachedPayload, PersistenceManager, StoredEntry};
use crate::error::Result;
use crate::request::{HashedRequestMetadata, ResponseType};
use crate::serialisation::CacheKey;

pub struct DatabasePersistenceManager {
    store: SqliteStore,
    max_entries: Option<usize>,
}

impl DatabasePersistenceManager {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            store,
            max_entries: None,
        }
    }

    /// Cap the table, evicting the oldest rows after each write.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries.max(1));
        self
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }
}

fn to_date(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

fn key_from_row(row: &CacheRow) -> Option<CacheKey> {
    Some(CacheKey {
        request_hash: row.token.clone(),
        class_hash: row.class_hash.clone(),
        cache_date: to_date(row.cache_date)?,
        expiry_date: to_date(row.expiry_date)?,
        is_compressed: row.is_compressed,
        is_encrypted: row.is_encrypted,
    })
}

#[async_trait]
impl PersistenceManager for DatabasePersistenceManager {
    #[instrument(skip(self, key, body), fields(size = body.len()))]
    async fn cache(&self, key: &CacheKey, response_type: &ResponseType, body: Bytes) -> Result<()> {
        let row = CacheRow {
            token: key.request_hash.clone(),
            class_hash: key.class_hash.clone(),
            class_name: response_type.name().to_string(),
            cache_date: key.cache_date.timestamp_millis(),
            expiry_date: key.expiry_date.timestamp_millis(),
            data: body.to_vec(),
            is_compressed: key.is_compressed,
            is_encrypted: key.is_encrypted,
        };
        self.store.upsert(&row).await?;

        if let Some(max_entries) = self.max_entries {
            let evicted = self.store.evict_oldest(max_entries).await?;
            if evicted > 0 {
                debug!("Evicted {} oldest rows", evicted);
                metrics::counter!("rewind_cache_evictions_total", "backend" => "sqlite")
                    .increment(evicted as u64);
            }
        }
        Ok(())
    }

    async fn get_cached(&self, metadata: &HashedRequestMetadata) -> Result<Option<CachedPayload>> {
        let Some(row) = self
            .store
            .find(metadata.request_hash(), metadata.class_hash())
            .await?
        else {
            return Ok(None);
        };

        match key_from_row(&row) {
            Some(key) => Ok(Some(CachedPayload {
                key,
                payload: Bytes::from(row.data),
            })),
            None => {
                warn!("Ignoring row {} with out-of-range dates", row.token);
                Ok(None)
            }
        }
    }

    async fn invalidate(&self, metadata: &HashedRequestMetadata) -> Result<bool> {
        if self
            .store
            .expire(metadata.request_hash(), metadata.class_hash())
            .await?
        {
            return Ok(true);
        }
        // Already expired rows still count as found.
        Ok(self
            .store
            .find(metadata.request_hash(), metadata.class_hash())
            .await?
            .is_some())
    }

    async fn evict(&self, metadata: &HashedRequestMetadata) -> Result<bool> {
        Ok(self
            .store
            .delete(metadata.request_hash(), metadata.class_hash())
            .await?)
    }

    async fn clear(
        &self,
        class_hash: Option<&str>,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        Ok(self
            .store
            .delete_matching(class_hash, expired_at.map(|at| at.timestamp_millis()))
            .await?)
    }

    async fn entries(&self) -> Result<Vec<StoredEntry>> {
        let entries = self
            .store
            .rows()
            .await?
            .into_iter()
            .filter_map(|row| {
                let key = key_from_row(&row)?;
                Some(StoredEntry {
                    type_name: row.class_name,
                    key,
                })
            })
            .collect();
        Ok(entries)
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.store.evict_expired(now.timestamp_millis()).await?)
    }

    fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Hasher, PlainRequestMetadata};

    fn metadata(url: &str, type_name: &str) -> HashedRequestMetadata {
        Hasher::new().hash(&PlainRequestMetadata::new(ResponseType::new(type_name), url))
    }

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    fn key_for(metadata: &HashedRequestMetadata, cache: i64, expiry: i64) -> CacheKey {
        CacheKey {
            request_hash: metadata.request_hash().to_string(),
            class_hash: metadata.class_hash().to_string(),
            cache_date: at(cache),
            expiry_date: at(expiry),
            is_compressed: true,
            is_encrypted: false,
        }
    }

    fn manager() -> DatabasePersistenceManager {
        DatabasePersistenceManager::new(SqliteStore::in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_cache_and_get() {
        let manager = manager();
        let meta = metadata("https://api.test/db", "app::Row");
        let ty = ResponseType::new("app::Row");

        manager
            .cache(&key_for(&meta, 1_000, 5_000), &ty, Bytes::from_static(b"app::Row\n{}"))
            .await
            .unwrap();
        manager
            .cache(&key_for(&meta, 2_000, 6_000), &ty, Bytes::from_static(b"app::Row\n[]"))
            .await
            .unwrap();

        let cached = manager.get_cached(&meta).await.unwrap().unwrap();
        assert_eq!(cached.key, key_for(&meta, 2_000, 6_000));
        assert_eq!(cached.payload, Bytes::from_static(b"app::Row\n[]"));
        assert_eq!(manager.store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_evict() {
        let manager = manager();
        let meta = metadata("https://api.test/db", "app::Row");
        assert!(!manager.invalidate(&meta).await.unwrap());

        manager
            .cache(&key_for(&meta, 1_000, 5_000), &ResponseType::new("app::Row"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(manager.invalidate(&meta).await.unwrap());
        assert!(manager.invalidate(&meta).await.unwrap());
        let cached = manager.get_cached(&meta).await.unwrap().unwrap();
        assert_eq!(cached.key.expiry_date, at(1_000));

        assert!(manager.evict(&meta).await.unwrap());
        assert!(manager.get_cached(&meta).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_and_clear() {
        let manager = manager();
        let a = metadata("https://api.test/1", "app::A");
        let b = metadata("https://api.test/1", "app::B");
        manager
            .cache(&key_for(&a, 0, 100), &ResponseType::new("app::A"), Bytes::from_static(b"a"))
            .await
            .unwrap();
        manager
            .cache(&key_for(&b, 0, 900), &ResponseType::new("app::B"), Bytes::from_static(b"b"))
            .await
            .unwrap();

        let mut names: Vec<_> = manager
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.type_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["app::A", "app::B"]);

        assert_eq!(manager.clear(None, Some(at(500))).await.unwrap(), 1);
        assert_eq!(manager.clear(Some(b.class_hash()), None).await.unwrap(), 1);
        assert!(manager.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_max_entries_evicts_oldest() {
        let manager = manager().with_max_entries(2);
        let ty = ResponseType::new("app::Row");
        for i in 0..3 {
            let meta = metadata(&format!("https://api.test/{}", i), "app::Row");
            manager
                .cache(&key_for(&meta, i * 10, 1_000), &ty, Bytes::from_static(b"r"))
                .await
                .unwrap();
        }

        assert_eq!(manager.store().count().await.unwrap(), 2);
        let first = metadata("https://api.test/0", "app::Row");
        assert!(manager.get_cached(&first).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let manager = manager();
        let meta = metadata("https://api.test/x", "app::Row");
        manager
            .cache(&key_for(&meta, 0, 100), &ResponseType::new("app::Row"), Bytes::from_static(b"r"))
            .await
            .unwrap();
        assert_eq!(manager.evict_expired(at(99)).await.unwrap(), 0);
        assert_eq!(manager.evict_expired(at(100)).await.unwrap(), 1);
    }
}
