//! Persistence over a [`KeyValueStore`].
//!
//! Dates and flags live in the key, the framed body in the value. Writes go
//! through [`KeyValueStore::commit`], which stages the body under a
//! provisional key where a write can be interrupted and replaces the
//! previous entry for the request in the same step.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use rewind_storage::KeyValueStore;
use tracing::{debug, instrument, warn};

use super::{CacheDataHolder, CachedPayload, PersistenceManager, StoredEntry};
use crate::error::Result;
use crate::request::{HashedRequestMetadata, ResponseType};
use crate::serialisation::{CacheKey, KeySerialiser, SerialisationManager};

pub struct KeyValuePersistenceManager<S> {
    store: S,
}

impl<S: KeyValueStore> KeyValuePersistenceManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The newest committed entry for a request, with its raw key.
    ///
    /// Several committed keys only coexist after an interrupted replace;
    /// the latest cache date wins.
    async fn latest(&self, metadata: &HashedRequestMetadata) -> Result<Option<(String, CachedPayload)>> {
        let found = self
            .store
            .find_by_prefix(&KeySerialiser::partial_key(metadata))
            .await?;

        Ok(found
            .into_iter()
            .filter_map(|(raw_key, payload)| {
                match CacheDataHolder::from_stored(&raw_key, payload) {
                    Some(CacheDataHolder::Complete(cached)) => Some((raw_key, cached)),
                    _ => {
                        warn!("Ignoring unparseable key {}", raw_key);
                        None
                    }
                }
            })
            .max_by_key(|(_, cached)| cached.key.cache_date))
    }

    async fn delete_all(&self, keys: Vec<String>) -> Result<usize> {
        let deleted = try_join_all(keys.iter().map(|key| self.store.delete(key))).await?;
        Ok(deleted.into_iter().filter(|removed| *removed).count())
    }
}

#[async_trait]
impl<S: KeyValueStore> PersistenceManager for KeyValuePersistenceManager<S> {
    #[instrument(skip(self, key, body), fields(backend = self.store.backend_name(), size = body.len()))]
    async fn cache(&self, key: &CacheKey, response_type: &ResponseType, body: Bytes) -> Result<()> {
        let committed = KeySerialiser::serialise_parts(key);
        let pending = KeySerialiser::pending_key(&key.request_hash);

        self.store
            .commit(&pending, &committed, body, &key.partial_key())
            .await?;

        debug!("Committed {} entry {}", response_type, committed);
        Ok(())
    }

    #[instrument(skip(self, metadata), fields(backend = self.store.backend_name()))]
    async fn get_cached(&self, metadata: &HashedRequestMetadata) -> Result<Option<CachedPayload>> {
        Ok(self.latest(metadata).await?.map(|(_, cached)| cached))
    }

    async fn invalidate(&self, metadata: &HashedRequestMetadata) -> Result<bool> {
        let mut retried = false;
        loop {
            let Some((raw_key, cached)) = self.latest(metadata).await? else {
                return Ok(false);
            };
            let mut key = cached.key;
            if key.expiry_date == key.cache_date {
                return Ok(true);
            }

            key.expiry_date = key.cache_date;
            match self
                .store
                .rename(&raw_key, &KeySerialiser::serialise_parts(&key))
                .await
            {
                Ok(()) => {
                    debug!("Invalidated {}", raw_key);
                    return Ok(true);
                }
                // Replaced by a concurrent write; invalidate the replacement.
                Err(e) if e.is_not_found() && !retried => retried = true,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn evict(&self, metadata: &HashedRequestMetadata) -> Result<bool> {
        let found = self
            .store
            .find_by_prefix(&KeySerialiser::partial_key(metadata))
            .await?;
        let keys = found.into_iter().map(|(raw_key, _)| raw_key).collect();
        Ok(self.delete_all(keys).await? > 0)
    }

    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    async fn clear(
        &self,
        class_hash: Option<&str>,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let matching: Vec<String> = self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|raw_key| {
                KeySerialiser::parse(raw_key).is_some_and(|key| {
                    class_hash.map_or(true, |hash| key.class_hash == hash)
                        && expired_at.map_or(true, |at| key.expiry_date <= at)
                })
            })
            .collect();

        self.delete_all(matching).await
    }

    async fn entries(&self) -> Result<Vec<StoredEntry>> {
        let entries = self
            .store
            .values()
            .await?
            .into_iter()
            .filter_map(|(raw_key, payload)| {
                match CacheDataHolder::from_stored(&raw_key, payload)? {
                    CacheDataHolder::Complete(cached) => {
                        let type_name = SerialisationManager::stored_type_name(&cached.payload)?;
                        Some(StoredEntry {
                            type_name,
                            key: cached.key,
                        })
                    }
                    CacheDataHolder::Incomplete { .. } => None,
                }
            })
            .collect();
        Ok(entries)
    }

    async fn purge_incomplete(&self) -> Result<usize> {
        let pending: Vec<String> = self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|raw_key| KeySerialiser::is_pending(raw_key))
            .collect();
        self.delete_all(pending).await
    }

    fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }
}
