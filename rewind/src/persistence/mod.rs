//! Persistence of serialised responses.
//!
//! Two layers:
//!
//! - [`PersistenceManager`]: object-safe, byte-level contract implemented by
//!   each backend family ([`KeyValuePersistenceManager`] for the memory and
//!   file stores, [`DatabasePersistenceManager`] for SQLite).
//! - [`ResponsePersistence`]: typed layer shared by every backend. It decides
//!   flags and dates, runs the serialisation pipeline and turns read-side
//!   failures into misses.

mod database;
mod key_value;

pub use database::DatabasePersistenceManager;
pub use key_value::KeyValuePersistenceManager;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use rewind_storage::{FileStore, MemoryStore, SqliteStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::{BackendKind, CacheSettings, RewindConfig};
use crate::error::{CacheError, Result};
use crate::request::{HashedRequestMetadata, Hasher, ResponseType};
use crate::serialisation::{
    CacheKey, KeySerialiser, SerialisationDecorationMetadata, SerialisationManager,
};
use crate::statistics::{CacheStatistics, StatisticsCompiler};
use crate::token::{CacheStatus, CacheToken};

/// A committed entry as read back from a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPayload {
    pub key: CacheKey,
    pub payload: Bytes,
}

/// A persisted record in one of its two phases.
///
/// `Incomplete` records sit under a provisional key while a write is in
/// flight; they are invisible to lookups and never parse as committed keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDataHolder {
    Incomplete { pending_key: String, payload: Bytes },
    Complete(CachedPayload),
}

impl CacheDataHolder {
    /// Classify a raw stored key. Keys that are neither provisional nor a
    /// valid committed key yield `None`.
    pub fn from_stored(raw_key: &str, payload: Bytes) -> Option<Self> {
        if KeySerialiser::is_pending(raw_key) {
            return Some(CacheDataHolder::Incomplete {
                pending_key: raw_key.to_string(),
                payload,
            });
        }
        KeySerialiser::parse(raw_key)
            .map(|key| CacheDataHolder::Complete(CachedPayload { key, payload }))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, CacheDataHolder::Complete(_))
    }
}

/// What a backend knows about one committed entry, without decoding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub type_name: String,
    pub key: CacheKey,
}

/// Byte-level persistence backend.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; a manager is shared by every
/// in-flight request.
///
/// # Errors
///
/// Every method reports backend failures. Deciding whether a failure is
/// swallowed (reads) or surfaced (writes, invalidation, clearing) is the
/// job of [`ResponsePersistence`].
#[async_trait]
pub trait PersistenceManager: Send + Sync {
    /// Commit `body` under `key`, replacing any entry for the same request
    /// and response type. A failure part-way through never leaves a
    /// readable partial entry.
    async fn cache(&self, key: &CacheKey, response_type: &ResponseType, body: Bytes)
        -> Result<()>;

    /// The committed entry for a request, if any.
    async fn get_cached(&self, metadata: &HashedRequestMetadata)
        -> Result<Option<CachedPayload>>;

    /// Pull the entry's expiry back to its cache date. Returns whether an
    /// entry was found.
    async fn invalidate(&self, metadata: &HashedRequestMetadata) -> Result<bool>;

    /// Delete the entry for a request.
    async fn evict(&self, metadata: &HashedRequestMetadata) -> Result<bool>;

    /// Delete entries, optionally restricted to one class hash and/or to
    /// entries stale at `expired_at`. Returns the number deleted.
    async fn clear(&self, class_hash: Option<&str>, expired_at: Option<DateTime<Utc>>)
        -> Result<usize>;

    /// Every committed entry.
    async fn entries(&self) -> Result<Vec<StoredEntry>>;

    /// Delete every entry stale at `now`.
    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.clear(None, Some(now)).await
    }

    /// Delete provisional records left behind by interrupted writes.
    async fn purge_incomplete(&self) -> Result<usize> {
        Ok(0)
    }

    fn backend_name(&self) -> &'static str;
}

/// Build the backend selected by the configuration.
pub struct PersistenceFactory;

impl PersistenceFactory {
    pub fn create(config: &RewindConfig) -> Result<Arc<dyn PersistenceManager>> {
        let persistence = &config.persistence;
        let manager: Arc<dyn PersistenceManager> = match persistence.backend {
            BackendKind::Memory => Arc::new(KeyValuePersistenceManager::new(MemoryStore::new(
                persistence.max_entries,
            ))),
            BackendKind::File => Arc::new(KeyValuePersistenceManager::new(FileStore::new(
                persistence.path.clone(),
            ))),
            BackendKind::Sqlite => Arc::new(
                DatabasePersistenceManager::new(SqliteStore::new(persistence.sqlite_path())?)
                    .with_max_entries(persistence.max_entries),
            ),
        };
        info!(
            "Using {} persistence at {}",
            manager.backend_name(),
            persistence.path.display()
        );
        Ok(manager)
    }
}

/// `now + secs`, saturating at the latest representable date.
pub(crate) fn expiry_after(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|duration| now.checked_add_signed(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Typed persistence over a shared backend.
#[derive(Clone)]
pub struct ResponsePersistence {
    manager: Arc<dyn PersistenceManager>,
    serialisation: SerialisationManager,
    clock: Arc<dyn Clock>,
    defaults: CacheSettings,
}

impl ResponsePersistence {
    pub fn new(
        manager: Arc<dyn PersistenceManager>,
        serialisation: SerialisationManager,
        clock: Arc<dyn Clock>,
        defaults: CacheSettings,
    ) -> Self {
        Self {
            manager,
            serialisation,
            clock,
            defaults,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.manager.backend_name()
    }

    /// Flags for a new write: inherited from the entry being replaced,
    /// otherwise operation ?? configuration. Encryption also needs a key.
    fn write_flags(&self, token: &CacheToken, previous: Option<&CacheToken>) -> (bool, bool) {
        let (compress, encrypt) = match previous {
            Some(previous) => (previous.is_compressed(), previous.is_encrypted()),
            None => {
                let operation = token.operation();
                (
                    operation.compress().unwrap_or(self.defaults.compress),
                    operation.encrypt().unwrap_or(self.defaults.encrypt),
                )
            }
        };
        (compress, encrypt && self.serialisation.can_encrypt())
    }

    /// Serialise and commit a network response.
    ///
    /// Returns the token refined with the entry's flags and dates.
    ///
    /// # Errors
    ///
    /// Fails for unhashable requests, serialisation errors and backend
    /// write failures.
    #[instrument(skip(self, response, token, previous), fields(response_type = %token.request_metadata().response_type()))]
    pub async fn cache_response<R: Serialize + Sync>(
        &self,
        response: &R,
        token: &CacheToken,
        previous: Option<&CacheToken>,
    ) -> Result<CacheToken> {
        let metadata = token.request_metadata();
        if !metadata.is_valid() {
            return Err(CacheError::InvalidOperation(format!(
                "Cannot cache unhashable request for {}",
                metadata.url()
            )));
        }

        let (is_compressed, is_encrypted) = self.write_flags(token, previous);
        let duration_secs = token
            .operation()
            .duration_secs()
            .unwrap_or(self.defaults.duration_secs);
        let now = self.clock.now();
        let cached = token
            .with_flags(is_compressed, is_encrypted)
            .with_dates(now, expiry_after(now, duration_secs));

        let key = CacheKey {
            request_hash: metadata.request_hash().to_string(),
            class_hash: metadata.class_hash().to_string(),
            cache_date: now,
            expiry_date: cached.expiry_date().unwrap_or(now),
            is_compressed,
            is_encrypted,
        };

        let body = self
            .serialisation
            .serialise(
                response,
                metadata.response_type(),
                SerialisationDecorationMetadata::new(is_compressed, is_encrypted),
            )
            .await?;

        if let Err(e) = self
            .manager
            .cache(&key, metadata.response_type(), body)
            .await
        {
            error!("Failed to cache response for {}: {}", metadata.url(), e);
            return Err(e);
        }

        debug!(
            "Cached response for {} until {}",
            metadata.url(),
            key.expiry_date
        );
        Ok(cached)
    }

    /// Look up and decode the cached response for a token.
    ///
    /// Fails open: backend errors and undecodable entries are misses, and
    /// undecodable entries are evicted.
    #[instrument(skip(self, token), fields(response_type = %token.request_metadata().response_type()))]
    pub async fn get_cached_response<R: DeserializeOwned>(
        &self,
        token: &CacheToken,
    ) -> Option<(R, CacheToken)> {
        let metadata = token.request_metadata();
        if !metadata.is_valid() {
            return None;
        }
        let backend = self.backend_name();

        let cached = match self.manager.get_cached(metadata).await {
            Ok(Some(cached)) => cached,
            Ok(None) => {
                metrics::counter!("rewind_cache_misses_total", "backend" => backend).increment(1);
                return None;
            }
            Err(e) => {
                warn!("Cache lookup failed for {}: {}", metadata.url(), e);
                metrics::counter!("rewind_cache_misses_total", "backend" => backend).increment(1);
                return None;
            }
        };

        let key = cached.key;
        let decoded = self
            .serialisation
            .deserialise::<R>(
                metadata.response_type(),
                SerialisationDecorationMetadata::new(key.is_compressed, key.is_encrypted),
                cached.payload,
            )
            .await;

        match decoded {
            Ok(response) => {
                let status = CacheStatus::from_expiry(self.clock.now(), key.expiry_date);
                metrics::counter!("rewind_cache_hits_total", "backend" => backend).increment(1);
                let token = CacheToken::cached(
                    token.instruction().clone(),
                    status,
                    key.is_compressed,
                    key.is_encrypted,
                    key.cache_date,
                    key.expiry_date,
                );
                Some((response, token))
            }
            Err(e) => {
                warn!(
                    "Evicting undecodable entry for {}: {}",
                    metadata.url(),
                    e
                );
                if let Err(e) = self.manager.evict(metadata).await {
                    warn!("Failed to evict undecodable entry: {}", e);
                }
                metrics::counter!("rewind_cache_evictions_total", "backend" => backend)
                    .increment(1);
                metrics::counter!("rewind_cache_misses_total", "backend" => backend).increment(1);
                None
            }
        }
    }

    /// Soft-invalidate the entry for a token; the payload stays readable.
    pub async fn invalidate(&self, token: &CacheToken) -> Result<bool> {
        let metadata = token.request_metadata();
        if !metadata.is_valid() {
            return Ok(false);
        }
        self.manager.invalidate(metadata).await
    }

    /// Delete entries of one response type (all types if `None`), or only
    /// the stale ones.
    #[instrument(skip(self))]
    pub async fn clear(&self, type_to_clear: Option<&str>, stale_only: bool) -> Result<usize> {
        let class_hash = type_to_clear.map(Hasher::hash_text);
        let expired_at = stale_only.then(|| self.clock.now());
        let deleted = self.manager.clear(class_hash.as_deref(), expired_at).await?;
        info!("Cleared {} entries", deleted);
        Ok(deleted)
    }

    /// Delete every entry that is stale now.
    pub async fn evict_expired(&self) -> Result<usize> {
        let deleted = self.manager.evict_expired(self.clock.now()).await?;
        metrics::counter!("rewind_cache_evictions_total", "backend" => self.backend_name())
            .increment(deleted as u64);
        Ok(deleted)
    }

    pub async fn purge_incomplete(&self) -> Result<usize> {
        self.manager.purge_incomplete().await
    }

    pub async fn statistics(&self) -> Result<CacheStatistics> {
        let entries = self.manager.entries().await?;
        Ok(StatisticsCompiler::compile(
            self.backend_name(),
            entries,
            self.clock.now(),
        ))
    }
}

impl std::fmt::Debug for ResponsePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponsePersistence")
            .field("backend", &self.backend_name())
            .field("serialisation", &self.serialisation)
            .finish()
    }
}
