//! The `Rewind` facade: resolves an operation for a call, consults the
//! cache, runs the caller's fetch when needed and reports what happened.
//!
//! ```no_run
//! # use rewind::{Rewind, RequestDescriptor, Operation, BoxError, RewindConfig};
//! # use tokio_util::sync::CancellationToken;
//! # async fn demo() -> rewind::Result<()> {
//! let rewind = Rewind::builder(RewindConfig::default()).build()?;
//! let request = RequestDescriptor::of::<Vec<String>>("https://api.example.com/tags");
//!
//! let response = rewind
//!     .resolve(&request, Operation::cache(), || async {
//!         Ok::<_, BoxError>(vec!["rust".to_string()])
//!     }, CancellationToken::new())
//!     .await;
//! println!("{} -> {:?}", response.status(), response.response);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{CacheSettings, RewindConfig};
use crate::error::{BoxError, CacheError, DefaultErrorClassifier, ErrorClassifier, Result};
use crate::operation::{CachePredicate, CachePriority, Operation, OperationResolver};
use crate::persistence::{PersistenceFactory, PersistenceManager, ResponsePersistence};
use crate::request::{Hasher, PlainRequestMetadata, ResponseType};
use crate::serialisation::{EncryptionConfig, SerialisationManager};
use crate::statistics::CacheStatistics;
use crate::token::{CacheInstruction, CacheStatus, CacheToken};

/// Identity of an outgoing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub url: String,
    pub body: Option<String>,
    pub response_type: ResponseType,
    /// Raw value of the operation header, if the call carried one.
    pub operation_header: Option<String>,
}

impl RequestDescriptor {
    pub fn new(response_type: ResponseType, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: None,
            response_type,
            operation_header: None,
        }
    }

    pub fn of<R: ?Sized + 'static>(url: impl Into<String>) -> Self {
        Self::new(ResponseType::of::<R>(), url)
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_operation_header(mut self, header: impl Into<String>) -> Self {
        self.operation_header = Some(header.into());
        self
    }

    fn plain_metadata(&self) -> PlainRequestMetadata {
        let plain = PlainRequestMetadata::new(self.response_type.clone(), self.url.clone());
        match &self.body {
            Some(body) => plain.with_body(body.clone()),
            None => plain,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallDuration {
    pub disk_ms: u64,
    pub network_ms: u64,
    pub total_ms: u64,
}

/// Attached to every response.
#[derive(Debug, Clone)]
pub struct CacheMetadata {
    pub cache_token: CacheToken,
    /// Set for error statuses and for failed cache writes.
    pub exception: Option<Arc<CacheError>>,
    pub call_duration: CallDuration,
}

/// A response plus what the cache did to produce it.
#[derive(Debug)]
pub struct CacheResponse<R> {
    pub response: Option<R>,
    pub metadata: CacheMetadata,
    /// Background refresh started for a `STALE` response; resolves to the
    /// final response.
    pub refresh: Option<JoinHandle<CacheResponse<R>>>,
}

impl<R> CacheResponse<R> {
    pub fn status(&self) -> CacheStatus {
        self.metadata.cache_token.status()
    }

    pub fn exception(&self) -> Option<&CacheError> {
        self.metadata.exception.as_deref()
    }

    /// The response body, or the reason there is none.
    pub fn into_result(self) -> std::result::Result<R, Arc<CacheError>> {
        match (self.response, self.metadata.exception) {
            (Some(response), _) => Ok(response),
            (None, Some(exception)) => Err(exception),
            (None, None) => Err(Arc::new(CacheError::EmptyResponse(format!(
                "No response for status {}",
                self.metadata.cache_token.status()
            )))),
        }
    }
}

struct Timings {
    started: Instant,
    disk: Duration,
    network: Duration,
}

impl Timings {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            disk: Duration::ZERO,
            network: Duration::ZERO,
        }
    }

    fn finish(&self) -> CallDuration {
        CallDuration {
            disk_ms: self.disk.as_millis() as u64,
            network_ms: self.network.as_millis() as u64,
            total_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

fn respond<R>(
    token: CacheToken,
    response: Option<R>,
    exception: Option<CacheError>,
    timings: &Timings,
) -> CacheResponse<R> {
    CacheResponse {
        response,
        metadata: CacheMetadata {
            cache_token: token,
            exception: exception.map(Arc::new),
            call_duration: timings.finish(),
        },
        refresh: None,
    }
}

struct RewindInner {
    settings: CacheSettings,
    persistence: ResponsePersistence,
    hasher: Hasher,
    resolver: OperationResolver,
    classifier: Arc<dyn ErrorClassifier>,
    clock: Arc<dyn Clock>,
}

/// Response cache handle. Cheap to clone.
#[derive(Clone)]
pub struct Rewind {
    inner: Arc<RewindInner>,
}

pub struct RewindBuilder {
    config: RewindConfig,
    clock: Option<Arc<dyn Clock>>,
    classifier: Option<Arc<dyn ErrorClassifier>>,
    predicate: Option<CachePredicate>,
    persistence: Option<Arc<dyn PersistenceManager>>,
    encryption: Option<EncryptionConfig>,
}

impl RewindBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn predicate(mut self, predicate: CachePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Use this backend instead of the configured one.
    pub fn persistence(mut self, persistence: Arc<dyn PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Use this key instead of the configured one.
    pub fn encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn build(self) -> Result<Rewind> {
        let encryption = match self.encryption {
            Some(encryption) => Some(encryption),
            None => self.config.encryption.load_key()?,
        };
        if self.config.cache.encrypt && encryption.is_none() {
            warn!("Encryption requested but no key configured; entries will be stored unencrypted");
        }

        let serialisation =
            SerialisationManager::standard(self.config.compression, encryption.as_ref())?;
        let manager = match self.persistence {
            Some(manager) => manager,
            None => PersistenceFactory::create(&self.config)?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let resolver = match self.predicate {
            Some(predicate) => OperationResolver::new().with_predicate(predicate),
            None => OperationResolver::new(),
        };

        Ok(Rewind {
            inner: Arc::new(RewindInner {
                persistence: ResponsePersistence::new(
                    manager,
                    serialisation,
                    clock.clone(),
                    self.config.cache.clone(),
                ),
                settings: self.config.cache,
                hasher: Hasher::new(),
                resolver,
                classifier: self
                    .classifier
                    .unwrap_or_else(|| Arc::new(DefaultErrorClassifier)),
                clock,
            }),
        })
    }
}

impl Rewind {
    pub fn builder(config: RewindConfig) -> RewindBuilder {
        RewindBuilder {
            config,
            clock: None,
            classifier: None,
            predicate: None,
            persistence: None,
            encryption: None,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    pub fn persistence(&self) -> &ResponsePersistence {
        &self.inner.persistence
    }

    fn token_for(&self, request: &RequestDescriptor, operation: Operation) -> CacheToken {
        let metadata = self.inner.hasher.hash(&request.plain_metadata());
        CacheToken::new(CacheInstruction::new(operation, metadata))
    }

    /// Resolve the operation (header, then `annotation`, then predicate,
    /// then default) and run it.
    pub async fn execute<R, F, Fut>(
        &self,
        request: &RequestDescriptor,
        annotation: Option<&Operation>,
        fetch: F,
        cancel: CancellationToken,
    ) -> CacheResponse<R>
    where
        R: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
    {
        let resolved = self.inner.resolver.resolve(
            &request.plain_metadata(),
            request.operation_header.as_deref(),
            annotation,
        );
        debug!(
            "Resolved {} from {:?} for {}",
            resolved.operation, resolved.source, request.url
        );
        self.resolve(request, resolved.operation, fetch, cancel).await
    }

    /// Run `operation` for `request`, calling `fetch` when the network is
    /// needed.
    ///
    /// Never fails: errors are reported through the response metadata.
    #[instrument(skip_all, fields(url = %request.url, operation = %operation))]
    pub async fn resolve<R, F, Fut>(
        &self,
        request: &RequestDescriptor,
        operation: Operation,
        fetch: F,
        cancel: CancellationToken,
    ) -> CacheResponse<R>
    where
        R: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
    {
        let mut timings = Timings::start();
        let token = self.token_for(request, operation.clone());

        match &operation {
            Operation::Clear(clear) => {
                let result = self
                    .inner
                    .persistence
                    .clear(clear.type_to_clear.as_deref(), clear.stale_entries_only)
                    .await;
                return self.completed(token, result.map(|_| ()), &timings);
            }
            Operation::Invalidate => {
                let result = self.inner.persistence.invalidate(&token).await;
                return self.completed(token, result.map(|_| ()), &timings);
            }
            _ => {}
        }

        if !self.inner.settings.enabled || !token.request_metadata().is_valid() {
            debug!("Bypassing cache for {}", request.url);
            return self.bypass(token, fetch, cancel, timings).await;
        }

        if let Operation::Refresh(_) = operation {
            if let Err(e) = self.inner.persistence.invalidate(&token).await {
                warn!("Failed to invalidate before refresh: {}", e);
            }
        }

        let disk_start = Instant::now();
        let cached = self.inner.persistence.get_cached_response::<R>(&token).await;
        timings.disk += disk_start.elapsed();

        if let Operation::Offline(_) = operation {
            return self.offline(token, cached, &timings);
        }

        match cached {
            Some((response, cached_token))
                if cached_token.status() == CacheStatus::Fresh
                    && matches!(operation, Operation::Cache(_)) =>
            {
                debug!("Serving fresh cached response");
                respond(cached_token, Some(response), None, &timings)
            }
            Some((response, cached_token)) if self.revalidates_in_background(&operation) => {
                debug!("Serving stale response, refreshing in background");
                let this = self.clone();
                let previous = cached_token.clone();
                let refresh = tokio::spawn(async move {
                    this.fetch_and_cache(token, Some((None, previous)), fetch, cancel, Timings::start())
                        .await
                });
                let mut stale = respond(cached_token, Some(response), None, &timings);
                stale.refresh = Some(refresh);
                stale
            }
            Some((response, cached_token)) => {
                self.fetch_and_cache(token, Some((Some(response), cached_token)), fetch, cancel, timings)
                    .await
            }
            None => self.fetch_and_cache(token, None, fetch, cancel, timings).await,
        }
    }

    fn revalidates_in_background(&self, operation: &Operation) -> bool {
        let settings = &self.inner.settings;
        matches!(operation, Operation::Cache(_))
            && settings.stale_while_revalidate
            && !operation.fresh_only()
            && operation.priority().unwrap_or(settings.priority) == CachePriority::StaleFirst
    }

    fn completed<R>(&self, token: CacheToken, result: Result<()>, timings: &Timings) -> CacheResponse<R> {
        match result {
            Ok(()) => respond(token.with_status(CacheStatus::Done), None, None, timings),
            Err(e) => {
                warn!("{} failed: {}", token.operation(), e);
                respond(token.with_status(CacheStatus::Empty), None, Some(e), timings)
            }
        }
    }

    fn offline<R>(
        &self,
        token: CacheToken,
        cached: Option<(R, CacheToken)>,
        timings: &Timings,
    ) -> CacheResponse<R> {
        match cached {
            Some((response, cached_token)) if cached_token.status() == CacheStatus::Fresh => {
                respond(cached_token, Some(response), None, timings)
            }
            Some((response, cached_token)) if !token.operation().fresh_only() => respond(
                cached_token.with_status(CacheStatus::OfflineStale),
                Some(response),
                None,
                timings,
            ),
            Some(_) => respond(
                token.with_status(CacheStatus::Empty),
                None,
                Some(CacheError::EmptyResponse(
                    "Only stale data is cached and fresh data was required".to_string(),
                )),
                timings,
            ),
            None => respond(
                token.with_status(CacheStatus::Empty),
                None,
                Some(CacheError::EmptyResponse(
                    "No cached response available offline".to_string(),
                )),
                timings,
            ),
        }
    }

    /// Run the fetch, racing the cancellation token.
    async fn fetch<R, F, Fut>(
        &self,
        fetch: F,
        cancel: &CancellationToken,
        timings: &mut Timings,
    ) -> std::result::Result<R, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<R, BoxError>>,
    {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        metrics::counter!("rewind_network_fetches_total", "backend" => self.inner.persistence.backend_name())
            .increment(1);
        let network_start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            result = fetch() => result.map_err(|e| {
                let error: &(dyn std::error::Error + 'static) = e.as_ref();
                CacheError::Network(self.inner.classifier.classify(error))
            }),
        };
        timings.network += network_start.elapsed();
        outcome
    }

    async fn bypass<R, F, Fut>(
        &self,
        token: CacheToken,
        fetch: F,
        cancel: CancellationToken,
        mut timings: Timings,
    ) -> CacheResponse<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<R, BoxError>>,
    {
        match self.fetch(fetch, &cancel, &mut timings).await {
            Ok(response) => respond(
                token
                    .with_status(CacheStatus::NotCached)
                    .with_fetch_date(self.inner.clock.now()),
                Some(response),
                None,
                &timings,
            ),
            Err(e) => respond(token.with_status(CacheStatus::Empty), None, Some(e), &timings),
        }
    }

    /// Fetch, then persist. `stale` carries the previously cached entry,
    /// with its body when it may still be delivered on failure.
    async fn fetch_and_cache<R, F, Fut>(
        &self,
        token: CacheToken,
        stale: Option<(Option<R>, CacheToken)>,
        fetch: F,
        cancel: CancellationToken,
        mut timings: Timings,
    ) -> CacheResponse<R>
    where
        R: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<R, BoxError>>,
    {
        let response = match self.fetch(fetch, &cancel, &mut timings).await {
            Ok(response) => response,
            Err(error) => return self.fetch_failed(token, stale, error, &timings),
        };

        let status = if stale.is_some() {
            CacheStatus::Refreshed
        } else {
            CacheStatus::Network
        };
        let fetch_date = self.inner.clock.now();
        let previous = stale.as_ref().map(|(_, previous)| previous);

        let disk_start = Instant::now();
        let written = self
            .inner
            .persistence
            .cache_response(&response, &token, previous)
            .await;
        timings.disk += disk_start.elapsed();

        match written {
            Ok(cached_token) => respond(
                cached_token.with_status(status).with_fetch_date(fetch_date),
                Some(response),
                None,
                &timings,
            ),
            Err(e) => respond(
                token
                    .with_status(CacheStatus::NotCached)
                    .with_fetch_date(fetch_date),
                Some(response),
                Some(e),
                &timings,
            ),
        }
    }

    fn fetch_failed<R>(
        &self,
        token: CacheToken,
        stale: Option<(Option<R>, CacheToken)>,
        error: CacheError,
        timings: &Timings,
    ) -> CacheResponse<R> {
        info!("Fetch failed for {}: {}", token.request_metadata().url(), error);

        let operation = token.operation();
        let merge = operation
            .merge_on_error()
            .unwrap_or(self.inner.settings.merge_on_error);
        let cancelled = matches!(error, CacheError::Cancelled);

        match stale {
            Some((Some(response), stale_token)) if merge && !operation.fresh_only() && !cancelled => {
                respond(
                    stale_token.with_status(CacheStatus::CouldNotRefresh),
                    Some(response),
                    Some(error),
                    timings,
                )
            }
            _ => respond(token.with_status(CacheStatus::Empty), None, Some(error), timings),
        }
    }

    /// Soft-invalidate the cached response for a request.
    pub async fn invalidate(&self, request: &RequestDescriptor) -> Result<bool> {
        let token = self.token_for(request, Operation::Invalidate);
        self.inner.persistence.invalidate(&token).await
    }

    /// Delete cached responses of one type (all types if `None`).
    pub async fn clear(&self, type_to_clear: Option<&str>, stale_only: bool) -> Result<usize> {
        self.inner.persistence.clear(type_to_clear, stale_only).await
    }

    pub async fn evict_expired(&self) -> Result<usize> {
        self.inner.persistence.evict_expired().await
    }

    pub async fn purge_incomplete(&self) -> Result<usize> {
        self.inner.persistence.purge_incomplete().await
    }

    pub async fn statistics(&self) -> Result<CacheStatistics> {
        self.inner.persistence.statistics().await
    }
}

impl std::fmt::Debug for Rewind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rewind")
            .field("settings", &self.inner.settings)
            .field("persistence", &self.inner.persistence)
            .field("resolver", &self.inner.resolver)
            .finish()
    }
}
