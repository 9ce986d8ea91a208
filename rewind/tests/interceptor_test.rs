//! End-to-end behaviour of the `Rewind` facade: every operation against a
//! memory backend with a controllable clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use rewind::clock::ManualClock;
use rewind::error::ErrorKind;
use rewind::operation::{CacheOperation, OfflineOperation, RefreshOperation};
use rewind::persistence::{CachedPayload, PersistenceManager, StoredEntry};
use rewind::request::HashedRequestMetadata;
use rewind::serialisation::CacheKey;
use rewind::{
    BoxError, CacheError, CachePriority, CacheResponse, CacheStatus, HttpStatusError, Operation,
    RequestDescriptor, ResponseType, Rewind, RewindConfig,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

// ── Helpers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Article {
    id: u32,
    title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Author {
    name: String,
}

fn article(id: u32) -> Article {
    Article {
        id,
        title: format!("Article {}", id),
    }
}

fn start() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
}

struct Harness {
    rewind: Rewind,
    clock: Arc<ManualClock>,
    fetches: Arc<AtomicUsize>,
}

fn harness(configure: impl FnOnce(&mut RewindConfig)) -> Harness {
    let mut config = RewindConfig::default();
    config.cache.duration_secs = 60;
    configure(&mut config);

    let clock = Arc::new(ManualClock::new(start()));
    let rewind = Rewind::builder(config).clock(clock.clone()).build().unwrap();
    Harness {
        rewind,
        clock,
        fetches: Arc::new(AtomicUsize::new(0)),
    }
}

fn request() -> RequestDescriptor {
    RequestDescriptor::of::<Article>("https://news.test/articles/1?lang=en&fmt=json")
}

impl Harness {
    /// Resolve `operation`; the fetch answers with `outcome`, where `Err`
    /// carries an HTTP status.
    async fn call(
        &self,
        request: &RequestDescriptor,
        operation: Operation,
        outcome: Result<Article, u16>,
    ) -> CacheResponse<Article> {
        let fetches = self.fetches.clone();
        self.rewind
            .resolve(
                request,
                operation,
                move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    outcome.map_err(|status| Box::new(HttpStatusError { status }) as BoxError)
                },
                CancellationToken::new(),
            )
            .await
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn expire(&self) {
        self.clock.advance(Duration::seconds(61));
    }
}

fn http_status(response: &CacheResponse<Article>) -> Option<u16> {
    match response.exception()?.network_failure()?.kind {
        ErrorKind::Http { status } => Some(status),
        _ => None,
    }
}

// ── Cache ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_miss_then_fresh_hit() {
    let h = harness(|_| {});

    let first = h.call(&request(), Operation::cache(), Ok(article(1))).await;
    assert_eq!(first.status(), CacheStatus::Network);
    assert_eq!(first.response, Some(article(1)));
    assert!(first.exception().is_none());
    let token = &first.metadata.cache_token;
    assert_eq!(token.cache_date(), Some(start()));
    assert_eq!(token.expiry_date(), Some(start() + Duration::seconds(60)));
    assert_eq!(token.fetch_date(), Some(start()));

    let second = h.call(&request(), Operation::cache(), Ok(article(2))).await;
    assert_eq!(second.status(), CacheStatus::Fresh);
    assert_eq!(second.response, Some(article(1)));
    assert_eq!(h.fetch_count(), 1);
}

#[tokio::test]
async fn test_query_order_does_not_matter() {
    let h = harness(|_| {});
    h.call(&request(), Operation::cache(), Ok(article(1))).await;

    let reordered = RequestDescriptor::of::<Article>("https://news.test/articles/1?fmt=json&lang=en");
    let hit = h.call(&reordered, Operation::cache(), Ok(article(2))).await;
    assert_eq!(hit.status(), CacheStatus::Fresh);
    assert_eq!(h.fetch_count(), 1);
}

#[tokio::test]
async fn test_stale_is_refreshed_without_revalidation() {
    let h = harness(|_| {});
    h.call(&request(), Operation::cache(), Ok(article(1))).await;
    h.expire();

    let refreshed = h.call(&request(), Operation::cache(), Ok(article(2))).await;
    assert_eq!(refreshed.status(), CacheStatus::Refreshed);
    assert_eq!(refreshed.response, Some(article(2)));
    assert!(refreshed.refresh.is_none());

    let hit = h.call(&request(), Operation::cache(), Ok(article(3))).await;
    assert_eq!(hit.status(), CacheStatus::Fresh);
    assert_eq!(hit.response, Some(article(2)));
}

#[tokio::test]
async fn test_stale_while_revalidate_returns_stale_then_refreshes() {
    let h = harness(|config| config.cache.stale_while_revalidate = true);
    h.call(&request(), Operation::cache(), Ok(article(1))).await;
    h.expire();

    let mut stale = h.call(&request(), Operation::cache(), Ok(article(2))).await;
    assert_eq!(stale.status(), CacheStatus::Stale);
    assert!(!stale.status().is_final());
    assert_eq!(stale.response, Some(article(1)));

    let refreshed = stale.refresh.take().unwrap().await.unwrap();
    assert_eq!(refreshed.status(), CacheStatus::Refreshed);
    assert_eq!(refreshed.response, Some(article(2)));

    let hit = h.call(&request(), Operation::cache(), Ok(article(3))).await;
    assert_eq!(hit.status(), CacheStatus::Fresh);
    assert_eq!(hit.response, Some(article(2)));
}

#[tokio::test]
async fn test_stale_while_revalidate_skipped_for_fresh_preferred() {
    let h = harness(|config| config.cache.stale_while_revalidate = true);
    h.call(&request(), Operation::cache(), Ok(article(1))).await;
    h.expire();

    let operation = Operation::Cache(CacheOperation {
        priority: Some(CachePriority::FreshPreferred),
        ..Default::default()
    });
    let response = h.call(&request(), operation, Ok(article(2))).await;
    assert_eq!(response.status(), CacheStatus::Refreshed);
    assert!(response.refresh.is_none());
}

#[tokio::test]
async fn test_miss_with_network_error_is_empty() {
    let h = harness(|_| {});
    let response = h.call(&request(), Operation::cache(), Err(503)).await;

    assert_eq!(response.status(), CacheStatus::Empty);
    assert!(response.response.is_none());
    assert_eq!(http_status(&response), Some(503));
    assert!(response.into_result().is_err());
}

#[tokio::test]
async fn test_merge_on_error_delivers_stale_data() {
    let h = harness(|_| {});
    h.call(&request(), Operation::cache(), Ok(article(1))).await;
    h.expire();

    let response = h.call(&request(), Operation::cache(), Err(500)).await;
    assert_eq!(response.status(), CacheStatus::CouldNotRefresh);
    assert!(response.status().is_error());
    assert_eq!(response.response, Some(article(1)));
    assert_eq!(http_status(&response), Some(500));
}

#[tokio::test]
async fn test_no_merge_on_error_or_fresh_only_is_empty() {
    let h = harness(|config| config.cache.merge_on_error = false);
    h.call(&request(), Operation::cache(), Ok(article(1))).await;
    h.expire();

    let response = h.call(&request(), Operation::cache(), Err(500)).await;
    assert_eq!(response.status(), CacheStatus::Empty);
    assert!(response.response.is_none());

    let fresh_only = Operation::Cache(CacheOperation {
        fresh_only: true,
        merge_on_error: Some(true),
        ..Default::default()
    });
    let response = h.call(&request(), fresh_only, Err(500)).await;
    assert_eq!(response.status(), CacheStatus::Empty);
    assert!(response.response.is_none());
}

#[tokio::test]
async fn test_write_failure_still_delivers_response() {
    struct BrokenBackend;

    #[async_trait]
    impl PersistenceManager for BrokenBackend {
        async fn cache(&self, _: &CacheKey, _: &ResponseType, _: Bytes) -> rewind::Result<()> {
            Err(CacheError::Io(std::io::Error::other("disk full")))
        }
        async fn get_cached(&self, _: &HashedRequestMetadata) -> rewind::Result<Option<CachedPayload>> {
            Err(CacheError::Io(std::io::Error::other("unreadable")))
        }
        async fn invalidate(&self, _: &HashedRequestMetadata) -> rewind::Result<bool> {
            Ok(false)
        }
        async fn evict(&self, _: &HashedRequestMetadata) -> rewind::Result<bool> {
            Ok(false)
        }
        async fn clear(
            &self,
            _: Option<&str>,
            _: Option<DateTime<Utc>>,
        ) -> rewind::Result<usize> {
            Err(CacheError::Io(std::io::Error::other("read-only")))
        }
        async fn entries(&self) -> rewind::Result<Vec<StoredEntry>> {
            Ok(vec![])
        }
        fn backend_name(&self) -> &'static str {
            "broken"
        }
    }

    let rewind = Rewind::builder(RewindConfig::default())
        .persistence(Arc::new(BrokenBackend))
        .build()
        .unwrap();

    let response = rewind
        .resolve(
            &request(),
            Operation::cache(),
            || async { Ok::<_, BoxError>(article(1)) },
            CancellationToken::new(),
        )
        .await;
    assert_eq!(response.status(), CacheStatus::NotCached);
    assert_eq!(response.response, Some(article(1)));
    assert!(matches!(response.exception(), Some(CacheError::Io(_))));

    // Failed clears are reported to the caller.
    let cleared: CacheResponse<Article> = rewind
        .resolve(
            &request(),
            Operation::clear(None, false),
            || async { Ok::<_, BoxError>(article(1)) },
            CancellationToken::new(),
        )
        .await;
    assert_eq!(cleared.status(), CacheStatus::Empty);
    assert!(cleared.exception().is_some());
}

// ── Refresh / Offline ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_refresh_ignores_freshness() {
    let h = harness(|_| {});
    h.call(&request(), Operation::cache(), Ok(article(1))).await;

    let operation = Operation::Refresh(RefreshOperation {
        duration_secs: Some(600),
        ..Default::default()
    });
    let response = h.call(&request(), operation, Ok(article(2))).await;
    assert_eq!(response.status(), CacheStatus::Refreshed);
    assert_eq!(response.response, Some(article(2)));
    assert_eq!(
        response.metadata.cache_token.expiry_date(),
        Some(start() + Duration::seconds(600))
    );
    assert_eq!(h.fetch_count(), 2);
}

#[tokio::test]
async fn test_failed_refresh_falls_back_to_previous_data() {
    let h = harness(|_| {});
    h.call(&request(), Operation::cache(), Ok(article(1))).await;

    let response = h.call(&request(), Operation::refresh(), Err(502)).await;
    assert_eq!(response.status(), CacheStatus::CouldNotRefresh);
    assert_eq!(response.response, Some(article(1)));
}

#[tokio::test]
async fn test_offline_never_fetches() {
    let h = harness(|_| {});

    let miss = h.call(&request(), Operation::offline(), Ok(article(9))).await;
    assert_eq!(miss.status(), CacheStatus::Empty);
    assert!(matches!(miss.exception(), Some(CacheError::EmptyResponse(_))));

    h.call(&request(), Operation::cache(), Ok(article(1))).await;
    let fresh = h.call(&request(), Operation::offline(), Ok(article(9))).await;
    assert_eq!(fresh.status(), CacheStatus::Fresh);
    assert_eq!(fresh.response, Some(article(1)));

    h.expire();
    let stale = h.call(&request(), Operation::offline(), Ok(article(9))).await;
    assert_eq!(stale.status(), CacheStatus::OfflineStale);
    assert!(stale.status().is_final());
    assert_eq!(stale.response, Some(article(1)));

    let fresh_only = Operation::Offline(OfflineOperation {
        fresh_only: true,
        ..Default::default()
    });
    let rejected = h.call(&request(), fresh_only, Ok(article(9))).await;
    assert_eq!(rejected.status(), CacheStatus::Empty);
    assert!(rejected.response.is_none());

    assert_eq!(h.fetch_count(), 1);
}

// ── Invalidate / Clear ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_invalidate_then_lookup_forces_refetch() {
    let h = harness(|_| {});
    h.call(&request(), Operation::cache(), Ok(article(1))).await;

    let done = h.call(&request(), Operation::Invalidate, Ok(article(9))).await;
    assert_eq!(done.status(), CacheStatus::Done);
    assert!(done.response.is_none());

    // Payload is still readable offline, but no longer fresh.
    let offline = h.call(&request(), Operation::offline(), Ok(article(9))).await;
    assert_eq!(offline.status(), CacheStatus::OfflineStale);
    assert_eq!(offline.response, Some(article(1)));

    let refetched = h.call(&request(), Operation::cache(), Ok(article(2))).await;
    assert_eq!(refetched.status(), CacheStatus::Refreshed);
    assert_eq!(h.fetch_count(), 2);
}

#[tokio::test]
async fn test_clear_then_lookup() {
    let h = harness(|_| {});
    h.call(&request(), Operation::cache(), Ok(article(1))).await;

    let author_request = RequestDescriptor::of::<Author>("https://news.test/articles/1?lang=en&fmt=json");
    let author: CacheResponse<Author> = h
        .rewind
        .resolve(
            &author_request,
            Operation::cache(),
            || async { Ok::<_, BoxError>(Author { name: "Ada".into() }) },
            CancellationToken::new(),
        )
        .await;
    assert_eq!(author.status(), CacheStatus::Network);

    let article_type = ResponseType::of::<Article>();
    let done = h
        .call(
            &request(),
            Operation::clear(Some(article_type.name().to_string()), false),
            Ok(article(9)),
        )
        .await;
    assert_eq!(done.status(), CacheStatus::Done);

    let stats = h.rewind.statistics().await.unwrap();
    assert!(stats.summary_for(article_type.name()).is_none());
    assert_eq!(stats.summary_for(ResponseType::of::<Author>().name()).unwrap().fresh_count, 1);

    let miss = h.call(&request(), Operation::cache(), Ok(article(2))).await;
    assert_eq!(miss.status(), CacheStatus::Network);
}

#[tokio::test]
async fn test_clear_stale_only_keeps_fresh_entries() {
    let h = harness(|_| {});
    h.call(&request(), Operation::cache(), Ok(article(1))).await;
    h.expire();

    let other = RequestDescriptor::of::<Article>("https://news.test/articles/2");
    h.call(&other, Operation::cache(), Ok(article(2))).await;

    assert_eq!(h.rewind.clear(None, true).await.unwrap(), 1);
    let stats = h.rewind.statistics().await.unwrap();
    assert_eq!(stats.total_entries(), 1);
    assert_eq!(stats.total_fresh(), 1);
}

// ── Resolution / bypass ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_header_overrides_annotation() {
    let h = harness(|_| {});
    h.call(&request(), Operation::cache(), Ok(article(1))).await;

    let with_header = request().with_operation_header("REFRESH");
    let fetches = h.fetches.clone();
    let response = h
        .rewind
        .execute(
            &with_header,
            Some(&Operation::offline()),
            move || async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(article(2))
            },
            CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status(), CacheStatus::Refreshed);
    assert_eq!(h.fetch_count(), 2);
}

#[tokio::test]
async fn test_malformed_header_falls_back_to_annotation() {
    let h = harness(|_| {});
    let with_header = request().with_operation_header("SOMETIMES");
    let response: CacheResponse<Article> = h
        .rewind
        .execute(
            &with_header,
            Some(&Operation::offline()),
            || async { Ok::<_, BoxError>(article(2)) },
            CancellationToken::new(),
        )
        .await;
    assert_eq!(response.status(), CacheStatus::Empty);
}

#[tokio::test]
async fn test_disabled_cache_and_unhashable_requests_bypass() {
    let h = harness(|config| config.cache.enabled = false);
    let first = h.call(&request(), Operation::cache(), Ok(article(1))).await;
    let second = h.call(&request(), Operation::cache(), Ok(article(2))).await;
    assert_eq!(first.status(), CacheStatus::NotCached);
    assert_eq!(second.response, Some(article(2)));
    assert_eq!(h.rewind.statistics().await.unwrap().total_entries(), 0);

    let h = harness(|_| {});
    let broken = RequestDescriptor::of::<Article>("::not a url::");
    let response = h.call(&broken, Operation::cache(), Ok(article(1))).await;
    assert_eq!(response.status(), CacheStatus::NotCached);
    assert_eq!(response.response, Some(article(1)));
    assert!(!response.metadata.cache_token.request_metadata().is_valid());
}

// ── Cancellation ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancelled_before_fetch() {
    let h = harness(|_| {});
    let cancel = CancellationToken::new();
    cancel.cancel();

    let fetches = h.fetches.clone();
    let response = h
        .rewind
        .resolve(
            &request(),
            Operation::cache(),
            move || async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(article(1))
            },
            cancel,
        )
        .await;

    assert_eq!(response.status(), CacheStatus::Empty);
    assert!(matches!(response.exception(), Some(CacheError::Cancelled)));
    assert_eq!(h.fetch_count(), 0);
}

#[tokio::test]
async fn test_cancelled_during_fetch_writes_nothing() {
    let h = harness(|_| {});
    h.call(&request(), Operation::cache(), Ok(article(1))).await;
    h.expire();

    let cancel = CancellationToken::new();
    let rewind = h.rewind.clone();
    let task_cancel = cancel.clone();
    let pending = tokio::spawn(async move {
        rewind
            .resolve(
                &request(),
                Operation::cache(),
                || async { std::future::pending::<Result<Article, BoxError>>().await },
                task_cancel,
            )
            .await
    });

    tokio::task::yield_now().await;
    cancel.cancel();
    let response = pending.await.unwrap();

    assert_eq!(response.status(), CacheStatus::Empty);
    assert!(matches!(response.exception(), Some(CacheError::Cancelled)));
    assert!(response.response.is_none());

    // The stale entry is untouched and there are no partial writes.
    let stats = h.rewind.statistics().await.unwrap();
    assert_eq!(stats.total_entries(), 1);
    assert_eq!(stats.total_stale(), 1);
    assert_eq!(h.rewind.purge_incomplete().await.unwrap(), 0);
}
