//! Fixed window rate limiting.
//!
//! A window starts with the first request of a client and lasts exactly
//! `window`; later requests in the same window never push its end back.
//! When the counter backend fails the request is let through.

use async_trait::async_trait;
use burrow_core::{Cache, CacheError, CacheKeys};
use moka::future::Cache as MokaCache;
use moka::policy::Expiry;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

/// Default maximum number of clients tracked by [`LocalWindowCounter`].
pub const DEFAULT_LOCAL_CAPACITY: u64 = 100_000;

/// Counts requests per client within a fixed window.
#[async_trait]
pub trait WindowCounter: Send + Sync + 'static {
    /// Increments the client's counter and returns the post-increment value.
    ///
    /// The window's expiry is fixed when the counter is created.
    async fn increment(&self, client: &str, window: Duration) -> Result<i64, CacheError>;
}

/// Window counter kept in the shared cache, so every process sees the same
/// count.
pub struct CacheWindowCounter {
    cache: Arc<dyn Cache>,
    keys: CacheKeys,
}

impl CacheWindowCounter {
    pub fn new(cache: Arc<dyn Cache>, keys: CacheKeys) -> Self {
        Self { cache, keys }
    }
}

#[async_trait]
impl WindowCounter for CacheWindowCounter {
    async fn increment(&self, client: &str, window: Duration) -> Result<i64, CacheError> {
        self.cache
            .incr_window(&self.keys.rate_limit(client), window)
            .await
    }
}

struct LocalWindow {
    count: AtomicI64,
    window: Duration,
}

struct WindowExpiry;

impl Expiry<String, Arc<LocalWindow>> for WindowExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<LocalWindow>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.window)
    }
}

/// Process-local window counter for running without a shared cache.
///
/// Counts are not shared between processes, so the effective limit is
/// multiplied by the number of instances.
pub struct LocalWindowCounter {
    windows: MokaCache<String, Arc<LocalWindow>>,
}

impl LocalWindowCounter {
    /// Creates a counter tracking at most `capacity` clients.
    pub fn new(capacity: u64) -> Self {
        let windows = MokaCache::builder()
            .max_capacity(capacity)
            .expire_after(WindowExpiry)
            .build();

        debug!(capacity, "Local window counter initialized");
        Self { windows }
    }
}

impl Default for LocalWindowCounter {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_CAPACITY)
    }
}

#[async_trait]
impl WindowCounter for LocalWindowCounter {
    async fn increment(&self, client: &str, window: Duration) -> Result<i64, CacheError> {
        let entry = self
            .windows
            .get_with(client.to_owned(), async move {
                Arc::new(LocalWindow {
                    count: AtomicI64::new(0),
                    window,
                })
            })
            .await;

        Ok(entry.count.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct RateLimitConfig {
    #[builder(default = 100)]
    pub limit: i64,
    #[builder(default = Duration::from_secs(60))]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Outcome of [`WindowRateLimiter::check_and_increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { count: i64, limit: i64 },
    Limited { count: i64, limit: i64 },
    /// The counter could not be reached and the request was let through.
    FailedOpen,
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, RateDecision::Limited { .. })
    }

    /// The post-increment count, unless the counter failed.
    pub fn count(&self) -> Option<i64> {
        match self {
            RateDecision::Allowed { count, .. } | RateDecision::Limited { count, .. } => {
                Some(*count)
            }
            RateDecision::FailedOpen => None,
        }
    }
}

/// Per-client fixed window rate limiter.
#[derive(Clone)]
pub struct WindowRateLimiter {
    counter: Arc<dyn WindowCounter>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for WindowRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowRateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WindowRateLimiter {
    pub fn new(counter: Arc<dyn WindowCounter>, config: RateLimitConfig) -> Self {
        Self { counter, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counts one request for `client` and compares it to `limit`.
    ///
    /// A counter failure is logged and yields [`RateDecision::FailedOpen`].
    pub async fn check_and_increment(
        &self,
        client: &str,
        limit: i64,
        window: Duration,
    ) -> RateDecision {
        match self.counter.increment(client, window).await {
            Ok(count) if count <= limit => RateDecision::Allowed { count, limit },
            Ok(count) => {
                debug!(client, count, limit, "Rate limit exceeded");
                RateDecision::Limited { count, limit }
            }
            Err(e) => {
                warn!(client, error = %e, "Rate limit counter failed, allowing request");
                RateDecision::FailedOpen
            }
        }
    }

    /// [`Self::check_and_increment`] with the configured limit and window.
    pub async fn check(&self, client: &str) -> RateDecision {
        self.check_and_increment(client, self.config.limit, self.config.window)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_cache::{InMemoryCache, NullCache};

    fn limiter(counter: impl WindowCounter) -> WindowRateLimiter {
        WindowRateLimiter::new(Arc::new(counter), RateLimitConfig::default())
    }

    async fn allows_limit_then_rejects(limiter: &WindowRateLimiter) {
        let window = Duration::from_secs(60);
        for expected in 1..=3 {
            let decision = limiter.check_and_increment("client-a", 3, window).await;
            assert_eq!(
                decision,
                RateDecision::Allowed {
                    count: expected,
                    limit: 3
                }
            );
        }

        let decision = limiter.check_and_increment("client-a", 3, window).await;
        assert_eq!(decision, RateDecision::Limited { count: 4, limit: 3 });
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn cache_counter_allows_limit_then_rejects() {
        let limiter = limiter(CacheWindowCounter::new(
            Arc::new(InMemoryCache::new()),
            CacheKeys::new(),
        ));
        allows_limit_then_rejects(&limiter).await;
    }

    #[tokio::test]
    async fn local_counter_allows_limit_then_rejects() {
        let limiter = limiter(LocalWindowCounter::default());
        allows_limit_then_rejects(&limiter).await;
    }

    #[tokio::test]
    async fn clients_are_counted_separately() {
        let limiter = limiter(LocalWindowCounter::default());
        let window = Duration::from_secs(60);

        limiter.check_and_increment("client-a", 1, window).await;
        let decision = limiter.check_and_increment("client-b", 1, window).await;

        assert_eq!(decision.count(), Some(1));
    }

    #[tokio::test]
    async fn cache_counter_resets_after_window() {
        let limiter = limiter(CacheWindowCounter::new(
            Arc::new(InMemoryCache::new()),
            CacheKeys::new(),
        ));
        let window = Duration::from_millis(100);

        limiter.check_and_increment("client-a", 1, window).await;
        assert!(!limiter
            .check_and_increment("client-a", 1, window)
            .await
            .is_allowed());

        tokio::time::sleep(Duration::from_millis(200)).await;

        let decision = limiter.check_and_increment("client-a", 1, window).await;
        assert_eq!(decision, RateDecision::Allowed { count: 1, limit: 1 });
    }

    #[tokio::test]
    async fn local_counter_resets_after_window() {
        let limiter = limiter(LocalWindowCounter::default());
        let window = Duration::from_millis(100);

        limiter.check_and_increment("client-a", 1, window).await;
        limiter.check_and_increment("client-a", 1, window).await;

        tokio::time::sleep(Duration::from_millis(200)).await;

        let decision = limiter.check_and_increment("client-a", 1, window).await;
        assert_eq!(decision.count(), Some(1));
    }

    #[tokio::test]
    async fn window_is_not_extended_by_later_requests() {
        let limiter = limiter(LocalWindowCounter::default());
        let window = Duration::from_millis(300);

        limiter.check_and_increment("client-a", 10, window).await;
        tokio::time::sleep(Duration::from_millis(180)).await;
        limiter.check_and_increment("client-a", 10, window).await;
        tokio::time::sleep(Duration::from_millis(180)).await;

        // 360ms after the first request the window has closed.
        let decision = limiter.check_and_increment("client-a", 10, window).await;
        assert_eq!(decision.count(), Some(1));
    }

    #[tokio::test]
    async fn disabled_cache_fails_open() {
        let limiter = limiter(CacheWindowCounter::new(
            Arc::new(NullCache::new()),
            CacheKeys::new(),
        ));

        for _ in 0..10 {
            let decision = limiter.check_and_increment("client-a", 1, Duration::from_secs(60)).await;
            assert_eq!(decision, RateDecision::FailedOpen);
            assert!(decision.is_allowed());
        }
    }

    #[tokio::test]
    async fn namespaced_rate_keys() {
        let cache = InMemoryCache::new();
        let limiter = limiter(CacheWindowCounter::new(
            Arc::new(cache.clone()),
            CacheKeys::with_namespace("edge"),
        ));

        limiter.check("client-a").await;

        assert_eq!(
            cache.get("edge:rate:client-a").await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_counts() {
        let limiter = limiter(LocalWindowCounter::default());

        let mut handles = vec![];
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .check_and_increment("client-a", 100, Duration::from_secs(60))
                    .await
                    .count()
                    .unwrap()
            }));
        }

        let mut counts = vec![];
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=50).collect::<Vec<_>>());
    }
}
