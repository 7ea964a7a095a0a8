use std::sync::Arc;
use std::time::Duration;

use burrow_cache::{RedisCache, RedisCacheConfig};
use burrow_core::{CacheKeys, RepositoryError, ShortCode, Shortener};
use burrow_generator::AlphabetGenerator;
use burrow_shortener::{
    CacheWindowCounter, CachedRepository, ClickReconciler, FlushMode, HealthStatus,
    RateDecision, RateLimitConfig, ReconcilerConfig, RepositorySettings, WindowRateLimiter,
};
use burrow_storage::{MySqlStore, MySqlStoreConfig};
use burrow_test_infra::mysql::{MySqlServer, MysqlConfig};
use burrow_test_infra::redis::RedisServer;

type Repo = CachedRepository<MySqlStore, AlphabetGenerator>;

/// Redis and MySQL containers wired into one repository.
struct Fixture {
    _redis: RedisServer,
    _mysql: MySqlServer,
    cache: RedisCache,
    repository: Repo,
}

impl Fixture {
    async fn start() -> Self {
        let redis = RedisServer::new().await.expect("start redis");
        let config = RedisCacheConfig::builder()
            .url(redis.url().await.expect("redis url"))
            .build();
        let cache = RedisCache::connect(&config).await.expect("connect redis");

        let mysql = MySqlServer::new(MysqlConfig::builder().build())
            .await
            .expect("start mysql");
        let store = connect_with_retry(&mysql.database_url().await.expect("mysql url")).await;
        store.migrate().await.expect("apply migrations");

        let repository = CachedRepository::new(
            store,
            Arc::new(cache.clone()),
            AlphabetGenerator::default(),
            RepositorySettings::builder()
                .keys(CacheKeys::with_namespace("it"))
                .build(),
        );

        Self {
            _redis: redis,
            _mysql: mysql,
            cache,
            repository,
        }
    }
}

async fn connect_with_retry(url: &str) -> MySqlStore {
    let config = MySqlStoreConfig::builder().url(url).build();
    let mut last_error = None;

    for _ in 0..20 {
        match MySqlStore::connect(&config).await {
            Ok(store) => return store,
            Err(err) => {
                last_error = Some(err);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    panic!("failed to connect mysql: {last_error:?}");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn create_resolve_and_count_clicks() {
    let fixture = Fixture::start().await;
    let repository = &fixture.repository;

    let created = repository.create("https://example.com").await.unwrap();
    let resolved = repository.resolve(&created.short_code).await.unwrap();
    assert_eq!(resolved.original_url, "https://example.com");
    assert_eq!(resolved.click_count, 0);

    for _ in 0..3 {
        repository.record_usage(&created.short_code).await.unwrap();
    }
    let resolved = repository.resolve(&created.short_code).await.unwrap();
    assert_eq!(resolved.click_count, 3);

    let err = repository
        .resolve(&ShortCode::new("doesnotexist").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::NotFound(_)));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn find_by_url_returns_newest() {
    let fixture = Fixture::start().await;
    let repository = &fixture.repository;

    repository.create("https://example.com").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newest = repository.create("https://example.com").await.unwrap();

    let found = repository.find_by_url("https://example.com").await.unwrap();
    assert_eq!(found.short_code, newest.short_code);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn batched_reconciler_reaches_mysql() {
    let fixture = Fixture::start().await;
    let repository = fixture.repository.clone();
    let created = repository.create("https://example.com").await.unwrap();

    let reconciler = ClickReconciler::start(
        Arc::new(repository.clone()),
        ReconcilerConfig::builder()
            .mode(FlushMode::Batched {
                interval: Duration::from_millis(50),
            })
            .build(),
    );
    for _ in 0..25 {
        assert!(reconciler.submit(created.short_code.clone()));
    }

    awaitility::at_most(Duration::from_secs(10))
        .poll_interval(Duration::from_millis(100))
        .until_async(|| async { reconciler.stats().flushed == 25 })
        .await;

    let stats = reconciler.shutdown().await;
    assert_eq!(stats.dropped, 0);

    let resolved = repository.resolve(&created.short_code).await.unwrap();
    assert_eq!(resolved.click_count, 25);
    assert_eq!(repository.cached_clicks(&created.short_code).await, Some(25));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn warmup_and_health() {
    let fixture = Fixture::start().await;
    let repository = &fixture.repository;

    let created = repository.create("https://example.com").await.unwrap();
    repository.record_usage(&created.short_code).await.unwrap();

    assert_eq!(repository.warmup(10).await.unwrap(), 1);
    assert_eq!(repository.health().await.status, HealthStatus::Healthy);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn redis_rate_limiter_window() {
    let fixture = Fixture::start().await;
    let limiter = WindowRateLimiter::new(
        Arc::new(CacheWindowCounter::new(
            Arc::new(fixture.cache.clone()),
            CacheKeys::with_namespace("it"),
        )),
        RateLimitConfig::default(),
    );
    let window = Duration::from_millis(500);

    for count in 1..=3 {
        assert_eq!(
            limiter.check_and_increment("client-a", 3, window).await,
            RateDecision::Allowed { count, limit: 3 }
        );
    }
    assert_eq!(
        limiter.check_and_increment("client-a", 3, window).await,
        RateDecision::Limited { count: 4, limit: 3 }
    );

    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(
        limiter.check_and_increment("client-a", 3, window).await,
        RateDecision::Allowed { count: 1, limit: 3 }
    );
}
