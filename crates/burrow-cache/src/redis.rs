use async_trait::async_trait;
use burrow_core::{Cache, CacheError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace, warn};
use typed_builder::TypedBuilder;

/// Type alias for cache results.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Connection settings for [`RedisCache`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct RedisCacheConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379/0`.
    #[builder(setter(into))]
    pub url: String,
    /// TTL applied by [`Cache::set`].
    #[builder(default = Duration::from_secs(3600))]
    pub default_ttl: Duration,
    /// Upper bound for a single command round trip.
    #[builder(default = Duration::from_secs(3))]
    pub op_timeout: Duration,
    /// Upper bound for establishing the initial connection.
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,
}

/// A Redis-based implementation of [`Cache`].
///
/// Uses a [`ConnectionManager`], which reconnects transparently after the
/// server goes away. Every command is bounded by `op_timeout`, so a hung
/// server surfaces as [`CacheError::Timeout`] instead of stalling the caller.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    default_ttl: Duration,
    op_timeout: Duration,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("default_ttl", &self.default_ttl)
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

fn map_redis_error(operation: &str, err: redis::RedisError) -> CacheError {
    let message = format!("{operation}: {err}");
    let lower = message.to_ascii_lowercase();
    if lower.contains("timed out") {
        CacheError::Timeout(message)
    } else if lower.contains("connection") || lower.contains("broken pipe") {
        CacheError::Unavailable(message)
    } else {
        CacheError::Operation(message)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX rejects zero
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl RedisCache {
    /// Creates a Redis cache from an established connection.
    ///
    /// # Arguments
    ///
    /// * `conn` - A managed Redis connection
    /// * `default_ttl` - TTL applied by [`Cache::set`]
    /// * `op_timeout` - Upper bound for a single command
    pub fn new(conn: ConnectionManager, default_ttl: Duration, op_timeout: Duration) -> Self {
        Self {
            conn,
            default_ttl,
            op_timeout,
        }
    }

    /// Connects to Redis and verifies the connection with a `PING`.
    pub async fn connect(config: &RedisCacheConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            CacheError::Initialization(format!("invalid Redis URL '{}': {e}", config.url))
        })?;

        let conn = tokio::time::timeout(config.connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| {
                CacheError::Timeout(format!(
                    "connecting to Redis took longer than {:?}",
                    config.connect_timeout
                ))
            })?
            .map_err(|e| map_redis_error("failed to connect to Redis", e))?;

        let cache = Self::new(conn, config.default_ttl, config.op_timeout);
        cache.ping().await?;
        debug!(url = %config.url, "Connected to Redis");
        Ok(cache)
    }

    /// Runs one command under the operation timeout.
    async fn run<T, F>(&self, operation: &'static str, key: &str, command: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, command).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(key = %key, operation, error = %e, "Redis command failed");
                Err(map_redis_error(operation, e))
            }
            Err(_) => {
                warn!(key = %key, operation, timeout = ?self.op_timeout, "Redis command timed out");
                Err(CacheError::Timeout(format!(
                    "{operation} '{key}' exceeded {:?}",
                    self.op_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        trace!(key = %key, "Fetching value from Redis cache");

        let mut conn = self.conn.clone();
        let value: Option<String> = self
            .run("failed to fetch value from Redis", key, conn.get(key))
            .await?;

        match &value {
            Some(_) => debug!(key = %key, "Cache hit in Redis"),
            None => trace!(key = %key, "Cache miss in Redis"),
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_with_ttl(key, value, self.default_ttl).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        trace!(key = %key, ttl = ?ttl, "Storing value in Redis cache");

        let mut conn = self.conn.clone();
        self.run(
            "failed to write value to Redis",
            key,
            conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)),
        )
        .await?;

        debug!(key = %key, "Cached value in Redis");
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        trace!(key = %key, "Removing value from Redis cache");

        let mut conn = self.conn.clone();
        self.run(
            "failed to delete value from Redis",
            key,
            conn.del::<_, ()>(key),
        )
        .await?;

        debug!(key = %key, "Removed value from Redis cache");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.run(
            "failed to check key in Redis",
            key,
            conn.exists::<_, bool>(key),
        )
        .await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count = self
            .run(
                "failed to increment counter in Redis",
                key,
                conn.incr::<_, _, i64>(key, 1),
            )
            .await?;

        trace!(key = %key, count, "Incremented counter in Redis");
        Ok(count)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<i64> {
        let mut conn = self.conn.clone();

        // SET NX PX only creates the counter (with its expiry) when it is
        // missing; MULTI/EXEC makes creation and increment a single unit.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(window))
            .ignore()
            .cmd("INCR")
            .arg(key);

        let (count,): (i64,) = self
            .run(
                "failed to increment window counter in Redis",
                key,
                pipe.query_async(&mut conn),
            )
            .await?;

        trace!(key = %key, count, "Incremented window counter in Redis");
        Ok(count)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = self
            .run(
                "failed to ping Redis",
                "",
                redis::cmd("PING").query_async(&mut conn),
            )
            .await?;
        Ok(())
    }
}
