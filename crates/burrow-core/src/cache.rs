use crate::error::CacheError;
use async_trait::async_trait;
use std::time::Duration;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// A volatile key/value cache.
///
/// Values are opaque serialized strings. Any entry may disappear at any time,
/// so callers must treat every read as a possible miss. Implementations exist
/// for Redis, for a single process, and as a no-op for running without a
/// cache at all.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// Get a value from the cache.
    ///
    /// Returns `Ok(None)` if the key is not in the cache.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value using the backend's default TTL.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Store a value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove a value from the cache.
    /// It is not an error if the key does not exist.
    async fn del(&self, key: &str) -> Result<()>;

    /// Checks whether a key is present.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Atomically increments an integer value, creating it at 1 if absent.
    /// An existing expiry is left untouched.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Atomically increments a window counter.
    ///
    /// The expiry is set to `window` only when the increment creates the
    /// counter, as one atomic unit with the increment. Later increments in the
    /// same window never extend it.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<i64>;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<()>;
}
