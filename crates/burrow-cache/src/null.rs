use async_trait::async_trait;
use burrow_core::{Cache, CacheError};
use std::time::Duration;
use tracing::trace;

/// Type alias for cache results.
pub type Result<T> = std::result::Result<T, CacheError>;

/// A [`Cache`] that stores nothing.
///
/// Used when no cache backend is reachable at startup. Every read misses and
/// every write succeeds without effect, so callers fall through to the store.
/// Counters cannot be emulated without state: `incr` and `incr_window`
/// return [`CacheError::Disabled`], which the rate limiter treats as
/// "allow".
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Cache for NullCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        trace!(key = %key, "Cache disabled, reporting miss");
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn del(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    async fn incr(&self, _key: &str) -> Result<i64> {
        Err(CacheError::Disabled)
    }

    async fn incr_window(&self, _key: &str, _window: Duration) -> Result<i64> {
        Err(CacheError::Disabled)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
