//! Cache backends for Burrow.
//!
//! The [`Cache`] trait lives in `burrow-core`; this crate provides the Redis
//! backend, a process-local backend and a no-op backend, and picks one at
//! startup with [`connect_or_degrade`].

pub mod memory;
pub mod null;
pub mod redis;

pub use memory::InMemoryCache;
pub use null::NullCache;
pub use redis::{RedisCache, RedisCacheConfig};

use burrow_core::Cache;
use std::sync::Arc;
use tracing::{info, warn};

/// Which backend [`connect_or_degrade`] selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Redis,
    Disabled,
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKind::Redis => f.write_str("redis"),
            CacheKind::Disabled => f.write_str("disabled"),
        }
    }
}

/// The cache chosen for the lifetime of the process.
#[derive(Clone)]
pub struct SelectedCache {
    pub cache: Arc<dyn Cache>,
    pub kind: CacheKind,
}

impl std::fmt::Debug for SelectedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedCache")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Connects to Redis, falling back to [`NullCache`] when no configuration is
/// given or the server cannot be reached.
///
/// The choice is made once. A Redis cache that later becomes unreachable
/// keeps being used and its errors are handled per call by the repository.
pub async fn connect_or_degrade(config: Option<&RedisCacheConfig>) -> SelectedCache {
    let Some(config) = config else {
        info!("No cache configured, running without a cache");
        return SelectedCache {
            cache: Arc::new(NullCache::new()),
            kind: CacheKind::Disabled,
        };
    };

    match RedisCache::connect(config).await {
        Ok(cache) => {
            info!(url = %config.url, "Using Redis cache");
            SelectedCache {
                cache: Arc::new(cache),
                kind: CacheKind::Redis,
            }
        }
        Err(e) => {
            warn!(url = %config.url, error = %e, "Redis unreachable, running without a cache");
            SelectedCache {
                cache: Arc::new(NullCache::new()),
                kind: CacheKind::Disabled,
            }
        }
    }
}
