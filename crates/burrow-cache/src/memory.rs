use async_trait::async_trait;
use burrow_core::{Cache, CacheError};
use moka::future::Cache as MokaCache;
use moka::ops::compute::Op;
use moka::policy::Expiry;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Type alias for cache results.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Entry bound used by [`InMemoryCache::new`] and [`InMemoryCache::with_ttl`].
pub const DEFAULT_MAX_CAPACITY: u64 = 100_000;

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    ttl: Option<Duration>,
    /// Set on counter increments so an update keeps the expiry chosen at creation.
    keep_expiry: bool,
}

impl Slot {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            ttl,
            keep_expiry: false,
        }
    }
}

struct SlotExpiry;

impl Expiry<String, Slot> for SlotExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        slot: &Slot,
        _created_at: Instant,
    ) -> Option<Duration> {
        slot.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        slot: &Slot,
        _updated_at: Instant,
        duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        if slot.keep_expiry {
            duration_until_expiry
        } else {
            slot.ttl
        }
    }
}

/// A process-local [`Cache`] backed by Moka.
///
/// Every entry carries its own time to live and the cache holds at most
/// `max_capacity` entries. Counters are updated through Moka's per-key
/// compute, so `incr` and `incr_window` are atomic with respect to every
/// other operation on the same key.
#[derive(Debug, Clone)]
pub struct InMemoryCache {
    entries: MokaCache<String, Slot>,
    default_ttl: Option<Duration>,
}

impl InMemoryCache {
    /// Creates a cache whose `set` entries never expire.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_CAPACITY, None)
    }

    /// Creates a cache whose `set` entries expire after `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::with_capacity(DEFAULT_MAX_CAPACITY, Some(ttl))
    }

    /// Creates a cache bounded to `max_capacity` entries.
    pub fn with_capacity(max_capacity: u64, default_ttl: Option<Duration>) -> Self {
        let entries = MokaCache::builder()
            .max_capacity(max_capacity)
            .expire_after(SlotExpiry)
            .build();
        Self {
            entries,
            default_ttl,
        }
    }

    /// Approximate number of live entries.
    ///
    /// Expired entries are counted until Moka's housekeeping runs; call
    /// [`InMemoryCache::run_pending_tasks`] first for an exact figure.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Runs Moka's pending housekeeping, evicting expired entries.
    pub async fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks().await;
    }

    async fn increment(&self, key: &str, window: Option<Duration>) -> Result<i64> {
        let mut next = 0;

        self.entries
            .entry(key.to_owned())
            .and_try_compute_with(|existing| {
                let computed = match existing {
                    None => {
                        next = 1;
                        Ok(Op::Put(Slot::new(next.to_string(), window)))
                    }
                    Some(entry) => {
                        let slot = entry.value();
                        parse_counter(key, &slot.value).map(|current| {
                            next = current;
                            Op::Put(Slot {
                                value: current.to_string(),
                                ttl: slot.ttl,
                                keep_expiry: true,
                            })
                        })
                    }
                };
                std::future::ready(computed)
            })
            .await?;

        Ok(next)
    }
}

/// Parses a stored counter and returns its incremented value.
fn parse_counter(key: &str, value: &str) -> Result<i64> {
    let current = value.parse::<i64>().map_err(|e| {
        CacheError::InvalidData(format!("value at '{key}' is not an integer: {e}"))
    })?;
    current
        .checked_add(1)
        .ok_or_else(|| CacheError::InvalidData(format!("counter at '{key}' would overflow")))
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        trace!(key = %key, "Fetching value from in-memory cache");

        match self.entries.get(key).await {
            Some(slot) => {
                debug!(key = %key, "Cache hit in memory");
                Ok(Some(slot.value))
            }
            None => {
                trace!(key = %key, "Cache miss in memory");
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .insert(key.to_owned(), Slot::new(value.to_owned(), self.default_ttl))
            .await;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_owned(), Slot::new(value.to_owned(), Some(ttl)))
            .await;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.invalidate(key).await;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.get(key).await.is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.increment(key, None).await
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<i64> {
        self.increment(key, Some(window)).await
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
