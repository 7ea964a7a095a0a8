use crate::reconciler::ClickSink;
use async_trait::async_trait;
use burrow_core::error::{RepositoryError, Result};
use burrow_core::{
    Cache, CacheError, CacheKeys, MappingRecord, NewMapping, ShortCode, Shortener, StorageError,
    Store,
};
use burrow_generator::Generator;
use jiff::Timestamp;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use typed_builder::TypedBuilder;

/// Default number of candidate codes tried by [`Shortener::create`].
pub const DEFAULT_MAX_RETRIES: usize = 5;

/// Tuning for [`CachedRepository`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct RepositorySettings {
    /// Candidate codes tried before giving up with
    /// [`RepositoryError::GenerationExhausted`]. Zero is treated as one.
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: usize,
    /// TTL of cached mapping records and reverse index entries.
    #[builder(default = Duration::from_secs(60 * 60))]
    pub record_ttl: Duration,
    /// TTL of cache-resident click counters.
    #[builder(default = Duration::from_secs(24 * 60 * 60))]
    pub counter_ttl: Duration,
    /// TTL of entries loaded by [`CachedRepository::warmup`].
    #[builder(default = Duration::from_secs(24 * 60 * 60))]
    pub warmup_ttl: Duration,
    /// Upper bound for a single cache call. A slower call counts as a miss.
    #[builder(default = Duration::from_millis(500))]
    pub cache_timeout: Duration,
    /// Upper bound for a single durable store call.
    #[builder(default = Duration::from_secs(5))]
    pub store_timeout: Duration,
    #[builder(default)]
    pub keys: CacheKeys,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Overall verdict of [`CachedRepository::health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// The store is fine but the cache is not; requests still succeed.
    Degraded,
    /// The store is unreachable.
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store: ComponentHealth,
    pub cache: ComponentHealth,
}

/// Repository that coordinates a durable [`Store`] with a volatile [`Cache`].
///
/// The store is authoritative. The cache is consulted first on reads and
/// filled on a best-effort basis after writes and store reads; any cache
/// failure is logged and the operation continues against the store.
///
/// Short code assignment relies entirely on the store's conditional insert:
/// a collision is retried with a fresh candidate, up to
/// [`RepositorySettings::max_retries`] attempts.
pub struct CachedRepository<S, G> {
    store: Arc<S>,
    cache: Arc<dyn Cache>,
    generator: Arc<G>,
    settings: RepositorySettings,
}

impl<S, G> Clone for CachedRepository<S, G> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            generator: Arc::clone(&self.generator),
            settings: self.settings.clone(),
        }
    }
}

impl<S, G> std::fmt::Debug for CachedRepository<S, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedRepository")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn encode(record: &MappingRecord) -> std::result::Result<String, CacheError> {
    serde_json::to_string(record).map_err(|e| CacheError::Serialization(e.to_string()))
}

fn decode(payload: &str) -> std::result::Result<MappingRecord, CacheError> {
    serde_json::from_str(payload).map_err(|e| CacheError::Serialization(e.to_string()))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl<S: Store, G: Generator> CachedRepository<S, G> {
    /// Creates a repository.
    ///
    /// # Arguments
    ///
    /// * `store` - The authoritative durable store
    /// * `cache` - The cache selected at startup (possibly a `NullCache`)
    /// * `generator` - Source of candidate short codes
    /// * `settings` - Retry bound, TTLs and timeouts
    pub fn new(store: S, cache: Arc<dyn Cache>, generator: G, settings: RepositorySettings) -> Self {
        Self {
            store: Arc::new(store),
            cache,
            generator: Arc::new(generator),
            settings,
        }
    }

    /// Returns a reference to the durable store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns a reference to the cache.
    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn settings(&self) -> &RepositorySettings {
        &self.settings
    }

    async fn cache_call<T, F>(&self, call: F) -> std::result::Result<T, CacheError>
    where
        F: Future<Output = std::result::Result<T, CacheError>>,
    {
        match tokio::time::timeout(self.settings.cache_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(format!(
                "cache call exceeded {:?}",
                self.settings.cache_timeout
            ))),
        }
    }

    async fn store_call<T, F>(&self, call: F) -> std::result::Result<T, StorageError>
    where
        F: Future<Output = std::result::Result<T, StorageError>>,
    {
        match tokio::time::timeout(self.settings.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(format!(
                "store call exceeded {:?}",
                self.settings.store_timeout
            ))),
        }
    }

    /// Best-effort write of a mapping record into the cache.
    async fn cache_record(&self, record: &MappingRecord, ttl: Duration) -> bool {
        let code = &record.short_code;
        let key = self.settings.keys.mapping(code);

        let written = match encode(record) {
            Ok(payload) => {
                self.cache_call(self.cache.set_with_ttl(&key, &payload, ttl))
                    .await
            }
            Err(e) => Err(e),
        };

        match written {
            Ok(()) => {
                trace!(code = %code, "Cached mapping record");
                true
            }
            Err(e) => {
                warn!(code = %code, error = %e, "Failed to cache mapping record");
                false
            }
        }
    }

    /// Best-effort write of the URL to short code reverse entry.
    async fn cache_reverse(&self, record: &MappingRecord) {
        let key = self.settings.keys.reverse(&record.original_url);
        let code = &record.short_code;

        if let Err(e) = self
            .cache_call(
                self.cache
                    .set_with_ttl(&key, code.as_str(), self.settings.record_ttl),
            )
            .await
        {
            warn!(code = %code, error = %e, "Failed to cache reverse index entry");
        }
    }

    /// Raises the cache counter to a durable click count. A cached counter
    /// already at or above `clicks` is left alone.
    ///
    /// The read and the write are separate cache calls, so an increment
    /// landing in between can be overwritten. The counter then lags by that
    /// increment but never falls below the durable count it was raised to.
    async fn raise_counter(&self, code: &ShortCode, clicks: i64) {
        let key = self.settings.keys.clicks(code);

        let cached = match self.cache_call(self.cache.get(&key)).await {
            Ok(value) => value.and_then(|v| v.parse::<i64>().ok()),
            Err(e) => {
                warn!(code = %code, error = %e, "Failed to read cached click counter");
                return;
            }
        };

        if cached.is_some_and(|cached| cached >= clicks) {
            return;
        }

        let value = clicks.to_string();
        if let Err(e) = self
            .cache_call(
                self.cache
                    .set_with_ttl(&key, &value, self.settings.counter_ttl),
            )
            .await
        {
            warn!(code = %code, error = %e, "Failed to raise cached click counter");
        }
    }

    /// Drops the cached mapping record so the next read goes to the store.
    async fn invalidate(&self, code: &ShortCode) {
        let key = self.settings.keys.mapping(code);
        match self.cache_call(self.cache.del(&key)).await {
            Ok(()) => trace!(code = %code, "Invalidated cached mapping record"),
            Err(e) => warn!(code = %code, error = %e, "Failed to invalidate cached mapping record"),
        }
    }

    /// Reads the cache-resident click counter of a short code.
    ///
    /// Returns `None` on a miss or when the cache fails.
    pub async fn cached_clicks(&self, code: &ShortCode) -> Option<i64> {
        let key = self.settings.keys.clicks(code);
        match self.cache_call(self.cache.get(&key)).await {
            Ok(value) => value.and_then(|v| v.parse().ok()),
            Err(e) => {
                warn!(code = %code, error = %e, "Failed to read cached click counter");
                None
            }
        }
    }

    /// Loads the `limit` most clicked mappings into the cache.
    ///
    /// Returns how many records were cached. Individual cache failures are
    /// skipped; a store failure is returned.
    pub async fn warmup(&self, limit: usize) -> Result<usize> {
        let records = self
            .store_call(self.store.most_clicked(limit))
            .await
            .map_err(|e| RepositoryError::from_storage("warmup", format!("top {limit}"), e))?;

        let mut loaded = 0;
        for record in &records {
            if self.cache_record(record, self.settings.warmup_ttl).await {
                loaded += 1;
            }
            self.raise_counter(&record.short_code, record.click_count).await;
        }

        info!(requested = limit, found = records.len(), loaded, "Cache warmup finished");
        Ok(loaded)
    }

    /// Pings the store and the cache independently.
    pub async fn health(&self) -> HealthReport {
        let started = Instant::now();
        let store = match self.store_call(self.store.ping()).await {
            Ok(()) => ComponentHealth {
                healthy: true,
                latency_ms: elapsed_ms(started),
                error: None,
            },
            Err(e) => ComponentHealth {
                healthy: false,
                latency_ms: elapsed_ms(started),
                error: Some(e.to_string()),
            },
        };

        let started = Instant::now();
        let cache = match self.cache_call(self.cache.ping()).await {
            Ok(()) => ComponentHealth {
                healthy: true,
                latency_ms: elapsed_ms(started),
                error: None,
            },
            Err(e) => ComponentHealth {
                healthy: false,
                latency_ms: elapsed_ms(started),
                error: Some(e.to_string()),
            },
        };

        let status = match (store.healthy, cache.healthy) {
            (true, true) => HealthStatus::Healthy,
            (true, false) => HealthStatus::Degraded,
            (false, _) => HealthStatus::Unhealthy,
        };

        HealthReport {
            status,
            store,
            cache,
        }
    }
}

#[async_trait]
impl<S: Store, G: Generator> Shortener for CachedRepository<S, G> {
    async fn create(&self, original_url: &str) -> Result<MappingRecord> {
        // At least one candidate is always tried.
        let attempts = self.settings.max_retries.max(1);

        for attempt in 1..=attempts {
            let short_code: ShortCode = self.generator.generate()?.into();
            let mapping = NewMapping {
                original_url: original_url.to_owned(),
                short_code,
                created_at: Timestamp::now(),
            };

            match self.store_call(self.store.insert_if_absent(&mapping)).await {
                Ok(id) => {
                    let record = mapping.into_record(id);
                    debug!(code = %record.short_code, id, attempt, "Created mapping");

                    self.cache_record(&record, self.settings.record_ttl).await;
                    self.cache_reverse(&record).await;
                    return Ok(record);
                }
                Err(StorageError::Conflict(_)) => {
                    debug!(code = %mapping.short_code, attempt, "Short code collision, retrying");
                }
                Err(e) => {
                    return Err(RepositoryError::from_storage(
                        "create",
                        mapping.short_code.as_str(),
                        e,
                    ));
                }
            }
        }

        warn!(attempts, "Gave up generating a unique short code");
        Err(RepositoryError::GenerationExhausted { attempts })
    }

    async fn resolve(&self, code: &ShortCode) -> Result<MappingRecord> {
        let key = self.settings.keys.mapping(code);

        match self.cache_call(self.cache.get(&key)).await {
            Ok(Some(payload)) => match decode(&payload) {
                Ok(record) if record.short_code == *code => {
                    trace!(code = %code, "Resolved from cache");
                    return Ok(record);
                }
                Ok(_) => {
                    warn!(code = %code, "Cached record belongs to another code, ignoring it");
                    self.invalidate(code).await;
                }
                Err(e) => {
                    warn!(code = %code, error = %e, "Undecodable cached record, ignoring it");
                    self.invalidate(code).await;
                }
            },
            Ok(None) => trace!(code = %code, "Cache miss"),
            Err(e) => warn!(code = %code, error = %e, "Cache read failed, falling back to store"),
        }

        let record = self
            .store_call(self.store.get_by_code(code))
            .await
            .map_err(|e| RepositoryError::from_storage("resolve", code.as_str(), e))?
            .ok_or_else(|| RepositoryError::NotFound(code.to_string()))?;

        self.cache_record(&record, self.settings.record_ttl).await;
        self.raise_counter(code, record.click_count).await;
        Ok(record)
    }

    async fn record_usage(&self, code: &ShortCode) -> Result<i64> {
        let record = self.resolve(code).await?;

        let clicks = self
            .store_call(self.store.increment_clicks(record.id))
            .await
            .map_err(|e| RepositoryError::from_storage("record_usage", code.as_str(), e))?;

        self.raise_counter(code, clicks).await;
        self.invalidate(code).await;
        debug!(code = %code, clicks, "Recorded usage");
        Ok(clicks)
    }

    async fn find_by_url(&self, original_url: &str) -> Result<MappingRecord> {
        let key = self.settings.keys.reverse(original_url);

        match self.cache_call(self.cache.get(&key)).await {
            Ok(Some(cached_code)) => match ShortCode::new(cached_code) {
                Ok(code) => match self.resolve(&code).await {
                    Ok(record) if record.original_url == original_url => {
                        trace!(code = %code, "Found mapping through reverse index");
                        return Ok(record);
                    }
                    Ok(_) | Err(RepositoryError::NotFound(_)) => {
                        debug!(code = %code, "Reverse index entry is stale, ignoring it");
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => warn!(error = %e, "Reverse index holds an invalid code, ignoring it"),
            },
            Ok(None) => trace!("Reverse index miss"),
            Err(e) => warn!(error = %e, "Reverse index read failed, falling back to store"),
        }

        let record = self
            .store_call(self.store.get_by_url(original_url))
            .await
            .map_err(|e| RepositoryError::from_storage("find_by_url", original_url, e))?
            .ok_or_else(|| RepositoryError::NotFound(original_url.to_owned()))?;

        self.cache_record(&record, self.settings.record_ttl).await;
        self.cache_reverse(&record).await;
        Ok(record)
    }
}

#[async_trait]
impl<S: Store, G: Generator> ClickSink for CachedRepository<S, G> {
    async fn bump_cached_clicks(&self, code: &ShortCode) {
        let key = self.settings.keys.clicks(code);
        match self
            .cache_call(self.cache.incr_window(&key, self.settings.counter_ttl))
            .await
        {
            Ok(clicks) => trace!(code = %code, clicks, "Bumped cached click counter"),
            Err(CacheError::Disabled) => {}
            Err(e) => warn!(code = %code, error = %e, "Failed to bump cached click counter"),
        }
    }

    async fn apply_click(&self, code: &ShortCode) -> Result<i64> {
        self.record_usage(code).await
    }

    async fn flush_clicks(&self, increments: &HashMap<ShortCode, u64>) -> Result<()> {
        self.store_call(self.store.batch_increment_clicks(increments))
            .await
            .map_err(|e| {
                RepositoryError::from_storage(
                    "flush_clicks",
                    format!("{} codes", increments.len()),
                    e,
                )
            })?;

        for code in increments.keys() {
            self.invalidate(code).await;
        }
        Ok(())
    }
}
