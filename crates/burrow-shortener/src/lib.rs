//! The burrow short link service.
//!
//! [`CachedRepository`] coordinates a durable store with a volatile cache,
//! [`ClickReconciler`] moves click counting off the redirect path and
//! [`WindowRateLimiter`] bounds request rates per client. Core types are
//! re-exported from `burrow_core`.

pub mod rate_limit;
pub mod reconciler;
pub mod repository;

pub use burrow_core::{MappingRecord, RepositoryError, ShortCode, Shortener};
pub use rate_limit::{
    CacheWindowCounter, LocalWindowCounter, RateDecision, RateLimitConfig, WindowCounter,
    WindowRateLimiter,
};
pub use reconciler::{ClickReconciler, ClickSink, FlushMode, ReconcilerConfig, ReconcilerStats};
pub use repository::{
    CachedRepository, ComponentHealth, HealthReport, HealthStatus, RepositorySettings,
};
