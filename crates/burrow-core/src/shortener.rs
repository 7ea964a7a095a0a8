use crate::error::Result;
use crate::shortcode::ShortCode;
use crate::store::MappingRecord;
use async_trait::async_trait;

/// The operations exposed to the transport layer.
///
/// The transport maps each [`RepositoryError`](crate::RepositoryError) kind to
/// its own status codes; that mapping lives outside this crate.
#[async_trait]
pub trait Shortener: Send + Sync + 'static {
    /// Assigns a fresh short code to `original_url` and stores the mapping.
    ///
    /// The URL is stored as given; validating it is the caller's job.
    async fn create(&self, original_url: &str) -> Result<MappingRecord>;

    /// Resolves a short code to its mapping.
    ///
    /// The returned click count may lag behind the durable value.
    async fn resolve(&self, code: &ShortCode) -> Result<MappingRecord>;

    /// Records one use of a short code and returns the new durable count.
    async fn record_usage(&self, code: &ShortCode) -> Result<i64>;

    /// Finds the most recent mapping for a URL, if it was shortened before.
    async fn find_by_url(&self, original_url: &str) -> Result<MappingRecord>;
}
