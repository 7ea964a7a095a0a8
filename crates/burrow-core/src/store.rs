use crate::error::StorageError;
use crate::shortcode::ShortCode;
use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result type for durable store operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// A stored short-code-to-URL mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    /// Surrogate key assigned by the durable store.
    pub id: i64,
    /// The original URL that was shortened.
    pub original_url: String,
    /// The unique short code.
    pub short_code: ShortCode,
    /// How many times the mapping has been used. Never decreases.
    pub click_count: i64,
    /// When the mapping was created.
    pub created_at: Timestamp,
}

/// A mapping that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMapping {
    pub original_url: String,
    pub short_code: ShortCode,
    pub created_at: Timestamp,
}

impl NewMapping {
    /// Builds the stored record once the store has assigned an id.
    pub fn into_record(self, id: i64) -> MappingRecord {
        MappingRecord {
            id,
            original_url: self.original_url,
            short_code: self.short_code,
            click_count: 0,
            created_at: self.created_at,
        }
    }
}

/// A read-only view of the durable store.
#[async_trait]
pub trait ReadStore: Send + Sync + 'static {
    /// Retrieves the mapping for a given short code.
    /// Returns `None` if the code does not exist.
    async fn get_by_code(&self, code: &ShortCode) -> Result<Option<MappingRecord>>;

    /// Retrieves the most recently created mapping for a URL.
    /// Returns `None` if the URL was never shortened.
    async fn get_by_url(&self, original_url: &str) -> Result<Option<MappingRecord>>;

    /// Checks whether a short code already exists.
    async fn exists(&self, code: &ShortCode) -> Result<bool>;

    /// Returns up to `limit` mappings ordered by click count, newest first on ties.
    async fn most_clicked(&self, limit: usize) -> Result<Vec<MappingRecord>>;

    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<()>;
}

/// The authoritative store for mappings and their click counters.
#[async_trait]
pub trait Store: ReadStore {
    /// Inserts a mapping if its short code is free and returns the new id.
    ///
    /// This is the linearization point for code assignment: of two concurrent
    /// inserts with the same code, exactly one succeeds and the other gets
    /// `Err(StorageError::Conflict)`.
    async fn insert_if_absent(&self, mapping: &NewMapping) -> Result<i64>;

    /// Increments the click counter of the mapping with the given id and
    /// returns the new value. Returns `Err(StorageError::NotFound)` if no
    /// mapping has that id.
    async fn increment_clicks(&self, id: i64) -> Result<i64>;

    /// Applies all increments in a single transaction.
    ///
    /// Either every increment is applied or none is. Codes that do not exist
    /// are skipped.
    async fn batch_increment_clicks(&self, increments: &HashMap<ShortCode, u64>) -> Result<()>;
}
