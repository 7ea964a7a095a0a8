//! Core types and traits for the burrow short link service.
//!
//! This crate provides the shared vocabulary used by the cache backends,
//! the durable stores, and the cache-coordinated repository.

pub mod cache;
pub mod error;
pub mod keys;
pub mod shortcode;
pub mod shortener;
pub mod store;

pub use cache::Cache;
pub use error::{CacheError, GeneratorError, RepositoryError, StorageError};
pub use keys::{url_hash, CacheKeys};
pub use shortcode::ShortCode;
pub use shortener::Shortener;
pub use store::{MappingRecord, NewMapping, ReadStore, Store};
