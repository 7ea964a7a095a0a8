//! Durable stores for short link mappings.

pub mod memory;
pub mod mysql;

pub use memory::InMemoryStore;
pub use mysql::{MySqlStore, MySqlStoreConfig};
