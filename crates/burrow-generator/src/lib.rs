//! Short code generators.

pub mod alphabet;

pub use alphabet::AlphabetGenerator;

use burrow_core::{GeneratorError, ShortCode};

/// Trait for generating candidate short codes.
///
/// Implementations are pure generators that don't interact with storage:
/// uniqueness is enforced by the durable store, and retrying on a collision
/// is the caller's job.
pub trait Generator: Send + Sync + 'static {
    type Output: Into<ShortCode>;

    /// Generates a candidate short code.
    ///
    /// Fails only when the underlying random source does.
    fn generate(&self) -> Result<Self::Output, GeneratorError>;
}
