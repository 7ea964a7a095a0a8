use thiserror::Error;

/// Result type for the upward-facing repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Errors raised by volatile cache backends.
///
/// These never reach callers of the repository or the rate limiter: they are
/// logged and the operation falls through to the durable store (or fails open).
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache operation timed out: {0}")]
    Timeout(String),
    #[error("cache serialization failed: {0}")]
    Serialization(String),
    #[error("cache value is invalid: {0}")]
    InvalidData(String),
    #[error("cache initialization failed: {0}")]
    Initialization(String),
    #[error("cache operation failed: {0}")]
    Operation(String),
    #[error("cache is disabled")]
    Disabled,
}

/// Errors raised by durable stores.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The conditional insert lost: the short code is already taken.
    #[error("short code already exists: {0}")]
    Conflict(String),
    /// The row targeted by an update does not exist.
    #[error("no row found for {0}")]
    NotFound(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    #[error("storage operation failed: {0}")]
    Operation(String),
}

/// Errors raised by short code generators.
#[derive(Debug, Clone, Error)]
pub enum GeneratorError {
    #[error("random source failed: {0}")]
    Entropy(String),
}

/// Errors surfaced by the cache-coordinated repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Caller-supplied input was malformed.
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("mapping not found: {0}")]
    NotFound(String),
    #[error("mapping already exists: {0}")]
    Conflict(String),
    /// Every generated candidate collided with an existing code.
    ///
    /// Usually means the alphabet or code length is undersized for the
    /// number of stored mappings.
    #[error("failed to generate a unique short code after {attempts} attempts")]
    GenerationExhausted { attempts: usize },
    #[error("short code generation failed: {0}")]
    Generator(#[from] GeneratorError),
    #[error("{operation} failed for '{key}': {source}")]
    Storage {
        operation: &'static str,
        key: String,
        #[source]
        source: StorageError,
    },
}

impl RepositoryError {
    /// Classifies a durable store failure, attaching the operation and key.
    ///
    /// `Conflict` and `NotFound` keep their meaning; everything else becomes
    /// a storage failure carrying the original error.
    pub fn from_storage(operation: &'static str, key: impl Into<String>, err: StorageError) -> Self {
        let key = key.into();
        match err {
            StorageError::Conflict(_) => Self::Conflict(key),
            StorageError::NotFound(_) => Self::NotFound(key),
            source => Self::Storage {
                operation,
                key,
                source,
            },
        }
    }

    /// Returns `true` for errors a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict(_) | Self::GenerationExhausted { .. } => true,
            Self::Storage { source, .. } => matches!(
                source,
                StorageError::Timeout(_) | StorageError::Unavailable(_)
            ),
            Self::Validation(_) | Self::NotFound(_) | Self::Generator(_) => false,
        }
    }
}
