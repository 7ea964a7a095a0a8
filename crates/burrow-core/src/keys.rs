use crate::shortcode::ShortCode;
use xxhash_rust::xxh64::xxh64;

const URL_PREFIX: &str = "url";
const REVERSE_PREFIX: &str = "short";
const CLICKS_PREFIX: &str = "clicks";
const RATE_PREFIX: &str = "rate";

/// Stable 64-bit hash of a URL, as 16 lowercase hex digits.
///
/// Used for the reverse cache index and for the indexed lookup column of the
/// durable store. Distinct URLs may share a hash, so a match must always be
/// confirmed against the full URL.
pub fn url_hash(original_url: &str) -> String {
    format!("{:016x}", xxh64(original_url.as_bytes(), 0))
}

/// Builds cache keys, one namespace per purpose.
///
/// Keys look like `[<namespace>:]<purpose>:<id>`, so mapping records,
/// reverse lookups, counters and rate limit windows never collide in a
/// single flat keyspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKeys {
    namespace: Option<String>,
}

impl CacheKeys {
    /// Creates a key builder without a namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a key builder that prefixes every key with `namespace`.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: (!namespace.is_empty()).then_some(namespace),
        }
    }

    /// Key of the cached mapping record for a short code.
    pub fn mapping(&self, code: &ShortCode) -> String {
        self.build(URL_PREFIX, code.as_str())
    }

    /// Key of the reverse index from a URL to its short code.
    ///
    /// The URL is hashed to keep keys short; a hit must be checked against
    /// the resolved record.
    pub fn reverse(&self, original_url: &str) -> String {
        self.build(REVERSE_PREFIX, &url_hash(original_url))
    }

    /// Key of the cache-resident click counter for a short code.
    pub fn clicks(&self, code: &ShortCode) -> String {
        self.build(CLICKS_PREFIX, code.as_str())
    }

    /// Key of a rate limit window counter for a client.
    pub fn rate_limit(&self, client: &str) -> String {
        self.build(RATE_PREFIX, client)
    }

    fn build(&self, prefix: &str, id: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:{prefix}:{id}"),
            None => format!("{prefix}:{id}"),
        }
    }
}
