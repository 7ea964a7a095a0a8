use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::{Display, Formatter};

pub const STORAGE_BACKEND_ENV: &str = "BURROW_STORAGE_BACKEND";
pub const MYSQL_DSN_ENV: &str = "BURROW_MYSQL_DSN";
pub const MYSQL_MAX_CONNECTIONS_ENV: &str = "BURROW_MYSQL_MAX_CONNECTIONS";
pub const REDIS_URL_ENV: &str = "BURROW_REDIS_URL";
pub const CACHE_NAMESPACE_ENV: &str = "BURROW_CACHE_NAMESPACE";
pub const CODE_LENGTH_ENV: &str = "BURROW_CODE_LENGTH";
pub const MAX_RETRIES_ENV: &str = "BURROW_MAX_RETRIES";
pub const BASE_URL_ENV: &str = "BURROW_BASE_URL";
pub const RATE_LIMIT_ENV: &str = "BURROW_RATE_LIMIT";
pub const RATE_WINDOW_SECS_ENV: &str = "BURROW_RATE_WINDOW_SECS";
pub const RECONCILER_WORKERS_ENV: &str = "BURROW_RECONCILER_WORKERS";
pub const RECONCILER_QUEUE_ENV: &str = "BURROW_RECONCILER_QUEUE";
pub const FLUSH_INTERVAL_MS_ENV: &str = "BURROW_FLUSH_INTERVAL_MS";
pub const LOG_FORMAT_ENV: &str = "BURROW_LOG_FORMAT";

pub const DEFAULT_MYSQL_MAX_CONNECTIONS: &str = "10";
pub const DEFAULT_CODE_LENGTH: &str = "6";
pub const DEFAULT_MAX_RETRIES: &str = "5";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_RATE_LIMIT: &str = "100";
pub const DEFAULT_RATE_WINDOW_SECS: &str = "60";
pub const DEFAULT_RECONCILER_WORKERS: &str = "10";
pub const DEFAULT_RECONCILER_QUEUE: &str = "100";
pub const DEFAULT_FLUSH_INTERVAL_MS: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackendArg {
    #[value(name = "in-memory")]
    InMemory,
    #[value(name = "mysql")]
    Mysql,
}

impl Display for StorageBackendArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackendArg::InMemory => write!(f, "in-memory"),
            StorageBackendArg::Mysql => write!(f, "mysql"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    #[value(name = "pretty")]
    Pretty,
    #[value(name = "json")]
    Json,
}

impl Display for LogFormatArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormatArg::Pretty => write!(f, "pretty"),
            LogFormatArg::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply the MySQL schema migrations.
    Migrate,
    /// Create a short code for a URL.
    Shorten { url: String },
    /// Look up the URL behind a short code.
    Resolve { code: String },
    /// Record clicks through the click reconciler.
    Click {
        code: String,
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
    /// Find the newest short code of a URL.
    Lookup { url: String },
    /// Load the most clicked mappings into the cache.
    Warmup {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Report store and cache health.
    Health,
    /// Count requests of a client against the rate limit.
    RateCheck {
        client: String,
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
}

#[derive(Debug, Parser)]
#[command(name = "burrow", version, about = "Short link service")]
pub struct CLI {
    #[arg(
        long,
        env = STORAGE_BACKEND_ENV,
        value_enum,
        default_value_t = StorageBackendArg::InMemory
    )]
    pub storage: StorageBackendArg,

    #[arg(long, env = MYSQL_DSN_ENV, required_if_eq("storage", "mysql"))]
    pub mysql_dsn: Option<String>,

    #[arg(
        long,
        env = MYSQL_MAX_CONNECTIONS_ENV,
        default_value = DEFAULT_MYSQL_MAX_CONNECTIONS
    )]
    pub mysql_max_connections: u32,

    /// Redis URL. Without it, or when Redis is unreachable, runs without a cache.
    #[arg(long, env = REDIS_URL_ENV)]
    pub redis_url: Option<String>,

    #[arg(long, env = CACHE_NAMESPACE_ENV)]
    pub cache_namespace: Option<String>,

    #[arg(long, env = CODE_LENGTH_ENV, default_value = DEFAULT_CODE_LENGTH)]
    pub code_length: usize,

    /// Short code candidates tried per shorten request.
    #[arg(
        long,
        env = MAX_RETRIES_ENV,
        default_value = DEFAULT_MAX_RETRIES,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_retries: u32,

    #[arg(long, env = BASE_URL_ENV, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[arg(long, env = RATE_LIMIT_ENV, default_value = DEFAULT_RATE_LIMIT)]
    pub rate_limit: i64,

    #[arg(long, env = RATE_WINDOW_SECS_ENV, default_value = DEFAULT_RATE_WINDOW_SECS)]
    pub rate_window_secs: u64,

    #[arg(
        long,
        env = RECONCILER_WORKERS_ENV,
        default_value = DEFAULT_RECONCILER_WORKERS
    )]
    pub reconciler_workers: usize,

    #[arg(long, env = RECONCILER_QUEUE_ENV, default_value = DEFAULT_RECONCILER_QUEUE)]
    pub reconciler_queue: usize,

    /// Batch click flush interval in milliseconds; 0 writes every click.
    #[arg(long, env = FLUSH_INTERVAL_MS_ENV, default_value = DEFAULT_FLUSH_INTERVAL_MS)]
    pub flush_interval_ms: u64,

    #[arg(
        long,
        env = LOG_FORMAT_ENV,
        value_enum,
        default_value_t = LogFormatArg::Pretty
    )]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Command,
}
