mod cli;
mod logging;

use crate::cli::{Command, StorageBackendArg, CLI};
use anyhow::{bail, Context};
use burrow_cache::{connect_or_degrade, CacheKind, RedisCacheConfig, SelectedCache};
use burrow_core::{CacheKeys, ShortCode, Shortener, Store};
use burrow_generator::AlphabetGenerator;
use burrow_shortener::{
    CacheWindowCounter, CachedRepository, ClickReconciler, FlushMode, LocalWindowCounter,
    RateLimitConfig, ReconcilerConfig, RepositorySettings, WindowCounter, WindowRateLimiter,
};
use burrow_storage::{InMemoryStore, MySqlStore, MySqlStoreConfig};
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CLI::try_parse()?;
    logging::init(config.log_format);

    info!(
        storage_backend = %config.storage,
        cache_configured = config.redis_url.is_some(),
        "starting burrow"
    );

    match config.storage {
        StorageBackendArg::InMemory => {
            if matches!(config.command, Command::Migrate) {
                bail!("migrate needs --storage mysql");
            }
            run(config, InMemoryStore::new()).await
        }
        StorageBackendArg::Mysql => {
            let mysql_dsn = config
                .mysql_dsn
                .clone()
                .context("mysql dsn is required when storage backend is mysql")?;
            let store = MySqlStore::connect(
                &MySqlStoreConfig::builder()
                    .url(mysql_dsn)
                    .max_connections(config.mysql_max_connections)
                    .build(),
            )
            .await
            .context("failed to connect to mysql")?;

            if matches!(config.command, Command::Migrate) {
                store.migrate().await.context("migration failed")?;
                info!("schema is up to date");
                return Ok(());
            }
            run(config, store).await
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_code(code: String) -> anyhow::Result<ShortCode> {
    ShortCode::new(code).context("invalid short code")
}

async fn run<S: Store>(config: CLI, store: S) -> anyhow::Result<()> {
    if !(3..=32).contains(&config.code_length) {
        bail!("code length must be between 3 and 32, got {}", config.code_length);
    }

    let redis = config
        .redis_url
        .as_ref()
        .map(|url| RedisCacheConfig::builder().url(url.as_str()).build());
    let SelectedCache { cache, kind } = connect_or_degrade(redis.as_ref()).await;

    let keys = match &config.cache_namespace {
        Some(namespace) => CacheKeys::with_namespace(namespace.as_str()),
        None => CacheKeys::new(),
    };

    let repository = CachedRepository::new(
        store,
        Arc::clone(&cache),
        AlphabetGenerator::new(config.code_length),
        RepositorySettings::builder()
            .max_retries(config.max_retries as usize)
            .keys(keys.clone())
            .build(),
    );

    match config.command {
        Command::Migrate => bail!("migrate needs --storage mysql"),
        Command::Shorten { url } => {
            let record = repository.create(&url).await?;
            println!("{}", record.short_code.to_url(&config.base_url));
            print_json(&record)?;
        }
        Command::Resolve { code } => {
            let record = repository.resolve(&parse_code(code)?).await?;
            print_json(&record)?;
        }
        Command::Lookup { url } => {
            let record = repository.find_by_url(&url).await?;
            print_json(&record)?;
        }
        Command::Click { code, times } => {
            let code = parse_code(code)?;
            // Fail fast on unknown codes instead of queueing doomed jobs.
            repository.resolve(&code).await?;

            let mode = match config.flush_interval_ms {
                0 => FlushMode::Immediate,
                ms => FlushMode::Batched {
                    interval: Duration::from_millis(ms),
                },
            };
            let reconciler = ClickReconciler::start(
                Arc::new(repository.clone()),
                ReconcilerConfig::builder()
                    .workers(config.reconciler_workers)
                    .queue_capacity(config.reconciler_queue)
                    .mode(mode)
                    .build(),
            );
            for _ in 0..times {
                reconciler.submit(code.clone());
            }
            let stats = reconciler.shutdown().await;

            print_json(&stats)?;
            print_json(&repository.resolve(&code).await?)?;
        }
        Command::Warmup { limit } => {
            let loaded = repository.warmup(limit).await?;
            println!("loaded {loaded} mappings into the cache");
        }
        Command::Health => {
            print_json(&repository.health().await)?;
        }
        Command::RateCheck { client, times } => {
            let counter: Arc<dyn WindowCounter> = match kind {
                CacheKind::Redis => Arc::new(CacheWindowCounter::new(cache, keys)),
                CacheKind::Disabled => Arc::new(LocalWindowCounter::default()),
            };
            let limiter = WindowRateLimiter::new(
                counter,
                RateLimitConfig::builder()
                    .limit(config.rate_limit)
                    .window(Duration::from_secs(config.rate_window_secs))
                    .build(),
            );

            for _ in 0..times {
                let decision = limiter.check(&client).await;
                let verdict = if decision.is_allowed() { "allowed" } else { "limited" };
                match decision.count() {
                    Some(count) => println!("{verdict} ({count}/{})", config.rate_limit),
                    None => println!("{verdict} (counter unavailable)"),
                }
            }
        }
    }

    Ok(())
}
