//! Asynchronous click reconciliation.
//!
//! Redirects must not wait on the durable store, so clicks are handed to a
//! [`ClickReconciler`]: a bounded queue drained by a fixed pool of workers.
//! Each click bumps the cache counter right away. The durable count is then
//! updated either per click ([`FlushMode::Immediate`]) or by periodically
//! flushing accumulated increments in one transaction
//! ([`FlushMode::Batched`]).
//!
//! The queue never grows past its capacity. A click submitted to a full
//! queue is dropped and counted, trading durable accuracy for bounded memory.

use async_trait::async_trait;
use burrow_core::error::Result;
use burrow_core::ShortCode;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use typed_builder::TypedBuilder;

/// Destination of reconciled clicks.
#[async_trait]
pub trait ClickSink: Send + Sync + 'static {
    /// Bumps the cache-resident counter. Best effort, never fails.
    async fn bump_cached_clicks(&self, code: &ShortCode);

    /// Durably records one click and returns the new count.
    async fn apply_click(&self, code: &ShortCode) -> Result<i64>;

    /// Durably applies accumulated increments as one unit.
    async fn flush_clicks(&self, increments: &HashMap<ShortCode, u64>) -> Result<()>;
}

/// When accumulated clicks reach the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Every click is written by the worker that dequeued it.
    Immediate,
    /// Clicks are summed per code and flushed every `interval`.
    Batched { interval: Duration },
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct ReconcilerConfig {
    #[builder(default = 10)]
    pub workers: usize,
    #[builder(default = 100)]
    pub queue_capacity: usize,
    /// Upper bound for one durable write or flush.
    #[builder(default = Duration::from_secs(5))]
    pub job_timeout: Duration,
    /// How long [`ClickReconciler::shutdown`] waits for queued jobs.
    #[builder(default = Duration::from_secs(5))]
    pub shutdown_deadline: Duration,
    #[builder(default = FlushMode::Immediate)]
    pub mode: FlushMode,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    flushed: AtomicU64,
    /// Clicks a worker has dequeued but not finished.
    in_flight: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ReconcilerStats {
        ReconcilerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters of a [`ClickReconciler`].
///
/// Once [`ClickReconciler::shutdown`] returns, every submitted click is
/// counted exactly once: `submitted == applied + failed + dropped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilerStats {
    /// Clicks offered to [`ClickReconciler::submit`].
    pub submitted: u64,
    /// Clicks rejected by a full queue, or discarded at shutdown while
    /// queued or in flight.
    pub dropped: u64,
    /// Clicks processed by a worker: written durably in immediate mode,
    /// accumulated for the next flush in batched mode. Increments lost by a
    /// failed final flush move from here to `failed`.
    pub applied: u64,
    /// Clicks whose durable write failed or timed out.
    pub failed: u64,
    /// Clicks written durably by batch flushes.
    pub flushed: u64,
}

/// Per-code increments waiting for the next batch flush.
type Pending = Arc<DashMap<ShortCode, u64>>;

#[derive(Clone)]
struct Worker {
    sink: Arc<dyn ClickSink>,
    counters: Arc<Counters>,
    pending: Option<Pending>,
    job_timeout: Duration,
}

impl Worker {
    async fn run(self, id: usize, jobs: Arc<Mutex<mpsc::Receiver<ShortCode>>>) {
        loop {
            let job = { jobs.lock().await.recv().await };
            let Some(code) = job else {
                break;
            };
            self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
            self.process(code).await;
            self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
        trace!(worker = id, "Click worker stopped");
    }

    async fn process(&self, code: ShortCode) {
        self.sink.bump_cached_clicks(&code).await;

        if let Some(pending) = &self.pending {
            *pending.entry(code).or_insert(0) += 1;
            self.counters.applied.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match timeout(self.job_timeout, self.sink.apply_click(&code)).await {
            Ok(Ok(clicks)) => {
                trace!(code = %code, clicks, "Click reconciled");
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                warn!(code = %code, error = %e, "Failed to reconcile click");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                warn!(code = %code, timeout = ?self.job_timeout, "Click reconciliation timed out");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Takes everything pending and writes it in one flush. On failure the
/// increments are merged back so the next flush retries them.
async fn flush_pending(
    sink: &dyn ClickSink,
    pending: &DashMap<ShortCode, u64>,
    counters: &Counters,
    job_timeout: Duration,
) -> bool {
    let codes: Vec<ShortCode> = pending.iter().map(|e| e.key().clone()).collect();
    let mut batch = HashMap::with_capacity(codes.len());
    for code in codes {
        if let Some((code, n)) = pending.remove(&code) {
            batch.insert(code, n);
        }
    }

    if batch.is_empty() {
        trace!("No clicks to flush");
        return true;
    }

    let total: u64 = batch.values().sum();
    let outcome = match timeout(job_timeout, sink.flush_clicks(&batch)).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("flush exceeded {job_timeout:?}")),
    };

    match outcome {
        Ok(()) => {
            debug!(codes = batch.len(), clicks = total, "Flushed click batch");
            counters.flushed.fetch_add(total, Ordering::Relaxed);
            true
        }
        Err(error) => {
            warn!(codes = batch.len(), clicks = total, error = %error, "Click flush failed, keeping batch");
            for (code, n) in batch {
                *pending.entry(code).or_insert(0) += n;
            }
            false
        }
    }
}

struct Flusher {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    pending: Pending,
}

/// Bounded worker pool reconciling clicks into a [`ClickSink`].
///
/// Must be started inside a Tokio runtime. [`ClickReconciler::submit`] takes
/// `&self`, so submitters can borrow it; [`ClickReconciler::shutdown`]
/// consumes it once they are done.
pub struct ClickReconciler {
    sender: mpsc::Sender<ShortCode>,
    jobs: Arc<Mutex<mpsc::Receiver<ShortCode>>>,
    workers: Vec<JoinHandle<()>>,
    flusher: Option<Flusher>,
    sink: Arc<dyn ClickSink>,
    counters: Arc<Counters>,
    config: ReconcilerConfig,
}

impl std::fmt::Debug for ClickReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickReconciler")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ClickReconciler {
    /// Spawns the worker pool, plus the flusher in batched mode.
    pub fn start(sink: Arc<dyn ClickSink>, config: ReconcilerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let jobs = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let flusher = match config.mode {
            FlushMode::Immediate => None,
            FlushMode::Batched { interval } => {
                let pending: Pending = Arc::new(DashMap::new());
                let (stop, mut stopped) = oneshot::channel();
                let handle = tokio::spawn({
                    let sink = Arc::clone(&sink);
                    let pending = Arc::clone(&pending);
                    let counters = Arc::clone(&counters);
                    let job_timeout = config.job_timeout;
                    async move {
                        let mut ticker = tokio::time::interval(interval);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        // The first tick completes immediately.
                        ticker.tick().await;
                        loop {
                            tokio::select! {
                                _ = ticker.tick() => {
                                    flush_pending(sink.as_ref(), &pending, &counters, job_timeout).await;
                                }
                                _ = &mut stopped => break,
                            }
                        }
                    }
                });
                Some(Flusher {
                    stop,
                    handle,
                    pending,
                })
            }
        };

        let worker = Worker {
            sink: Arc::clone(&sink),
            counters: Arc::clone(&counters),
            pending: flusher.as_ref().map(|f| Arc::clone(&f.pending)),
            job_timeout: config.job_timeout,
        };
        let workers = (0..config.workers.max(1))
            .map(|id| tokio::spawn(worker.clone().run(id, Arc::clone(&jobs))))
            .collect();

        info!(
            workers = config.workers.max(1),
            queue_capacity = config.queue_capacity.max(1),
            mode = ?config.mode,
            "Click reconciler started"
        );

        Self {
            sender,
            jobs,
            workers,
            flusher,
            sink,
            counters,
            config,
        }
    }

    /// Enqueues a click without waiting.
    ///
    /// Returns `false` when the queue is full and the click was dropped.
    pub fn submit(&self, code: ShortCode) -> bool {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        match self.sender.try_send(code) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(code)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(code = %code, "Click queue full, dropping click");
                false
            }
            Err(mpsc::error::TrySendError::Closed(code)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(code = %code, "Click queue closed, dropping click");
                false
            }
        }
    }

    /// Number of clicks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.counters.snapshot()
    }

    /// Flushes pending batched increments now. A no-op in immediate mode.
    pub async fn flush(&self) -> bool {
        match &self.flusher {
            Some(flusher) => {
                flush_pending(
                    self.sink.as_ref(),
                    &flusher.pending,
                    &self.counters,
                    self.config.job_timeout,
                )
                .await
            }
            None => true,
        }
    }

    /// Stops accepting clicks, drains the queue and flushes what is pending.
    ///
    /// Jobs still queued or in flight when the shutdown deadline passes are
    /// discarded and counted as dropped.
    pub async fn shutdown(self) -> ReconcilerStats {
        let Self {
            sender,
            jobs,
            mut workers,
            flusher,
            sink,
            counters,
            config,
        } = self;

        // Workers exit once the closed queue is empty.
        drop(sender);
        let deadline = Instant::now() + config.shutdown_deadline;

        let drained = timeout_at(deadline, async {
            while let Some(worker) = workers.last_mut() {
                let _ = worker.await;
                workers.pop();
            }
        })
        .await
        .is_ok();

        if !drained {
            for worker in &workers {
                worker.abort();
            }
            for worker in workers {
                let _ = worker.await;
            }

            // Aborted workers never finished their current click.
            let mut discarded = counters.in_flight.swap(0, Ordering::Relaxed);
            let mut jobs = jobs.lock().await;
            while jobs.try_recv().is_ok() {
                discarded += 1;
            }
            counters.dropped.fetch_add(discarded, Ordering::Relaxed);
            warn!(
                discarded,
                deadline = ?config.shutdown_deadline,
                "Shutdown deadline passed, discarded unfinished clicks"
            );
        }

        if let Some(Flusher {
            stop,
            handle,
            pending,
        }) = flusher
        {
            let _ = stop.send(());
            let _ = handle.await;

            if !flush_pending(sink.as_ref(), &pending, &counters, config.job_timeout).await {
                let lost: u64 = pending.iter().map(|e| *e.value()).sum();
                counters.applied.fetch_sub(lost, Ordering::Relaxed);
                counters.failed.fetch_add(lost, Ordering::Relaxed);
                warn!(clicks = lost, "Final click flush failed, increments lost");
            }
        }

        let stats = counters.snapshot();
        info!(
            submitted = stats.submitted,
            dropped = stats.dropped,
            applied = stats.applied,
            failed = stats.failed,
            flushed = stats.flushed,
            "Click reconciler stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::RepositoryError;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Semaphore;

    /// Records what reaches it. Can be made to fail or to block.
    #[derive(Default)]
    struct RecordingSink {
        bumps: DashMap<ShortCode, u64>,
        applied: DashMap<ShortCode, u64>,
        flushed: DashMap<ShortCode, u64>,
        flushes: AtomicU64,
        failing: AtomicBool,
        gate: Option<Arc<Semaphore>>,
    }

    impl RecordingSink {
        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::default()
            }
        }

        fn total(map: &DashMap<ShortCode, u64>) -> u64 {
            map.iter().map(|e| *e.value()).sum()
        }
    }

    #[async_trait]
    impl ClickSink for RecordingSink {
        async fn bump_cached_clicks(&self, code: &ShortCode) {
            *self.bumps.entry(code.clone()).or_insert(0) += 1;
        }

        async fn apply_click(&self, code: &ShortCode) -> Result<i64> {
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(RepositoryError::NotFound(code.to_string()));
            }
            let mut n = self.applied.entry(code.clone()).or_insert(0);
            *n += 1;
            Ok(*n as i64)
        }

        async fn flush_clicks(&self, increments: &HashMap<ShortCode, u64>) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(RepositoryError::Validation("store down".to_string()));
            }
            for (code, n) in increments {
                *self.flushed.entry(code.clone()).or_insert(0) += n;
            }
            Ok(())
        }
    }

    fn code(s: &str) -> ShortCode {
        ShortCode::new_unchecked(s)
    }

    #[tokio::test]
    async fn immediate_mode_applies_every_click() {
        let sink = Arc::new(RecordingSink::default());
        let reconciler = ClickReconciler::start(
            sink.clone(),
            ReconcilerConfig::builder().workers(4).build(),
        );

        for _ in 0..10 {
            assert!(reconciler.submit(code("abc123")));
        }
        let stats = reconciler.shutdown().await;

        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.applied, 10);
        assert_eq!(stats.dropped, 0);
        assert_eq!(*sink.applied.get(&code("abc123")).unwrap(), 10);
        assert_eq!(*sink.bumps.get(&code("abc123")).unwrap(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_drops_clicks() {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Arc::new(RecordingSink::gated(gate.clone()));
        let reconciler = ClickReconciler::start(
            sink.clone(),
            ReconcilerConfig::builder()
                .workers(1)
                .queue_capacity(2)
                .build(),
        );

        // The single worker takes the first click and blocks on the gate.
        assert!(reconciler.submit(code("abc123")));
        awaitility::at_most(Duration::from_secs(2))
            .poll_interval(Duration::from_millis(10))
            .until_async(|| async { sink.bumps.contains_key(&code("abc123")) })
            .await;

        assert!(reconciler.submit(code("abc123")));
        assert!(reconciler.submit(code("abc123")));
        assert_eq!(reconciler.queued(), 2);
        assert!(!reconciler.submit(code("abc123")));
        assert_eq!(reconciler.stats().dropped, 1);

        gate.add_permits(10);
        let stats = reconciler.shutdown().await;

        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.submitted, stats.applied + stats.failed + stats.dropped);
    }

    #[tokio::test]
    async fn failed_writes_are_counted() {
        let sink = Arc::new(RecordingSink::default());
        sink.failing.store(true, Ordering::SeqCst);
        let reconciler = ClickReconciler::start(sink.clone(), ReconcilerConfig::default());

        reconciler.submit(code("abc123"));
        reconciler.submit(code("abc123"));
        let stats = reconciler.shutdown().await;

        assert_eq!(stats.failed, 2);
        assert_eq!(stats.applied, 0);
        // The cache counter is still bumped.
        assert_eq!(*sink.bumps.get(&code("abc123")).unwrap(), 2);
    }

    #[tokio::test]
    async fn slow_writes_time_out() {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Arc::new(RecordingSink::gated(gate));
        let reconciler = ClickReconciler::start(
            sink.clone(),
            ReconcilerConfig::builder()
                .job_timeout(Duration::from_millis(20))
                .build(),
        );

        reconciler.submit(code("abc123"));
        let stats = reconciler.shutdown().await;

        assert_eq!(stats.failed, 1);
        assert!(sink.applied.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batched_mode_flushes_periodically() {
        let sink = Arc::new(RecordingSink::default());
        let reconciler = ClickReconciler::start(
            sink.clone(),
            ReconcilerConfig::builder()
                .mode(FlushMode::Batched {
                    interval: Duration::from_millis(50),
                })
                .build(),
        );

        for _ in 0..3 {
            reconciler.submit(code("aaa111"));
        }
        reconciler.submit(code("bbb222"));

        awaitility::at_most(Duration::from_secs(3))
            .poll_interval(Duration::from_millis(10))
            .until_async(|| async { RecordingSink::total(&sink.flushed) == 4 })
            .await;

        assert_eq!(*sink.flushed.get(&code("aaa111")).unwrap(), 3);
        assert_eq!(*sink.flushed.get(&code("bbb222")).unwrap(), 1);
        assert!(sink.applied.is_empty());

        let stats = reconciler.shutdown().await;
        assert_eq!(stats.flushed, 4);
        assert_eq!(stats.applied, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_flush_keeps_increments_for_next_flush() {
        let sink = Arc::new(RecordingSink::default());
        sink.failing.store(true, Ordering::SeqCst);
        let reconciler = ClickReconciler::start(
            sink.clone(),
            ReconcilerConfig::builder()
                .mode(FlushMode::Batched {
                    interval: Duration::from_secs(3600),
                })
                .build(),
        );

        reconciler.submit(code("abc123"));
        reconciler.submit(code("abc123"));
        awaitility::at_most(Duration::from_secs(2))
            .poll_interval(Duration::from_millis(10))
            .until_async(|| async { reconciler.stats().applied == 2 })
            .await;

        assert!(!reconciler.flush().await);
        assert!(sink.flushed.is_empty());

        reconciler.submit(code("abc123"));
        awaitility::at_most(Duration::from_secs(2))
            .poll_interval(Duration::from_millis(10))
            .until_async(|| async { reconciler.stats().applied == 3 })
            .await;

        sink.failing.store(false, Ordering::SeqCst);
        assert!(reconciler.flush().await);
        assert_eq!(*sink.flushed.get(&code("abc123")).unwrap(), 3);

        let stats = reconciler.shutdown().await;
        assert_eq!(stats.flushed, 3);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_batch() {
        let sink = Arc::new(RecordingSink::default());
        let reconciler = ClickReconciler::start(
            sink.clone(),
            ReconcilerConfig::builder()
                .mode(FlushMode::Batched {
                    interval: Duration::from_secs(3600),
                })
                .build(),
        );

        for _ in 0..5 {
            reconciler.submit(code("abc123"));
        }
        let stats = reconciler.shutdown().await;

        assert_eq!(stats.flushed, 5);
        assert_eq!(*sink.flushed.get(&code("abc123")).unwrap(), 5);
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_final_flush_counts_clicks_as_failed() {
        let sink = Arc::new(RecordingSink::default());
        sink.failing.store(true, Ordering::SeqCst);
        let reconciler = ClickReconciler::start(
            sink.clone(),
            ReconcilerConfig::builder()
                .mode(FlushMode::Batched {
                    interval: Duration::from_secs(3600),
                })
                .build(),
        );

        reconciler.submit(code("abc123"));
        reconciler.submit(code("abc123"));
        let stats = reconciler.shutdown().await;

        assert_eq!(stats.applied, 0);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.flushed, 0);
        assert_eq!(stats.submitted, stats.applied + stats.failed + stats.dropped);
    }

    #[tokio::test]
    async fn shutdown_deadline_discards_stuck_jobs() {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Arc::new(RecordingSink::gated(gate));
        let reconciler = ClickReconciler::start(
            sink.clone(),
            ReconcilerConfig::builder()
                .workers(1)
                .queue_capacity(4)
                .job_timeout(Duration::from_secs(60))
                .shutdown_deadline(Duration::from_millis(100))
                .build(),
        );

        for _ in 0..3 {
            assert!(reconciler.submit(code("abc123")));
        }

        let stats = tokio::time::timeout(Duration::from_secs(5), reconciler.shutdown())
            .await
            .expect("shutdown must respect its deadline");

        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.applied, 0);
        // two queued plus the one the aborted worker was holding
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.submitted, stats.applied + stats.failed + stats.dropped);
    }

    #[tokio::test]
    async fn applies_through_repository() {
        use crate::repository::{CachedRepository, RepositorySettings};
        use burrow_cache::InMemoryCache;
        use burrow_core::Shortener;
        use burrow_generator::AlphabetGenerator;
        use burrow_storage::InMemoryStore;

        let repo = CachedRepository::new(
            InMemoryStore::new(),
            Arc::new(InMemoryCache::new()),
            AlphabetGenerator::default(),
            RepositorySettings::default(),
        );
        let created = repo.create("https://example.com").await.unwrap();
        let reconciler = ClickReconciler::start(
            Arc::new(repo.clone()),
            ReconcilerConfig::builder()
                .mode(FlushMode::Batched {
                    interval: Duration::from_millis(20),
                })
                .build(),
        );

        for _ in 0..7 {
            reconciler.submit(created.short_code.clone());
        }
        reconciler.shutdown().await;

        let resolved = repo.resolve(&created.short_code).await.unwrap();
        assert_eq!(resolved.click_count, 7);
        assert_eq!(repo.cached_clicks(&created.short_code).await, Some(7));
    }
}
