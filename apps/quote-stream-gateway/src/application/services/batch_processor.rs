//! Batch Processor
//!
//! Turns the upstream event stream into client frames.
//!
//! Two tasks run per processor:
//!
//! - the **collector** buffers events, flushes on the (possibly adaptive)
//!   interval or when the count cap is hit, and retunes the interval;
//! - the **worker** processes flushed batches one at a time, so frames for
//!   a symbol leave in the order their batches were flushed.
//!
//! Within a batch, each (provider, capability) sub-group is transformed,
//! cached and broadcast concurrently. Failed sub-groups are retried with
//! exponential backoff under a circuit breaker; whatever still fails goes
//! to fallback.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::application::error::ErrorKind;
use crate::application::ports::{QuoteCache, QuoteTransformer, TransformError, quote_cache_key};
use crate::application::services::recovery::SharedReplayWindow;
use crate::domain::batching::{
    AdaptiveBatchingConfig, AdaptiveController, Batch, BatchBuffer, BatchStats,
    BatchStatsRecorder, DynamicBatchingState, FallbackDiagnostic, FallbackPolicy, FallbackReason,
    FeedGroup, PushOutcome, Stage, classify, minimal_frames, select_recovery_subset,
};
use crate::domain::resilience::{
    BackoffConfig, BackoffPolicy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot,
    CircuitState,
};
use crate::domain::streaming::{DataFrame, QuoteEvent};
use crate::domain::subscription::{BroadcastReport, SubscriptionRegistry};
use crate::infrastructure::metrics::{self, Outcome};

/// Flushed batches waiting for the worker.
const BATCH_QUEUE_CAPACITY: usize = 64;

/// Buffered fallback diagnostics per subscriber.
const DIAGNOSTIC_CAPACITY: usize = 256;

// =============================================================================
// Configuration
// =============================================================================

/// Processor settings.
#[derive(Debug, Clone)]
pub struct BatchProcessorConfig {
    /// Count cap per batch.
    pub max_batch_events: usize,
    /// Flush interval and its tuning.
    pub adaptive: AdaptiveBatchingConfig,
    /// Total attempts per sub-group, including the first.
    pub max_retry_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Transform breaker.
    pub breaker: CircuitBreakerConfig,
    /// Limit on one transform call.
    pub transform_timeout: Duration,
    /// Cache entry lifetime.
    pub cache_ttl: Duration,
    /// Partial recovery selection.
    pub fallback: FallbackPolicy,
}

impl Default for BatchProcessorConfig {
    fn default() -> Self {
        Self {
            max_batch_events: 200,
            adaptive: AdaptiveBatchingConfig::default(),
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            breaker: CircuitBreakerConfig::default(),
            transform_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(60),
            fallback: FallbackPolicy::default(),
        }
    }
}

/// Handles of the processor's tasks.
#[derive(Debug)]
pub struct BatchProcessorTasks {
    /// Buffering and tuning task.
    pub collector: JoinHandle<()>,
    /// Batch processing task.
    pub worker: JoinHandle<()>,
}

impl BatchProcessorTasks {
    /// Wait for both tasks. The worker finishes once the collector's final
    /// flush has been processed.
    pub async fn join(self) {
        if let Err(e) = self.collector.await {
            tracing::error!(error = %e, "Batch collector task failed");
        }
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "Batch worker task failed");
        }
    }
}

// =============================================================================
// Processor
// =============================================================================

/// The batch pipeline.
pub struct BatchProcessor {
    config: BatchProcessorConfig,
    registry: Arc<SubscriptionRegistry>,
    transformer: Arc<dyn QuoteTransformer>,
    cache: Arc<dyn QuoteCache>,
    replay: SharedReplayWindow,
    breaker: Mutex<CircuitBreaker>,
    batching_state: RwLock<DynamicBatchingState>,
    stats: BatchStatsRecorder,
    diagnostics: broadcast::Sender<FallbackDiagnostic>,
}

impl BatchProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        config: BatchProcessorConfig,
        registry: Arc<SubscriptionRegistry>,
        transformer: Arc<dyn QuoteTransformer>,
        cache: Arc<dyn QuoteCache>,
        replay: SharedReplayWindow,
    ) -> Arc<Self> {
        let breaker = CircuitBreaker::new("transform", config.breaker.clone());
        let batching_state = AdaptiveController::new(config.adaptive.clone()).state();
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);

        Arc::new(Self {
            config,
            registry,
            transformer,
            cache,
            replay,
            breaker: Mutex::new(breaker),
            batching_state: RwLock::new(batching_state),
            stats: BatchStatsRecorder::new(),
            diagnostics,
        })
    }

    /// Spawn the collector and worker.
    ///
    /// The collector stops when `cancel` fires or every event sender is
    /// dropped; it flushes what it holds before exiting.
    pub fn start(
        self: &Arc<Self>,
        events: mpsc::Receiver<QuoteEvent>,
        cancel: CancellationToken,
    ) -> BatchProcessorTasks {
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_QUEUE_CAPACITY);

        let collector = tokio::spawn(Arc::clone(self).run_collector(events, batch_tx, cancel));
        let worker = tokio::spawn(Arc::clone(self).run_worker(batch_rx));

        BatchProcessorTasks { collector, worker }
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> BatchStats {
        self.stats.snapshot()
    }

    /// Breaker snapshot.
    #[must_use]
    pub fn circuit_snapshot(&self) -> CircuitBreakerSnapshot {
        self.breaker.lock().snapshot(std::time::Instant::now())
    }

    /// Current breaker state.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().state(std::time::Instant::now())
    }

    /// Adaptive batching snapshot. Written by the collector; may lag.
    #[must_use]
    pub fn batching_state(&self) -> DynamicBatchingState {
        self.batching_state.read().clone()
    }

    /// Current flush interval in milliseconds.
    #[must_use]
    pub fn current_interval_ms(&self) -> u64 {
        self.batching_state.read().current_interval_ms
    }

    /// Receive fallback diagnostics.
    #[must_use]
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<FallbackDiagnostic> {
        self.diagnostics.subscribe()
    }

    // =========================================================================
    // Collector
    // =========================================================================

    async fn run_collector(
        self: Arc<Self>,
        mut events: mpsc::Receiver<QuoteEvent>,
        batches: mpsc::Sender<Batch>,
        cancel: CancellationToken,
    ) {
        let mut controller = AdaptiveController::new(self.config.adaptive.clone());
        let mut collector = Collector::new(self.config.max_batch_events, batches);

        let mut current = controller.current_interval();
        let mut flush_timer = interval_at(Instant::now() + current, current);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let period = controller.adjustment_period();
        let mut tune_timer = interval_at(Instant::now() + period, period);
        tune_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sample_started = Instant::now();

        metrics::set_batch_interval(current);
        tracing::info!(
            interval_ms = self.current_interval_ms(),
            dynamic = controller.is_enabled(),
            "Batch collector started"
        );

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                received = events.recv() => {
                    let Some(event) = received else {
                        tracing::info!("Event stream closed");
                        break;
                    };
                    if collector.push(event) == PushOutcome::Full {
                        collector.flush().await;
                    }
                }

                _ = flush_timer.tick() => collector.flush().await,

                _ = tune_timer.tick(), if controller.is_enabled() => {
                    let elapsed = sample_started.elapsed().as_secs_f64();
                    sample_started = Instant::now();
                    #[allow(clippy::cast_precision_loss)]
                    let load = if elapsed > 0.0 {
                        collector.take_flush_count() as f64 / elapsed
                    } else {
                        0.0
                    };

                    if let Some(adjustment) = controller.observe(load) {
                        // Old buffer drains before the new interval applies.
                        collector.swap_buffer().await;
                        current = adjustment.to;
                        flush_timer = interval_at(Instant::now() + current, current);
                        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

                        metrics::set_batch_interval(current);
                        metrics::record_interval_adjustment(adjustment.direction);
                        tracing::info!(
                            from_ms = u64::try_from(adjustment.from.as_millis()).unwrap_or(u64::MAX),
                            to_ms = u64::try_from(adjustment.to.as_millis()).unwrap_or(u64::MAX),
                            mean_load = adjustment.mean_load,
                            direction = adjustment.direction.as_str(),
                            "Batch interval adjusted"
                        );
                    }
                    *self.batching_state.write() = controller.state();
                }
            }
        }

        while let Ok(event) = events.try_recv() {
            if collector.push(event) == PushOutcome::Full {
                collector.flush().await;
            }
        }
        collector.flush().await;
        tracing::info!("Batch collector stopped");
    }

    // =========================================================================
    // Worker
    // =========================================================================

    async fn run_worker(self: Arc<Self>, mut batches: mpsc::Receiver<Batch>) {
        while let Some(batch) = batches.recv().await {
            self.process_batch(batch).await;
        }
        tracing::info!("Batch worker stopped");
    }

    /// Process one batch end to end.
    pub async fn process_batch(&self, batch: Batch) {
        let started = std::time::Instant::now();
        let batch_id = batch.id;
        let event_count = batch.len();

        let mut pending = batch.group_by_feed();
        let mut backoff = BackoffPolicy::new(BackoffConfig::batch_retry(
            self.config.retry_base_delay,
            self.config.max_retry_attempts.saturating_sub(1),
        ));
        let mut attempt: u32 = 0;

        let fallback_reason = loop {
            if !self.breaker.lock().permits(std::time::Instant::now()) {
                break Some(FallbackReason::CircuitOpen);
            }

            attempt += 1;
            if attempt > 1 {
                for group in &pending {
                    self.stats.record_retry();
                    metrics::record_retry(&group.feed);
                }
            }

            let results = join_all(pending.iter().map(|group| self.process_group(group))).await;

            let mut failed = Vec::new();
            let mut last_error = None;
            for (group, result) in pending.into_iter().zip(results) {
                if let Err(e) = result {
                    tracing::warn!(
                        batch_id,
                        feed = %group.feed,
                        attempt,
                        events = group.events.len(),
                        error = %e,
                        "Sub-group processing failed"
                    );
                    last_error = Some(e.to_string());
                    failed.push(group);
                }
            }
            pending = failed;

            {
                let mut breaker = self.breaker.lock();
                let now = std::time::Instant::now();
                if pending.is_empty() {
                    breaker.record_success(now);
                } else {
                    breaker.record_failure(now);
                }
                metrics::set_circuit_state(breaker.state(now));
            }

            if pending.is_empty() {
                break None;
            }
            metrics::record_error(ErrorKind::TransformFailure);

            if attempt >= self.config.max_retry_attempts.max(1) {
                break Some(FallbackReason::RetriesExhausted {
                    attempts: attempt,
                    last_error: last_error.unwrap_or_default(),
                });
            }

            let Some(delay) = backoff.next_delay() else {
                break Some(FallbackReason::RetriesExhausted {
                    attempts: attempt,
                    last_error: last_error.unwrap_or_default(),
                });
            };
            tracing::debug!(
                batch_id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying failed sub-groups"
            );
            tokio::time::sleep(delay).await;
        };

        if let Some(reason) = fallback_reason {
            self.fallback(batch_id, pending, reason);
        }

        let elapsed = started.elapsed();
        self.stats.record_batch(event_count, elapsed);
        metrics::record_batch(event_count, elapsed);
        tracing::debug!(
            batch_id,
            events = event_count,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Batch processed"
        );
    }

    async fn process_group(&self, group: &FeedGroup) -> Result<(), TransformError> {
        let selector = group.feed.rule_selector();

        let transform_started = std::time::Instant::now();
        let quotes = tokio::time::timeout(
            self.config.transform_timeout,
            self.transformer.transform(&selector, &group.events),
        )
        .await
        .map_err(|_| TransformError::Timeout(self.config.transform_timeout))??;
        self.record_stage(Stage::Transform, transform_started.elapsed());

        let cache_started = std::time::Instant::now();
        let stores = quotes.iter().map(|quote| async move {
            let key = quote_cache_key(&quote.provider, &quote.symbol);
            if let Err(e) = self.cache.store(&key, quote, self.config.cache_ttl).await {
                tracing::warn!(key, error = %e, "Quote cache store failed");
            }
        });
        join_all(stores).await;
        self.record_stage(Stage::Cache, cache_started.elapsed());

        let broadcast_started = std::time::Instant::now();
        let mut report = BroadcastReport::default();
        for quote in &quotes {
            report.merge(self.deliver(DataFrame::from_canonical(quote)));
        }
        self.record_stage(Stage::Broadcast, broadcast_started.elapsed());
        record_delivery(&report);

        Ok(())
    }

    fn record_stage(&self, stage: Stage, elapsed: Duration) {
        self.stats.record_stage(stage, elapsed);
        metrics::record_stage_latency(stage, elapsed);
    }

    /// Record a live frame for replay and fan it out.
    fn deliver(&self, frame: DataFrame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for symbol in &frame.symbols {
            report.merge(self.registry.broadcast(symbol, &frame));
        }
        self.replay.lock().record(frame, Utc::now());
        report
    }

    // =========================================================================
    // Fallback
    // =========================================================================

    fn fallback(&self, batch_id: u64, groups: Vec<FeedGroup>, reason: FallbackReason) {
        self.stats.record_fallback();
        metrics::record_fallback(&reason);
        if reason == FallbackReason::CircuitOpen {
            metrics::record_error(ErrorKind::CircuitOpen);
        }

        let events: Vec<QuoteEvent> = groups.into_iter().flat_map(|g| g.events).collect();
        let classification = classify(&events, std::time::Instant::now(), &self.config.fallback);
        let selection = select_recovery_subset(&events, &classification, &self.config.fallback);
        let attempted = selection.events.len();

        let mut recovered = 0;
        let mut failed = 0;
        let mut report = BroadcastReport::default();
        for event in selection.events {
            match minimal_frames(event) {
                Ok(frames) => {
                    recovered += 1;
                    for frame in frames {
                        report.merge(self.deliver(frame));
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        batch_id,
                        feed = %event.feed(),
                        error = %e,
                        "Minimal path rejected event"
                    );
                    failed += 1;
                }
            }
        }
        record_delivery(&report);

        self.stats.record_partial_recovery(recovered, failed);
        metrics::record_partial_recovery(Outcome::Success, recovered);
        metrics::record_partial_recovery(Outcome::Failure, failed);

        tracing::warn!(
            batch_id,
            reason = reason.as_str(),
            events = classification.event_count,
            symbols = classification.symbol_count,
            markets = classification.distinct_markets,
            average_age_ms = classification.average_age_ms,
            oversized = classification.oversized,
            by_priority = selection.by_priority,
            recovered,
            failed,
            "Batch routed to fallback"
        );

        let diagnostic = FallbackDiagnostic {
            batch_id,
            reason,
            classification,
            attempted,
            recovered,
            failed,
            by_priority: selection.by_priority,
            at: Utc::now(),
        };
        // No subscribers is normal.
        let _ = self.diagnostics.send(diagnostic);
    }
}

fn record_delivery(report: &BroadcastReport) {
    if report.delivered > 0 {
        metrics::record_frames_sent(report.delivered);
    }
    if report.dropped > 0 {
        metrics::record_frames_dropped(report.dropped);
    }
}

// =============================================================================
// Collector State
// =============================================================================

struct Collector {
    buffer: BatchBuffer,
    max_events: usize,
    next_id: u64,
    flushed: u64,
    batches: mpsc::Sender<Batch>,
}

impl Collector {
    fn new(max_events: usize, batches: mpsc::Sender<Batch>) -> Self {
        Self {
            buffer: BatchBuffer::new(max_events),
            max_events,
            next_id: 0,
            flushed: 0,
            batches,
        }
    }

    fn push(&mut self, event: QuoteEvent) -> PushOutcome {
        metrics::record_event_received(&event.feed());
        self.buffer.push(event)
    }

    async fn flush(&mut self) {
        let id = self.next_id;
        if let Some(batch) = self.buffer.take(id) {
            self.dispatch(batch).await;
        }
    }

    async fn swap_buffer(&mut self) {
        let leftover = self.buffer.swap(BatchBuffer::new(self.max_events));
        if !leftover.is_empty() {
            self.dispatch(Batch::new(self.next_id, leftover)).await;
        }
    }

    async fn dispatch(&mut self, batch: Batch) {
        self.next_id += 1;
        self.flushed += 1;
        if self.batches.send(batch).await.is_err() {
            tracing::error!("Batch worker gone, dropping batch");
        }
    }

    fn take_flush_count(&mut self) -> u64 {
        std::mem::take(&mut self.flushed)
    }
}

// =============================================================================
// Tests
// =============================================================================
