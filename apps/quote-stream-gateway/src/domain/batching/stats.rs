//! Batch Statistics
//!
//! Monotonic counters written by the processing worker and read through
//! snapshots by `getInfo` and the health server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Pipeline stage timed per sub-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Transform collaborator call.
    Transform,
    /// Cache store.
    Cache,
    /// Registry fan-out.
    Broadcast,
}

impl Stage {
    /// Label value for metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transform => "transform",
            Self::Cache => "cache",
            Self::Broadcast => "broadcast",
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    /// Batches processed.
    pub total_batches: u64,
    /// Events processed.
    pub total_events: u64,
    /// Wall time spent processing batches.
    pub cumulative_processing_time_ms: u64,
    /// Batches routed to fallback.
    pub total_fallbacks: u64,
    /// Events the minimal path delivered.
    pub partial_recovery_successes: u64,
    /// Events the minimal path rejected.
    pub partial_recovery_failures: u64,
    /// Retry attempts after a first failure.
    pub total_retries: u64,
    /// Cumulative transform latency.
    pub transform_time_ms: u64,
    /// Cumulative cache latency.
    pub cache_time_ms: u64,
    /// Cumulative broadcast latency.
    pub broadcast_time_ms: u64,
}

/// Lock-free counter set.
#[derive(Debug, Default)]
pub struct BatchStatsRecorder {
    total_batches: AtomicU64,
    total_events: AtomicU64,
    processing_ms: AtomicU64,
    total_fallbacks: AtomicU64,
    partial_successes: AtomicU64,
    partial_failures: AtomicU64,
    total_retries: AtomicU64,
    transform_ms: AtomicU64,
    cache_ms: AtomicU64,
    broadcast_ms: AtomicU64,
}

impl BatchStatsRecorder {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a processed batch.
    pub fn record_batch(&self, events: usize, elapsed: Duration) {
        self.total_batches.fetch_add(1, Ordering::Relaxed);
        self.total_events
            .fetch_add(u64::try_from(events).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.processing_ms.fetch_add(millis(elapsed), Ordering::Relaxed);
    }

    /// Count a batch routed to fallback.
    pub fn record_fallback(&self) {
        self.total_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Count minimal-path outcomes.
    pub fn record_partial_recovery(&self, successes: usize, failures: usize) {
        self.partial_successes
            .fetch_add(u64::try_from(successes).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.partial_failures
            .fetch_add(u64::try_from(failures).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Count one retry attempt.
    pub fn record_retry(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Add stage latency.
    pub fn record_stage(&self, stage: Stage, elapsed: Duration) {
        let counter = match stage {
            Stage::Transform => &self.transform_ms,
            Stage::Cache => &self.cache_ms,
            Stage::Broadcast => &self.broadcast_ms,
        };
        counter.fetch_add(millis(elapsed), Ordering::Relaxed);
    }

    /// Copy current values.
    #[must_use]
    pub fn snapshot(&self) -> BatchStats {
        BatchStats {
            total_batches: self.total_batches.load(Ordering::Relaxed),
            total_events: self.total_events.load(Ordering::Relaxed),
            cumulative_processing_time_ms: self.processing_ms.load(Ordering::Relaxed),
            total_fallbacks: self.total_fallbacks.load(Ordering::Relaxed),
            partial_recovery_successes: self.partial_successes.load(Ordering::Relaxed),
            partial_recovery_failures: self.partial_failures.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            transform_time_ms: self.transform_ms.load(Ordering::Relaxed),
            cache_time_ms: self.cache_ms.load(Ordering::Relaxed),
            broadcast_time_ms: self.broadcast_ms.load(Ordering::Relaxed),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
