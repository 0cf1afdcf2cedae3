//! Batching Domain
//!
//! Pure pieces of the batch pipeline: the count-capped buffer, the adaptive
//! interval controller, the fallback policy and minimal path, and the
//! counters. Scheduling lives in the application layer.

pub mod adaptive;
pub mod fallback;
pub mod stats;
pub mod window;

pub use adaptive::{
    AdaptiveBatchingConfig, AdaptiveController, AdjustmentDirection, DynamicBatchingState,
    IntervalAdjustment, MIN_FLUSH_INTERVAL,
};
pub use fallback::{
    BatchClassification, FallbackDiagnostic, FallbackPolicy, FallbackReason, MinimalPathError,
    MinimalQuote, RecoverySelection, classify, minimal_frames, select_recovery_subset,
};
pub use stats::{BatchStats, BatchStatsRecorder, Stage};
pub use window::{Batch, BatchBuffer, FeedGroup, PushOutcome};
